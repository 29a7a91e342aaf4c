use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::security::command_policy::{DEFAULT_ALLOWED_COMMANDS, DEFAULT_DENIED_PATTERNS};

const ENV_PREFIX: &str = "ACTION_GATEWAY_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_bind")]
    pub bind: String,
    #[serde(default = "default_max_pending_tasks")]
    pub max_pending_tasks: usize,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            max_pending_tasks: default_max_pending_tasks(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default = "default_create_root")]
    pub create_root: bool,
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_denied_patterns")]
    pub denied_patterns: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            create_root: default_create_root(),
            allowed_commands: default_allowed_commands(),
            denied_patterns: default_denied_patterns(),
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_api_key")]
    pub api_key: String,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_model_base_url(),
            api_key: default_model_api_key(),
            temperature: 0.0,
            max_steps: default_max_steps(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_search_max_results")]
    pub max_results: usize,
    #[serde(default = "default_search_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_search_endpoint(),
            max_results: default_search_max_results(),
            timeout_secs: default_search_timeout_secs(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides(|key| env::var(key).ok());
        cfg.absolutize_root()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, root: Option<&Path>, bind: Option<&str>) -> Result<()> {
        if let Some(root) = root {
            self.sandbox.root_dir = root.to_path_buf();
            self.absolutize_root()?;
        }
        if let Some(bind) = bind {
            self.server.bind = bind.trim().to_owned();
        }
        self.validate()
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("ROOT_DIR") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.sandbox.root_dir = PathBuf::from(trimmed);
            }
        }
        if let Some(v) = var("BIND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.server.bind = trimmed.to_owned();
            }
        }
        if let Some(v) = var("MODEL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.agent.model = trimmed.to_owned();
            }
        }
        if let Some(v) = var("MODEL_BASE_URL") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.agent.base_url = trimmed.to_owned();
            }
        }
        if let Some(v) = var("MODEL_API_KEY") {
            self.agent.api_key = v.trim().to_owned();
        }
        if let Some(v) = var("MAX_STEPS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                self.agent.max_steps = n;
            }
        }
        if let Some(v) = var("DEFAULT_TIMEOUT_SECS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.sandbox.default_timeout_secs = n;
            }
        }
        if let Some(v) = var("ALLOWED_COMMANDS") {
            self.sandbox.allowed_commands = split_csv(&v);
        }
        if let Some(v) = var("SEARCH_ENABLED") {
            self.search.enabled = parse_bool(&v);
        }
    }

    fn absolutize_root(&mut self) -> Result<()> {
        if self.sandbox.root_dir.is_relative() {
            let cwd = env::current_dir().context("failed reading current directory")?;
            self.sandbox.root_dir = cwd.join(&self.sandbox.root_dir);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server.bind.trim().is_empty() {
            anyhow::bail!("server.bind must not be empty");
        }
        if self.server.max_pending_tasks == 0 {
            anyhow::bail!("server.max_pending_tasks must be > 0");
        }
        if self.server.event_queue_capacity == 0 {
            anyhow::bail!("server.event_queue_capacity must be > 0");
        }
        if self.sandbox.default_timeout_secs == 0 {
            anyhow::bail!("sandbox.default_timeout_secs must be > 0");
        }
        if self.sandbox.default_timeout_secs > self.sandbox.max_timeout_secs {
            anyhow::bail!(
                "sandbox.default_timeout_secs ({}) must not exceed sandbox.max_timeout_secs ({})",
                self.sandbox.default_timeout_secs,
                self.sandbox.max_timeout_secs
            );
        }
        if self.sandbox.allowed_commands.is_empty() {
            anyhow::bail!("sandbox.allowed_commands must not be empty");
        }
        if self.agent.max_steps == 0 {
            anyhow::bail!("agent.max_steps must be > 0");
        }
        if self.search.enabled && self.search.endpoint.trim().is_empty() {
            anyhow::bail!("search.endpoint must not be empty when search is enabled");
        }
        Ok(())
    }
}

fn split_csv(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_server_bind() -> String {
    "127.0.0.1:9000".to_owned()
}

fn default_max_pending_tasks() -> usize {
    4
}

fn default_event_queue_capacity() -> usize {
    256
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("workspace")
}

fn default_create_root() -> bool {
    true
}

fn default_allowed_commands() -> Vec<String> {
    DEFAULT_ALLOWED_COMMANDS
        .iter()
        .map(|value| (*value).to_owned())
        .collect()
}

fn default_denied_patterns() -> Vec<String> {
    DEFAULT_DENIED_PATTERNS
        .iter()
        .map(|value| (*value).to_owned())
        .collect()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_timeout_secs() -> u64 {
    300
}

fn default_max_output_chars() -> usize {
    16_000
}

fn default_model() -> String {
    "gemma-2-2b-it".to_owned()
}

fn default_model_base_url() -> String {
    "http://localhost:1234/v1".to_owned()
}

fn default_model_api_key() -> String {
    "lm-studio".to_owned()
}

fn default_max_steps() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_search_endpoint() -> String {
    "https://api.duckduckgo.com/".to_owned()
}

fn default_search_max_results() -> usize {
    5
}

fn default_search_timeout_secs() -> u64 {
    15
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::Config;

    fn temp_path(tag: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        path.push(format!("action-gateway-config-{tag}-{stamp}"));
        path
    }

    #[test]
    fn missing_file_yields_absolute_defaults() {
        let cfg = Config::load(&temp_path("absent").join("action-gateway.toml")).expect("load");
        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.server.max_pending_tasks, 4);
        assert_eq!(cfg.agent.max_steps, 5);
        assert_eq!(cfg.agent.base_url, "http://localhost:1234/v1");
        assert!(cfg.sandbox.root_dir.is_absolute());
        assert!(cfg.sandbox.allowed_commands.iter().any(|cmd| cmd == "rm"));
        assert!(!cfg.search.enabled);
    }

    #[test]
    fn partial_toml_keeps_section_defaults() {
        let dir = temp_path("partial");
        std::fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("action-gateway.toml");
        std::fs::write(
            &path,
            "[sandbox]\nroot_dir = \"/srv/site\"\nmax_timeout_secs = 60\n\n[search]\nenabled = true\n",
        )
        .expect("write config");
        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.sandbox.root_dir, Path::new("/srv/site"));
        assert_eq!(cfg.sandbox.max_timeout_secs, 60);
        assert_eq!(cfg.sandbox.default_timeout_secs, 30);
        assert!(cfg.search.enabled);
        assert_eq!(cfg.search.max_results, 5);
    }

    #[test]
    fn env_overrides_use_the_prefix() {
        let vars = HashMap::from([
            ("ACTION_GATEWAY_BIND", "0.0.0.0:9100"),
            ("ACTION_GATEWAY_ALLOWED_COMMANDS", "ls, cat ,,"),
            ("ACTION_GATEWAY_MAX_STEPS", "8"),
            ("ACTION_GATEWAY_SEARCH_ENABLED", "yes"),
            ("ACTION_GATEWAY_MODEL_API_KEY", " "),
            ("OTHER_BIND", "ignored"),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides(|key| vars.get(key).map(|value| (*value).to_owned()));
        assert_eq!(cfg.server.bind, "0.0.0.0:9100");
        assert_eq!(cfg.sandbox.allowed_commands, vec!["ls", "cat"]);
        assert_eq!(cfg.agent.max_steps, 8);
        assert!(cfg.search.enabled);
        assert_eq!(cfg.agent.api_key, "");
    }

    #[test]
    fn validation_rejects_inconsistent_values() {
        let mut cfg = Config::default();
        cfg.sandbox.default_timeout_secs = 600;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.agent.max_steps = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.sandbox.allowed_commands.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        assert!(cfg.apply_cli_overrides(None, Some("  ")).is_err());
    }

    #[test]
    fn cli_root_override_is_made_absolute() {
        let mut cfg = Config::default();
        cfg.apply_cli_overrides(Some(Path::new("site")), Some("127.0.0.1:9200"))
            .expect("override");
        assert!(cfg.sandbox.root_dir.is_absolute());
        assert!(cfg.sandbox.root_dir.ends_with("site"));
        assert_eq!(cfg.server.bind, "127.0.0.1:9200");
    }
}
