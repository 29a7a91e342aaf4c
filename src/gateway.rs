use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::args::parse_action_input;
use crate::config::Config;
use crate::file_actions::FileActions;
use crate::process_executor::ProcessExecutor;
use crate::search::{DuckDuckGoSearch, SearchProvider};
use crate::security::{CommandPolicy, PathGuard};
use crate::types::{ActionError, ActionResult, ArgumentMap};

const POSITIONAL_KEY: &str = "input";
const DEFAULT_NEW_FILE: &str = "new_file.txt";
const DEFAULT_RENAME_SUFFIX: &str = "_one";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionName {
    DeleteFile,
    RenameFile,
    RenameAll,
    RunCommand,
    CreateFile,
    WriteFile,
    ReadFile,
    ListFiles,
    FileExists,
    ShowRoot,
    WebSearch,
}

impl ActionName {
    pub const ALL: [ActionName; 11] = [
        ActionName::DeleteFile,
        ActionName::RenameFile,
        ActionName::RenameAll,
        ActionName::RunCommand,
        ActionName::CreateFile,
        ActionName::WriteFile,
        ActionName::ReadFile,
        ActionName::ListFiles,
        ActionName::FileExists,
        ActionName::ShowRoot,
        ActionName::WebSearch,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Self::DeleteFile => "delete_file",
            Self::RenameFile => "rename_file",
            Self::RenameAll => "rename_all",
            Self::RunCommand => "run_command",
            Self::CreateFile => "create_file",
            Self::WriteFile => "write_file",
            Self::ReadFile => "read_file",
            Self::ListFiles => "list_files",
            Self::FileExists => "file_exists",
            Self::ShowRoot => "show_root",
            Self::WebSearch => "web_search",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::DeleteFile => "Delete File",
            Self::RenameFile => "Rename File",
            Self::RenameAll => "Rename Files",
            Self::RunCommand => "Execute Terminal Command",
            Self::CreateFile => "Create File",
            Self::WriteFile => "Write File",
            Self::ReadFile => "Read File",
            Self::ListFiles => "List Files",
            Self::FileExists => "File Exists",
            Self::ShowRoot => "Show Current Directory",
            Self::WebSearch => "Search Online",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::DeleteFile => "Delete a single file inside the working directory.",
            Self::RenameFile => "Rename or move one file inside the working directory.",
            Self::RenameAll => {
                "Append a suffix to the name of every file in the working directory."
            }
            Self::RunCommand => {
                "Run an allow-listed terminal command (ls, mv, cp, pwd, echo, mkdir, touch, cat, find, basename, dirname, rm)."
            }
            Self::CreateFile => "Create an empty file, replacing any existing one.",
            Self::WriteFile => "Write text to a file, replacing its previous content.",
            Self::ReadFile => "Read the full text of a file.",
            Self::ListFiles => "List the entries of the working directory.",
            Self::FileExists => "Check whether a file exists.",
            Self::ShowRoot => "Show the absolute path of the working directory.",
            Self::WebSearch => "Search the web and return short result snippets.",
        }
    }

    pub fn usage(self) -> &'static str {
        match self {
            Self::DeleteFile => "filepath=example.txt",
            Self::RenameFile => "old_name=old.txt, new_name=new.txt",
            Self::RenameAll => "suffix=_new",
            Self::RunCommand => "command='ls -l', cwd=optional/subdir, timeout=30",
            Self::CreateFile => "filename=example.txt",
            Self::WriteFile => "filepath=example.txt, content='Hello World'",
            Self::ReadFile => "filepath=example.txt",
            Self::ListFiles => "no input needed",
            Self::FileExists => "filepath=example.txt",
            Self::ShowRoot => "no input needed",
            Self::WebSearch => "query='rust async book'",
        }
    }

    /// Matches an id or a display name, ignoring case and treating spaces,
    /// hyphens and underscores alike.
    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = normalize_name(raw);
        if wanted.is_empty() {
            return None;
        }
        Self::ALL.into_iter().find(|action| {
            normalize_name(action.id()) == wanted || normalize_name(action.display_name()) == wanted
        })
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

fn normalize_name(raw: &str) -> String {
    raw.trim()
        .trim_matches(|ch| ch == '"' || ch == '\'' || ch == '`')
        .split(|ch: char| ch.is_whitespace() || ch == '-' || ch == '_')
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_lowercase)
        .collect::<Vec<_>>()
        .join("_")
}

/// Single entry point through which an agent run touches the outside world.
///
/// Every call answers with a string; failures are rendered, never returned.
#[derive(Clone)]
pub struct ActionGateway {
    files: FileActions,
    executor: ProcessExecutor,
    search: Option<Arc<dyn SearchProvider>>,
}

impl fmt::Debug for ActionGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionGateway")
            .field("root", &self.files.root())
            .field("search", &self.search.is_some())
            .finish()
    }
}

impl ActionGateway {
    pub fn new(
        files: FileActions,
        executor: ProcessExecutor,
        search: Option<Arc<dyn SearchProvider>>,
    ) -> Self {
        Self {
            files,
            executor,
            search,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let sandbox = &config.sandbox;
        let guard = PathGuard::new(&sandbox.root_dir).map_err(anyhow::Error::new)?;
        let policy = CommandPolicy::new(
            sandbox.allowed_commands.iter().cloned(),
            sandbox.denied_patterns.iter().cloned(),
        );
        let executor = ProcessExecutor::new(
            guard.clone(),
            policy,
            sandbox.default_timeout_secs,
            sandbox.max_timeout_secs,
            sandbox.max_output_chars,
        );
        let search = if config.search.enabled {
            let provider = DuckDuckGoSearch::new(&config.search)
                .context("failed building web search client")?;
            Some(Arc::new(provider) as Arc<dyn SearchProvider>)
        } else {
            None
        };
        Ok(Self::new(FileActions::new(guard), executor, search))
    }

    pub fn files(&self) -> &FileActions {
        &self.files
    }

    /// One line per action, in the shape the agent prompt lists tools.
    pub fn catalogue(&self) -> String {
        ActionName::ALL
            .into_iter()
            .map(|action| {
                format!(
                    "- {}: {} Input: {}",
                    action.display_name(),
                    action.description(),
                    action.usage()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn execute(&self, name: &str, raw_input: &str) -> String {
        let Some(action) = ActionName::parse(name) else {
            let available = ActionName::ALL
                .into_iter()
                .map(ActionName::display_name)
                .collect::<Vec<_>>()
                .join(", ");
            return ActionError::invalid_argument(format!(
                "unknown action `{}`. Available actions: {available}",
                name.trim()
            ))
            .to_string();
        };

        info!("action {action} invoked");
        let args = parse_action_input(raw_input);
        match self.dispatch(action, raw_input, &args).await {
            Ok(output) => output,
            Err(err) => {
                debug!("action {action} failed ({}): {}", err.kind.as_str(), err.message);
                err.to_string()
            }
        }
    }

    async fn dispatch(
        &self,
        action: ActionName,
        raw_input: &str,
        args: &ArgumentMap,
    ) -> ActionResult<String> {
        match action {
            ActionName::DeleteFile => {
                let path = required_param(args, "filepath")?;
                self.blocking(move |files| files.delete(&path)).await
            }
            ActionName::RenameFile => {
                let old_name = named_param(args, "old_name")?;
                let new_name = named_param(args, "new_name")?;
                self.blocking(move |files| files.rename(&old_name, &new_name))
                    .await
            }
            ActionName::RenameAll => {
                let suffix = optional_param(args, "suffix")
                    .unwrap_or_else(|| DEFAULT_RENAME_SUFFIX.to_owned());
                self.blocking(move |files| files.rename_all(&suffix)).await
            }
            ActionName::RunCommand => self.run_command(args).await,
            ActionName::CreateFile => {
                let filename = optional_param(args, "filename")
                    .unwrap_or_else(|| DEFAULT_NEW_FILE.to_owned());
                self.blocking(move |files| files.create(&filename)).await
            }
            ActionName::WriteFile => {
                let path = named_param(args, "filepath")?;
                let content = args.get("content").cloned().unwrap_or_default();
                self.blocking(move |files| files.write(&path, &content))
                    .await
            }
            ActionName::ReadFile => {
                let path = required_param(args, "filepath")?;
                self.blocking(move |files| files.read(&path)).await
            }
            ActionName::ListFiles => self.blocking(|files| files.list()).await,
            ActionName::FileExists => {
                let path = required_param(args, "filepath")?;
                self.blocking(move |files| files.exists(&path)).await
            }
            ActionName::ShowRoot => Ok(self.files.show_root()),
            ActionName::WebSearch => {
                let query = args
                    .get("query")
                    .cloned()
                    .unwrap_or_else(|| raw_input.trim().to_owned());
                self.web_search(&query).await
            }
        }
    }

    async fn run_command(&self, args: &ArgumentMap) -> ActionResult<String> {
        let command = required_param(args, "command")?;
        let requested = match args.get("timeout").map(|value| value.trim()) {
            Some(raw) => Some(parse_timeout(raw)?),
            None => None,
        };
        let timeout_secs = self.executor.effective_timeout(requested);
        let cwd = args.get("cwd").map(String::as_str);
        let result = self.executor.run(&command, cwd, timeout_secs).await?;
        if let Some(kind) = result.error_kind() {
            debug!("command `{command}` ended as {}", kind.as_str());
        }
        Ok(self.executor.describe(&result, timeout_secs))
    }

    async fn web_search(&self, query: &str) -> ActionResult<String> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ActionError::invalid_argument("query required"));
        }
        let Some(search) = &self.search else {
            return Err(ActionError::invalid_argument("web search is not configured"));
        };
        search
            .search(query)
            .await
            .map_err(|err| ActionError::io(format!("web search failed: {err:#}")))
    }

    async fn blocking<F>(&self, operation: F) -> ActionResult<String>
    where
        F: FnOnce(&FileActions) -> String + Send + 'static,
    {
        let files = self.files.clone();
        tokio::task::spawn_blocking(move || operation(&files))
            .await
            .map_err(|err| ActionError::io(format!("file action worker failed: {err}")))
    }
}

fn parse_timeout(raw: &str) -> ActionResult<u64> {
    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ActionError::invalid_argument(format!(
            "timeout must be a positive integer, got `{raw}`"
        ))),
    }
}

/// Named parameter, falling back to the positional input for
/// single-parameter actions.
fn optional_param(args: &ArgumentMap, key: &str) -> Option<String> {
    args.get(key)
        .or_else(|| {
            if args.len() == 1 {
                args.get(POSITIONAL_KEY)
            } else {
                None
            }
        })
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_param(args: &ArgumentMap, key: &str) -> ActionResult<String> {
    optional_param(args, key)
        .ok_or_else(|| ActionError::invalid_argument(format!("missing required parameter `{key}`")))
}

fn named_param(args: &ArgumentMap, key: &str) -> ActionResult<String> {
    args.get(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ActionError::invalid_argument(format!("missing required parameter `{key}`")))
}
