mod agent;
mod args;
mod config;
mod event_bridge;
mod file_actions;
mod gateway;
mod gateway_server;
mod process_executor;
mod runtime;
mod search;
mod security;
mod session;
mod types;

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use gateway::ActionGateway;
use security::CommandPolicy;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(
    author,
    version,
    about = "Sandboxed file and command gateway for a local tool-using agent"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "ACTION_GATEWAY_CONFIG",
        default_value = "action-gateway.toml"
    )]
    config: PathBuf,

    /// Override the sandbox root directory.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Override the observer listen address.
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "ACTION_GATEWAY_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Serve the observer WebSocket endpoint.
    Serve,
    /// Run a single action through the gateway and print its result.
    Action(ActionArgs),
    /// Check a command line against the command policy.
    CheckCommand(CheckCommandArgs),
    /// Run non-interactive diagnostics.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args)]
struct ActionArgs {
    /// Action id or display name, e.g. `read_file` or "Read File".
    name: String,
    /// Raw action input, e.g. "filepath=index.html".
    #[arg(default_value = "")]
    input: String,
}

#[derive(Debug, Clone, Args)]
struct CheckCommandArgs {
    /// Command line to evaluate.
    command: String,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Serve);
    match command {
        CliCommand::Serve => run_server(&cli).await,
        CliCommand::Action(args) => run_action(&cli, args).await,
        CliCommand::CheckCommand(args) => run_check_command(&cli, args),
        CliCommand::Doctor(args) => run_doctor(&cli, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.root.as_deref(), cli.bind.as_deref())?;
    Ok(cfg)
}

async fn run_server(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    runtime::GatewayRuntime::new(cfg).run().await
}

async fn run_action(cli: &Cli, args: ActionArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    runtime::prepare_root(&cfg).await?;
    let gateway = ActionGateway::from_config(&cfg)?;
    println!("{}", gateway.execute(&args.name, &args.input).await);
    Ok(())
}

fn run_check_command(cli: &Cli, args: CheckCommandArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let policy = CommandPolicy::new(
        cfg.sandbox.allowed_commands.iter().cloned(),
        cfg.sandbox.denied_patterns.iter().cloned(),
    );
    let verdict = policy.evaluate(&args.command);
    if verdict.is_permitted() {
        println!("permitted");
        return Ok(());
    }
    println!("denied: {verdict}");
    Err(anyhow!("command denied by policy"))
}

fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = load_config(cli).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, &cli.config, shell_available());
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
    shell_available: bool,
) -> DoctorReport {
    let mut checks = Vec::new();

    match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: if config_path.exists() {
                    format!("loaded {}", config_path.display())
                } else {
                    format!("{} not found, using defaults", config_path.display())
                },
                detail: None,
            });

            let root = &cfg.sandbox.root_dir;
            let (status, message) = if root.is_dir() {
                ("pass", format!("{} exists", root.display()))
            } else if root.exists() {
                ("fail", format!("{} is not a directory", root.display()))
            } else if cfg.sandbox.create_root {
                ("warn", format!("{} will be created on start", root.display()))
            } else {
                ("fail", format!("{} does not exist", root.display()))
            };
            checks.push(DoctorCheck {
                id: "sandbox.root".to_owned(),
                status: status.to_owned(),
                message,
                detail: None,
            });

            checks.push(DoctorCheck {
                id: "sandbox.commands".to_owned(),
                status: "pass".to_owned(),
                message: cfg.sandbox.allowed_commands.join(","),
                detail: Some(format!(
                    "timeout default={}s max={}s",
                    cfg.sandbox.default_timeout_secs, cfg.sandbox.max_timeout_secs
                )),
            });

            checks.push(DoctorCheck {
                id: "agent.endpoint".to_owned(),
                status: "pass".to_owned(),
                message: cfg.agent.base_url.clone(),
                detail: Some(format!(
                    "model={} max_steps={}",
                    cfg.agent.model, cfg.agent.max_steps
                )),
            });

            checks.push(DoctorCheck {
                id: "search.provider".to_owned(),
                status: "pass".to_owned(),
                message: if cfg.search.enabled {
                    format!("enabled ({})", cfg.search.endpoint)
                } else {
                    "disabled".to_owned()
                },
                detail: None,
            });
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
        }
    }

    checks.push(DoctorCheck {
        id: "shell.binary".to_owned(),
        status: if shell_available { "pass" } else { "fail" }.to_owned(),
        message: if shell_available {
            "shell is available".to_owned()
        } else {
            "shell is not available".to_owned()
        },
        detail: Some("required by run_command".to_owned()),
    });

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn shell_available() -> bool {
    let mut command = if cfg!(windows) {
        let mut builder = Command::new("cmd");
        builder.args(["/C", "exit 0"]);
        builder
    } else {
        let mut builder = Command::new("sh");
        builder.args(["-c", "true"]);
        builder
    };
    command
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_to_serve() {
        let cli = Cli::parse_from(["action-gateway"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("action-gateway.toml"));
    }

    #[test]
    fn cli_parses_action_command_with_global_overrides() {
        let cli = Cli::parse_from([
            "action-gateway",
            "action",
            "Read File",
            "filepath=index.html",
            "--root",
            "/srv/site",
        ]);
        assert_eq!(cli.root.as_deref(), Some(Path::new("/srv/site")));
        match cli.command {
            Some(CliCommand::Action(args)) => {
                assert_eq!(args.name, "Read File");
                assert_eq!(args.input, "filepath=index.html");
            }
            _ => panic!("expected action command"),
        }
    }

    #[test]
    fn cli_parses_check_command_and_doctor() {
        let cli = Cli::parse_from(["action-gateway", "check-command", "rm -rf /"]);
        assert!(matches!(
            cli.command,
            Some(CliCommand::CheckCommand(CheckCommandArgs { ref command })) if command == "rm -rf /"
        ));

        let cli = Cli::parse_from(["action-gateway", "doctor", "--json", "--bind", "0.0.0.0:9000"]);
        assert_eq!(cli.bind.as_deref(), Some("0.0.0.0:9000"));
        match cli.command {
            Some(CliCommand::Doctor(args)) => assert!(args.json),
            _ => panic!("expected doctor command"),
        }
    }

    #[test]
    fn doctor_fails_on_config_error_or_missing_shell() {
        let report = build_doctor_report(
            Err("bad toml".to_owned()),
            Path::new("action-gateway.toml"),
            true,
        );
        assert!(!report.ok);
        assert_eq!(report.checks[0].id, "config.load");

        let mut cfg = Config::default();
        cfg.sandbox.root_dir = std::env::temp_dir();
        let report = build_doctor_report(Ok(cfg.clone()), Path::new("missing.toml"), true);
        assert!(report.ok);
        let report = build_doctor_report(Ok(cfg), Path::new("missing.toml"), false);
        assert!(!report.ok);
    }
}
