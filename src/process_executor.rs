use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::security::command_policy::{is_path_mutating, leading_command};
use crate::security::{CommandPolicy, PathGuard};
use crate::types::{ActionError, ActionResult, ExecutionResult};

const KILL_GRACE: Duration = Duration::from_millis(500);
const READER_GRACE: Duration = Duration::from_millis(250);
const TRUNCATION_MARKER: &str = "\n... [output truncated]";
const SHELL_EXPANSION_CHARS: &[char] = &['$', '`', '*', '?', '[', '{'];

/// Runs allow-listed shell commands inside the sandbox root under a deadline.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    guard: PathGuard,
    policy: CommandPolicy,
    default_timeout_secs: u64,
    max_timeout_secs: u64,
    max_output_chars: usize,
}

impl ProcessExecutor {
    pub fn new(
        guard: PathGuard,
        policy: CommandPolicy,
        default_timeout_secs: u64,
        max_timeout_secs: u64,
        max_output_chars: usize,
    ) -> Self {
        Self {
            guard,
            policy,
            default_timeout_secs: default_timeout_secs.max(1),
            max_timeout_secs: max_timeout_secs.max(1),
            max_output_chars,
        }
    }

    pub fn effective_timeout(&self, requested_secs: Option<u64>) -> u64 {
        requested_secs
            .unwrap_or(self.default_timeout_secs)
            .clamp(1, self.max_timeout_secs)
    }

    /// Gates and runs `command`. A denial never spawns anything.
    ///
    /// `working_dir` is only validated; the process always starts in the root.
    pub async fn run(
        &self,
        command: &str,
        working_dir: Option<&str>,
        timeout_secs: u64,
    ) -> ActionResult<ExecutionResult> {
        let verdict = self.policy.evaluate(command);
        if !verdict.is_permitted() {
            info!("command denied: {verdict}");
            return Err(ActionError::access_denied(format!(
                "command not allowed: {verdict}"
            )));
        }

        if let Some(raw) = working_dir.map(str::trim).filter(|raw| !raw.is_empty()) {
            let resolved = self.guard.resolve(raw)?;
            if !resolved.as_path().is_dir() {
                return Err(ActionError::invalid_argument(format!(
                    "working directory `{raw}` is not a directory"
                )));
            }
        }

        self.check_path_arguments(command)?;

        let deadline = Duration::from_secs(timeout_secs.clamp(1, self.max_timeout_secs));
        run_shell(command, self.guard.root(), deadline)
            .await
            .map_err(|err| ActionError::io(format!("{err:#}")))
    }

    /// Words are split the way `sh` would, so quoting cannot hide a path.
    /// Arguments the shell would expand are refused outright.
    fn check_path_arguments(&self, command: &str) -> ActionResult<()> {
        let Some(leading) = leading_command(command) else {
            return Ok(());
        };
        if !is_path_mutating(leading) {
            return Ok(());
        }
        let Some(words) = shlex::split(command) else {
            info!("command denied: unbalanced quoting in `{command}`");
            return Err(ActionError::access_denied(
                "command arguments have unbalanced quotes",
            ));
        };
        for word in words.iter().skip(1) {
            let argument = match word.strip_prefix('-') {
                Some(flag) => match flag.split_once('=') {
                    Some((_, value)) => value,
                    None => continue,
                },
                None => word.as_str(),
            };
            if expands_in_shell(argument) {
                info!("command denied: argument `{argument}` of `{leading}` uses shell expansion");
                return Err(ActionError::access_denied(format!(
                    "argument `{argument}` uses shell expansion"
                )));
            }
            if self.guard.resolve(argument).is_err() {
                info!("command denied: argument `{argument}` of `{leading}` leaves the root");
                return Err(ActionError::access_denied(format!(
                    "argument `{argument}` is outside the root directory"
                )));
            }
        }
        Ok(())
    }

    /// Model-facing summary of a finished run.
    pub fn describe(&self, result: &ExecutionResult, timeout_secs: u64) -> String {
        let text = if result.timed_out {
            let mut text = format!("Command timed out after {timeout_secs} seconds");
            if !result.stdout.trim().is_empty() {
                text.push_str("\nPartial output:\n");
                text.push_str(result.stdout.trim_end());
            }
            text
        } else if result.succeeded {
            let stdout = result.stdout.trim_end();
            if stdout.trim().is_empty() {
                "Command executed successfully (no output)".to_owned()
            } else {
                format!("Command executed successfully:\n{stdout}")
            }
        } else {
            let detail = if result.stderr.trim().is_empty() {
                result.stdout.trim_end()
            } else {
                result.stderr.trim_end()
            };
            match result.exit_code {
                Some(code) => format!("Command failed with exit code {code}:\n{detail}"),
                None => format!("Command failed with error:\n{detail}"),
            }
        };
        truncate_output(text, self.max_output_chars)
    }
}

/// Spawns `command` through the platform shell in `cwd` and waits at most
/// `deadline` for it. On expiry the child is killed and whatever it already
/// wrote is returned with `timed_out` set.
pub(crate) async fn run_shell(
    command: &str,
    cwd: &Path,
    deadline: Duration,
) -> Result<ExecutionResult> {
    let started = Instant::now();
    let mut cmd = if cfg!(windows) {
        let mut builder = Command::new("cmd");
        builder.arg("/C").arg(command);
        builder
    } else {
        let mut builder = Command::new("sh");
        builder.arg("-c").arg(command);
        builder
    };
    cmd.current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed spawning shell command in {}", cwd.display()))?;
    debug!("spawned `{command}` (pid {:?})", child.id());

    let stdout = Arc::new(Mutex::new(Vec::new()));
    let stderr = Arc::new(Mutex::new(Vec::new()));
    let readers = [
        child
            .stdout
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stdout))),
        child
            .stderr
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stderr))),
    ];

    let status = match tokio::time::timeout(deadline, child.wait()).await {
        Ok(status) => Some(status.context("failed waiting for shell command")?),
        Err(_) => {
            warn!(
                "command `{command}` exceeded {}s, killing it",
                deadline.as_secs()
            );
            if let Err(err) = child.start_kill() {
                debug!("kill after timeout failed: {err}");
            }
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("killed command reaped ({status})"),
                Ok(Err(err)) => debug!("reaping killed command failed: {err}"),
                Err(_) => debug!(
                    "killed command not reaped within {}ms",
                    KILL_GRACE.as_millis()
                ),
            }
            None
        }
    };

    // Grandchildren can keep a pipe open after the shell is gone.
    for mut reader in readers.into_iter().flatten() {
        if tokio::time::timeout(READER_GRACE, &mut reader).await.is_err() {
            debug!("output pipe still open after exit, keeping captured prefix");
            reader.abort();
        }
    }

    let result = ExecutionResult {
        succeeded: status.map(|status| status.success()).unwrap_or(false),
        stdout: take_text(&stdout),
        stderr: take_text(&stderr),
        exit_code: status.and_then(|status| status.code()),
        timed_out: status.is_none(),
    };
    info!(
        "command `{command}` finished in {}ms (exit {:?}, timed out {})",
        started.elapsed().as_millis(),
        result.exit_code,
        result.timed_out
    );
    Ok(result)
}

fn expands_in_shell(argument: &str) -> bool {
    argument.starts_with('~') || argument.contains(SHELL_EXPANSION_CHARS)
}

fn spawn_reader<R>(mut pipe: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if let Ok(mut buffer) = sink.lock() {
                        buffer.extend_from_slice(&chunk[..read]);
                    }
                }
            }
        }
    })
}

fn take_text(buffer: &Mutex<Vec<u8>>) -> String {
    buffer
        .lock()
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

fn truncate_output(text: String, max_chars: usize) -> String {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text;
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    use crate::security::{CommandPolicy, PathGuard};
    use crate::types::{ActionErrorKind, ExecutionResult};

    use super::{run_shell, truncate_output, ProcessExecutor};

    fn temp_path(tag: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        root.push(format!("action-gateway-process-{tag}-{stamp}"));
        root
    }

    fn executor(tag: &str) -> (ProcessExecutor, PathBuf) {
        let root = temp_path(tag);
        std::fs::create_dir_all(&root).expect("create root");
        let guard = PathGuard::new(&root).expect("guard");
        let root = guard.root().to_path_buf();
        (
            ProcessExecutor::new(guard, CommandPolicy::default(), 30, 120, 16_000),
            root,
        )
    }

    #[tokio::test]
    async fn permitted_command_captures_stdout() {
        let (executor, _root) = executor("echo");
        let result = executor.run("echo hello", None, 5).await.expect("run");
        assert!(result.succeeded);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(
            executor.describe(&result, 5),
            "Command executed successfully:\nhello"
        );
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let (executor, _root) = executor("fail");
        let result = executor.run("cat missing.txt", None, 5).await.expect("run");
        assert!(!result.succeeded);
        assert!(!result.timed_out);
        assert!(!result.stderr.is_empty());
        let text = executor.describe(&result, 5);
        assert!(
            text.starts_with("Command failed with exit code 1:"),
            "{text}"
        );
    }

    #[tokio::test]
    async fn denied_commands_never_spawn() {
        let (executor, root) = executor("denied");
        let err = executor
            .run("touch created.txt; rm -rf /", None, 5)
            .await
            .expect_err("denied");
        assert_eq!(err.kind, ActionErrorKind::AccessDenied);
        assert!(!root.join("created.txt").exists());

        let err = executor
            .run("rm -rf project", None, 5)
            .await
            .expect_err("recursive remove");
        assert_eq!(err.kind, ActionErrorKind::AccessDenied);
    }

    #[tokio::test]
    async fn mutating_arguments_must_stay_in_root() {
        let (executor, root) = executor("arguments");
        let outside_name = format!(
            "{}-escaped.txt",
            root.file_name()
                .and_then(|name| name.to_str())
                .expect("root name")
        );
        let err = executor
            .run(&format!("touch ../{outside_name}"), None, 5)
            .await
            .expect_err("escape via argument");
        assert_eq!(err.kind, ActionErrorKind::AccessDenied);
        assert!(!root.parent().expect("parent").join(&outside_name).exists());

        let result = executor
            .run("touch -c inside.txt", None, 5)
            .await
            .expect("flags are skipped");
        assert!(result.succeeded);
    }

    #[tokio::test]
    async fn quoted_arguments_are_checked_as_the_shell_sees_them() {
        let (executor, root) = executor("quoted");
        std::fs::write(root.join("a.txt"), "a").expect("seed");
        let outside = root.parent().expect("parent").join("escaped file.txt");

        let err = executor
            .run("cp a.txt \"../escaped file.txt\"", None, 5)
            .await
            .expect_err("quoted escape");
        assert_eq!(err.kind, ActionErrorKind::AccessDenied);
        assert!(!outside.exists());

        let err = executor
            .run("cp a.txt \"../unbalanced.txt", None, 5)
            .await
            .expect_err("unbalanced quote");
        assert_eq!(err.kind, ActionErrorKind::AccessDenied);

        let result = executor
            .run("cp a.txt 'copy of a.txt'", None, 5)
            .await
            .expect("quoted name inside the root");
        assert!(result.succeeded);
        assert!(root.join("copy of a.txt").exists());
    }

    #[tokio::test]
    async fn shell_expansions_in_arguments_are_refused() {
        let (executor, root) = executor("expansion");
        for command in [
            "touch ~/tilde.txt",
            "touch $HOME/var.txt",
            "touch ${HOME}/brace.txt",
            "touch .*",
            "touch {a,b}.txt",
            "cp --target-directory=../out a.txt",
        ] {
            let err = executor
                .run(command, None, 5)
                .await
                .expect_err(command);
            assert_eq!(err.kind, ActionErrorKind::AccessDenied, "{command}");
        }
        assert_eq!(std::fs::read_dir(&root).expect("root").count(), 0);
    }

    #[tokio::test]
    async fn working_directory_is_checked_but_root_is_used() {
        let (executor, root) = executor("cwd");
        std::fs::create_dir_all(root.join("sub")).expect("sub");

        let err = executor
            .run("ls", Some("../.."), 5)
            .await
            .expect_err("cwd escape");
        assert_eq!(err.kind, ActionErrorKind::AccessDenied);

        let err = executor
            .run("ls", Some("nowhere"), 5)
            .await
            .expect_err("missing cwd");
        assert_eq!(err.kind, ActionErrorKind::InvalidArgument);

        let result = executor.run("pwd", Some("sub"), 5).await.expect("pwd");
        assert_eq!(result.stdout.trim(), root.display().to_string());
    }

    #[tokio::test]
    async fn timeout_kills_and_keeps_partial_output() {
        let root = temp_path("timeout");
        std::fs::create_dir_all(&root).expect("root");
        let started = Instant::now();
        let result = run_shell("echo before; sleep 5", &root, Duration::from_secs(1))
            .await
            .expect("run");
        assert!(result.timed_out);
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, None);
        assert!(result.stdout.contains("before"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_description_includes_partial_output() {
        let (executor, _root) = executor("describe");
        let result = ExecutionResult {
            succeeded: false,
            stdout: "before\n".to_owned(),
            stderr: String::new(),
            exit_code: None,
            timed_out: true,
        };
        assert_eq!(
            executor.describe(&result, 3),
            "Command timed out after 3 seconds\nPartial output:\nbefore"
        );
    }

    #[test]
    fn requested_timeouts_are_clamped() {
        let (executor, _root) = executor("clamp");
        assert_eq!(executor.effective_timeout(None), 30);
        assert_eq!(executor.effective_timeout(Some(500)), 120);
        assert_eq!(executor.effective_timeout(Some(0)), 1);
    }

    #[test]
    fn long_output_is_truncated_with_marker() {
        let text = truncate_output("x".repeat(20), 8);
        assert!(text.starts_with("xxxxxxxx\n"));
        assert!(text.ends_with("[output truncated]"));
        assert_eq!(truncate_output("short".to_owned(), 8), "short");
    }
}
