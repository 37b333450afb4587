/// Sandbox - Abstraction for Running One Command of a Job
///
/// **Core Responsibility:**
/// Run a command inside a job's working directory under a hard timeout and
/// capture what it printed.
///
/// **Boundary:**
/// - Sandbox knows HOW a command runs (local process, container)
/// - Sandbox does NOT know what the command means (build, test, nm)
/// - Sandbox does NOT judge output; the evaluator does
///
/// A timed-out command is always terminated, never abandoned.

use async_trait::async_trait;
use mithril_common::types::CommandSpec;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured output per stream is truncated beyond this many bytes.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container error: {0}")]
    Docker(String),
}

/// Host directories a job exposes to its commands.
#[derive(Debug, Clone)]
pub struct JobMounts {
    /// Exclusive, writable working directory of the job
    pub workdir: PathBuf,
    /// Exercise directory, read-only for commands
    pub exercise_dir: PathBuf,
}

/// The same directories as the sandboxed command sees them; these are the
/// values substituted for `{workdir}` and `{exercise_dir}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxView {
    pub workdir: String,
    pub exercise_dir: String,
}

/// What a finished command did.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Short human-readable exit description.
    pub fn status(&self) -> String {
        match self.exit_code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

#[async_trait]
pub trait Sandbox: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn view(&self, mounts: &JobMounts) -> SandboxView;

    /// Run `command` with the job's working directory as current directory.
    async fn run(
        &self,
        mounts: &JobMounts,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<ProcessOutput, SandboxError>;
}

/// Runs commands as local child processes with a scrubbed environment.
///
/// Provides time bounding only; use `DockerSandbox` where memory, network
/// and filesystem isolation is required.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    output_limit: usize,
    path: String,
}

impl ProcessSandbox {
    pub fn new(output_limit: usize) -> Self {
        Self {
            output_limit,
            path: std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
        }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_LIMIT)
    }
}

/// Resolve `./prog`-style programs against the working directory; bare names
/// go through `PATH`.
fn resolve_program(program: &str, workdir: &Path) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && program.contains('/') {
        workdir.join(path)
    } else {
        path.to_path_buf()
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    fn view(&self, mounts: &JobMounts) -> SandboxView {
        SandboxView {
            workdir: mounts.workdir.display().to_string(),
            exercise_dir: mounts.exercise_dir.display().to_string(),
        }
    }

    async fn run(
        &self,
        mounts: &JobMounts,
        command: &CommandSpec,
        timeout: Duration,
    ) -> Result<ProcessOutput, SandboxError> {
        debug!(command = %command, timeout_ms = timeout.as_millis() as u64, "Running command");

        let mut cmd = Command::new(resolve_program(command.program(), &mounts.workdir));
        cmd.args(command.args())
            .current_dir(&mounts.workdir)
            .env_clear()
            .env("PATH", &self.path)
            .env("HOME", &mounts.workdir)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // own process group, so background children die with the command
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;
        let group = child.id();

        let limit = self.output_limit;
        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), limit));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), limit));
        let readers = [stdout_task.abort_handle(), stderr_task.abort_handle()];

        let finished = async {
            let status = child.wait().await?;
            // leftovers would hold the pipes open past the leader's exit
            kill_group(group);
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok::<_, std::io::Error>((status, stdout, stderr))
        };

        let outcome = tokio::time::timeout(timeout, finished).await;
        match outcome {
            Ok(Ok((status, stdout, stderr))) => Ok(ProcessOutput {
                exit_code: status.code(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
            Ok(Err(e)) => {
                kill_group(group);
                Err(SandboxError::Io(e))
            }
            Err(_elapsed) => {
                kill_group(group);
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out process");
                }
                for reader in readers {
                    reader.abort();
                }
                Err(SandboxError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }
}

/// SIGKILL every process left in the group led by `pgid`.
#[cfg(unix)]
fn kill_group(pgid: Option<u32>) {
    let Some(pgid) = pgid.and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    // Safety: kill(2) with a negative pid only signals that process group;
    // ESRCH once the group is empty is expected.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<u32>) {}

/// Read a whole stream, keeping at most `limit` bytes.
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>, limit: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h).take(limit as u64).read_to_end(&mut buf).await;
        // keep draining so the child never blocks on a full pipe
        let _ = tokio::io::copy(&mut h, &mut tokio::io::sink()).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounts(dir: &Path) -> JobMounts {
        JobMounts {
            workdir: dir.to_path_buf(),
            exercise_dir: dir.to_path_buf(),
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessSandbox::default()
            .run(&mounts(dir.path()), &sh("echo hello; echo oops >&2; exit 3"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_runs_in_workdir_with_scrubbed_env() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("MITHRIL_SECRET_FOR_TEST", "leak");
        let out = ProcessSandbox::default()
            .run(
                &mounts(dir.path()),
                &sh("pwd; echo \"[$MITHRIL_SECRET_FOR_TEST]\""),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let mut lines = out.stdout.lines();
        let pwd = lines.next().unwrap();
        assert_eq!(
            Path::new(pwd).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        assert_eq!(lines.next(), Some("[]"));
    }

    #[tokio::test]
    async fn test_relative_program_resolves_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("prog");
        std::fs::write(&script, "#!/bin/sh\necho from-prog\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let out = ProcessSandbox::default()
            .run(&mounts(dir.path()), &CommandSpec::new("./prog", vec![]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "from-prog\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProcessSandbox::default()
            .run(&mounts(dir.path()), &sh("sleep 30"), Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(SandboxError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_output_open() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let out = ProcessSandbox::default()
            .run(&mounts(dir.path()), &sh("sleep 20 & echo done; exit 0"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out.stdout, "done\n");
        assert!(out.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let started = Instant::now();
        let result = ProcessSandbox::default()
            .run(&mounts(dir.path()), &sh("sleep 30 & sleep 30 & wait"), Duration::from_millis(300))
            .await;
        assert!(matches!(result, Err(SandboxError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ProcessSandbox::default()
            .run(
                &mounts(dir.path()),
                &CommandSpec::new("definitely-not-a-real-binary", vec![]),
                Duration::from_secs(5),
            )
            .await;
        assert!(matches!(result, Err(SandboxError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessSandbox::new(10)
            .run(&mounts(dir.path()), &sh("printf '%050d' 0"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 10);
        assert!(out.success());
    }
}
