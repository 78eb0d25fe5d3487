use crate::BenchError;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wait_timeout::ChildExt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellRunResult {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ShellRunResult {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.status == Some(0)
    }
}

/// Process boundary for every git and verification command. Implementations
/// must be shareable across worker threads.
pub trait ShellRunner: Send + Sync {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult>;
}

/// Run `cmd` and return its stdout, turning a non-zero exit or timeout into
/// [`BenchError::CommandFailed`].
pub fn run_checked(
    shell: &dyn ShellRunner,
    cmd: &str,
    cwd: &Path,
    timeout: Duration,
) -> Result<String> {
    let out = shell.run(cmd, cwd, timeout)?;
    if out.success() {
        return Ok(out.stdout);
    }
    let stderr = if out.timed_out {
        format!("timed out after {}s", timeout.as_secs())
    } else {
        out.stderr.trim().to_string()
    };
    Err(BenchError::CommandFailed {
        command: cmd.to_string(),
        status: out.status,
        stderr,
    }
    .into())
}

/// Quote `words` into a single shell command line.
pub fn command_line<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    shell_words::join(words)
}

#[derive(Debug, Default)]
pub struct PlatformShellRunner;

impl ShellRunner for PlatformShellRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<ShellRunResult> {
        tracing::debug!(cmd, cwd = %cwd.display(), "shell: spawn");
        let mut child = spawn_command(cmd, cwd)?;
        // Drain pipes concurrently so a chatty process cannot block on a full pipe.
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let (status, timed_out) = match child.wait_timeout(timeout)? {
            Some(status) => (status.code(), false),
            None => {
                kill_process_tree(&mut child);
                let status = child.wait()?;
                tracing::debug!(cmd, timeout_secs = timeout.as_secs(), "shell: timed out");
                (status.code(), true)
            }
        };

        Ok(ShellRunResult {
            status,
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
            timed_out,
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).to_string()
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[cfg(unix)]
fn kill_process_tree(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: signals the process group created for this child at spawn time.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Start `cmd` under the platform shell in its own process group, with
/// piped output and no stdin. Git is pinned to the C locale and never
/// prompts, so its messages stay parseable and an unattended run cannot
/// hang on a credential prompt.
fn spawn_command(cmd: &str, cwd: &Path) -> Result<Child> {
    if !cwd.is_dir() {
        return Err(anyhow!(
            "working directory '{}' does not exist for '{cmd}'",
            cwd.display()
        ));
    }
    let mut command = shell_command(cmd);
    command
        .current_dir(cwd)
        .env("LC_ALL", "C")
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
        .spawn()
        .with_context(|| format!("failed to spawn '{cmd}' in '{}'", cwd.display()))
}

#[cfg(windows)]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(cmd);
    command
}

#[cfg(not(windows))]
fn shell_command(cmd: &str) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(cmd);
    command
}
