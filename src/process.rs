//! Uniform wrapper for launching external commands.
//!
//! Every invocation goes through argument lists, never a shell string, so
//! prompt or filename content can never be interpreted as shell syntax. The
//! one exception — the generated launcher script in
//! [`crate::job::executor`] — is an intentional wrapper whose *contents* are
//! escaped, not concatenated live.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub struct ProcessRunner;

impl ProcessRunner {
    /// Run `cmd args...` to completion, optionally with `stdin_data` piped
    /// in, capturing stdout/stderr concurrently (never sequentially — a
    /// child that fills one pipe's buffer while waiting for the other to
    /// drain would otherwise deadlock).
    pub async fn run(
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
        env: &[(String, String)],
        stdin_data: Option<&str>,
        timeout_duration: Duration,
    ) -> Result<CapturedOutput> {
        let mut command = Command::new(cmd);
        command.args(args);
        command.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        for (key, value) in env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{cmd}`"))?;

        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                let data = data.to_string();
                stdin.write_all(data.as_bytes()).await.ok();
            }
        }

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let wait_result = timeout(timeout_duration, child.wait()).await;

        let status = match wait_result {
            Ok(status) => status.context("failed to wait on child process")?,
            Err(_) => {
                Self::kill_process_group(&child);
                let _ = child.wait().await;
                bail!(
                    "`{cmd}` timed out after {:?} and was terminated",
                    timeout_duration
                );
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(CapturedOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Spawn `cmd args...` detached: no piped stdio is read by the parent,
    /// so the child survives the parent's own stdio teardown. Returns the
    /// child's PID. Used by the launcher script path in Mode B, and
    /// available standalone for anything that doesn't need the PID-file
    /// dance (e.g. spawning `/bin/bash script.sh`).
    pub fn spawn_detached(
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
        env: &[(String, String)],
    ) -> Result<u32> {
        let mut command = std::process::Command::new(cmd);
        command.args(args);
        command.stdin(Stdio::null());
        command.stdout(Stdio::null());
        command.stderr(Stdio::null());

        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        for (key, value) in env {
            command.env(key, value);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New session/process group so a later cancellation can signal
            // the whole tree rather than just the immediate child.
            unsafe {
                command.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn detached `{cmd}`"))?;

        Ok(child.id())
    }

    #[cfg(unix)]
    fn kill_process_group(child: &tokio::process::Child) {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_process_group(_child: &tokio::process::Child) {}

    /// Is `pid` still a live process? Used by the recovery coordinator and
    /// by completion probing.
    #[cfg(unix)]
    pub fn is_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    pub fn is_alive(_pid: u32) -> bool {
        false
    }

    /// Send a termination signal to the process group rooted at `pid`.
    #[cfg(unix)]
    pub fn terminate_process_group(pid: u32) {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    pub fn terminate_process_group(_pid: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout_and_exit_code() {
        let result = ProcessRunner::run(
            "sh",
            &["-c", "echo hello; exit 3"],
            None,
            &[],
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn run_pipes_stdin() {
        let result = ProcessRunner::run(
            "cat",
            &[],
            None,
            &[],
            Some("from stdin\n"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(result.stdout, "from stdin\n");
    }

    #[tokio::test]
    async fn run_enforces_timeout() {
        let result = ProcessRunner::run(
            "sleep",
            &["5"],
            None,
            &[],
            None,
            Duration::from_millis(100),
        )
        .await;

        assert!(result.is_err());
    }

    #[test]
    fn spawn_detached_returns_live_pid() {
        let pid = ProcessRunner::spawn_detached("sleep", &["1"], None, &[]).unwrap();
        assert!(ProcessRunner::is_alive(pid));
    }
}
