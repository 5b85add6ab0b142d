//! Child process plumbing shared by the command engine and command jobs.
//!
//! The request goes in on stdin, the answer comes back on stdout. Stdin is
//! written while stdout is drained so a chatty child never blocks on a full
//! pipe.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// A program and its fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// `None` when the child was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last non-empty stderr line, or the exit code when stderr is silent.
    pub fn failure_summary(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| match self.code {
                Some(code) => format!("exited with code {}", code),
                None => "terminated by signal".to_string(),
            })
    }
}

/// Run `program` to completion with `input` on stdin. The child is killed if
/// `timeout` elapses first.
pub async fn run_piped(
    program: &CommandSpec,
    envs: &[(&str, String)],
    input: Vec<u8>,
    timeout: Option<Duration>,
) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&program.command);
    cmd.args(&program.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &program.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program.display()))?;
    tracing::debug!(command = %program.display(), pid = child.id().unwrap_or(0), "Spawned child process");

    let stdin = child.stdin.take();
    let writer = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let run = async { tokio::join!(writer, child.wait_with_output()) };

    let (written, output) = match timeout {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .with_context(|| format!("'{}' timed out after {:?}", program.display(), limit))?,
        None => run.await,
    };
    if let Err(e) = written {
        // A child that exits without reading its input is not an error here.
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(e).context("Failed to write child stdin");
        }
    }
    let output = output.with_context(|| format!("Failed to wait for '{}'", program.display()))?;

    Ok(ProcessOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn test_stdin_round_trips_through_child() -> Result<()> {
        let out = run_piped(&sh("cat"), &[], b"hello".to_vec(), None).await?;
        assert!(out.success());
        assert_eq!(out.stdout, "hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_env_is_passed() -> Result<()> {
        let out = run_piped(
            &sh("printf '%s' \"$RELAY_JOB_ID\""),
            &[("RELAY_JOB_ID", "42".to_string())],
            Vec::new(),
            None,
        )
        .await?;
        assert_eq!(out.stdout, "42");
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_summary_prefers_stderr() -> Result<()> {
        let out = run_piped(&sh("echo first >&2; echo 'last words' >&2; exit 3"), &[], Vec::new(), None).await?;
        assert!(!out.success());
        assert_eq!(out.code, Some(3));
        assert_eq!(out.failure_summary(), "last words");

        let silent = run_piped(&sh("exit 4"), &[], Vec::new(), None).await?;
        assert_eq!(silent.failure_summary(), "exited with code 4");
        Ok(())
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let err = run_piped(&sh("sleep 5"), &[], Vec::new(), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let err = run_piped(&CommandSpec::new("relay-no-such-binary"), &[], Vec::new(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}
