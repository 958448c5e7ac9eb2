use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DeployerError, Result};

/// A single external process invocation. Arguments are always passed as an
/// argv vector; nothing is ever interpreted by a shell.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str], timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            stdin: None,
            timeout,
        }
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runner responsible for executing external tools (cosign, syft, grype,
/// trivy, docker). Tests substitute recording/stub implementations.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Default runner backed by `tokio::process`. The child is spawned with
/// `kill_on_drop`, so hitting the deadline kills the subprocess instead of
/// abandoning it.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(program = %spec.program, args = ?spec.args, "running external tool");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;
        if let Some(bytes) = &spec.stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle.write_all(bytes).await?;
                drop(handle);
            }
        }

        let waited = tokio::time::timeout(spec.timeout, child.wait_with_output()).await;
        match waited {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutput {
                    stdout: output.stdout,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    exit_code: output.status.code(),
                })
            }
            // Dropping the future kills the child (kill_on_drop).
            Err(_) => Err(DeployerError::Cancelled(format!(
                "{} exceeded deadline of {:?}",
                spec.program, spec.timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = ProcessRunner;
        let spec = CommandSpec::new("sh", &["-c", "printf hello"], Duration::from_secs(5));
        let output = runner.run(&spec).await.expect("command runs");
        assert!(output.success());
        assert_eq!(output.stdout_utf8(), "hello");
    }

    #[tokio::test]
    async fn surfaces_nonzero_exit() {
        let runner = ProcessRunner;
        let spec = CommandSpec::new("sh", &["-c", "exit 3"], Duration::from_secs(5));
        let output = runner.run(&spec).await.expect("command runs");
        assert!(!output.success());
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let runner = ProcessRunner;
        let spec = CommandSpec::new("sleep", &["30"], Duration::from_millis(100));
        let err = runner.run(&spec).await.expect_err("deadline hit");
        assert!(matches!(err, DeployerError::Cancelled(_)));
    }

    #[tokio::test]
    async fn pipes_stdin_to_child() {
        let runner = ProcessRunner;
        let spec = CommandSpec::new("cat", &[], Duration::from_secs(5))
            .with_stdin(b"payload".to_vec());
        let output = runner.run(&spec).await.expect("command runs");
        assert_eq!(output.stdout_utf8(), "payload");
    }
}
