//! Privileged external commands
//!
//! Display power, shutdown and hotspot control are opaque programs. Each
//! call is bounded by a timeout and its exit status is always checked.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ControlError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExternalCommandError {
    #[error("empty command line")]
    Empty,

    #[error("failed to launch: {0}")]
    Spawn(String),

    #[error("exited with status {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("no result within {0:?}")]
    TimedOut(Duration),
}

impl ExternalCommandError {
    /// Surface-facing form, naming the command that failed
    pub fn into_control(self, argv: &[String]) -> ControlError {
        match self {
            ExternalCommandError::TimedOut(limit) => {
                ControlError::Timeout(format!("`{}` after {:?}", argv.join(" "), limit))
            }
            other => ControlError::ExternalCommandFault {
                command: argv.join(" "),
                reason: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
}

#[async_trait]
pub trait SystemCommands: Send + Sync {
    /// Run `argv` to completion; a non-zero exit is an error
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, ExternalCommandError>;
}

/// Runs commands as child processes
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SystemCommands for ShellRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, ExternalCommandError> {
        let (program, args) = argv.split_first().ok_or(ExternalCommandError::Empty)?;
        debug!(command = %argv.join(" "), "Running external command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| ExternalCommandError::TimedOut(self.timeout))?
            .map_err(|e| ExternalCommandError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                command = %argv.join(" "),
                code = ?output.status.code(),
                stderr = %stderr,
                "External command failed"
            );
            return Err(ExternalCommandError::Failed {
                code: output.status.code(),
                stderr,
            });
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}
