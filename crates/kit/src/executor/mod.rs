//! Command execution
//!
//! Scenarios never spawn processes directly; every external command goes
//! through a [`CommandExecutor`]. The [`ProcessExecutor`] runs real
//! processes with a hard timeout, while [`scripted::ScriptedExecutor`]
//! replays canned outputs for unit tests.

use color_eyre::{eyre::Context as _, Result};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

use crate::cmdext::{CommandLine, CommandOutput};
use crate::error::ScenarioError;

pub mod scripted;

/// Runs a command and returns its exit status and output.
///
/// A non-zero exit status is not an error at this level; callers decide
/// whether it matters. Errors are reserved for commands that could not be
/// run or did not finish within `timeout`.
pub trait CommandExecutor: fmt::Debug + Send + Sync {
    /// Run `command`, waiting at most `timeout` for it to finish.
    fn execute(
        &self,
        command: &CommandLine,
        timeout: Duration,
    ) -> Result<CommandOutput, ScenarioError>;
}

/// Executes commands as child processes.
#[derive(Debug)]
pub struct ProcessExecutor {
    rt: tokio::runtime::Runtime,
}

impl ProcessExecutor {
    /// Create an executor with its own single-threaded runtime.
    pub fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create tokio runtime")?;
        Ok(Self { rt })
    }
}

impl CommandExecutor for ProcessExecutor {
    fn execute(
        &self,
        command: &CommandLine,
        timeout: Duration,
    ) -> Result<CommandOutput, ScenarioError> {
        debug!("Executing command: {}", command);

        self.rt.block_on(async {
            let mut cmd = command.to_tokio();
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                // A timed-out child is killed when its future is dropped
                .kill_on_drop(true);

            let child = cmd.spawn().map_err(|source| ScenarioError::Spawn {
                command: command.to_string(),
                source,
            })?;

            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(Ok(output)) => {
                    let output = CommandOutput::from(output);
                    debug!(
                        "Command {} exited with status {}",
                        command, output.exit_status
                    );
                    Ok(output)
                }
                Ok(Err(source)) => Err(ScenarioError::Spawn {
                    command: command.to_string(),
                    source,
                }),
                Err(_) => Err(ScenarioError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                }),
            }
        })
    }
}
