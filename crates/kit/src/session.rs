//! Command execution on behalf of a running scenario

use std::sync::Arc;
use std::time::Duration;

use crate::cmdext::{CommandLine, CommandOutput};
use crate::error::ScenarioError;
use crate::executor::CommandExecutor;
use crate::result::{CapturedCommand, Phase};
use crate::virsh::Virsh;

/// Runs commands for one scenario and records what they produced.
///
/// Every command that finishes is captured, tagged with the phase that ran
/// it; timeouts and spawn failures surface as errors instead.
#[derive(Debug)]
pub struct Session {
    executor: Arc<dyn CommandExecutor>,
    timeout: Duration,
    virsh: Virsh,
    phase: Phase,
    outputs: Vec<CapturedCommand>,
}

impl Session {
    /// Create a session using `executor` with a per-command `timeout`.
    pub fn new(executor: Arc<dyn CommandExecutor>, timeout: Duration, connect: Option<&str>) -> Self {
        Self {
            executor,
            timeout,
            virsh: Virsh::new(connect),
            phase: Phase::Setup,
            outputs: Vec::new(),
        }
    }

    /// The phase currently running.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A virsh command builder bound to this session's connection.
    pub fn virsh(&self) -> Virsh {
        self.virsh.clone()
    }

    /// Run a command, accepting any exit status.
    pub fn run(&mut self, command: &CommandLine) -> Result<CommandOutput, ScenarioError> {
        let output = self.executor.execute(command, self.timeout)?;
        self.outputs.push(CapturedCommand {
            phase: self.phase,
            command: command.to_string(),
            exit_status: output.exit_status,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        });
        Ok(output)
    }

    /// Run a command that must exit successfully.
    pub fn run_checked(&mut self, command: &CommandLine) -> Result<CommandOutput, ScenarioError> {
        let output = self.run(command)?;
        if output.success() {
            Ok(output)
        } else {
            Err(ScenarioError::CommandFailed {
                command: command.to_string(),
                exit_status: output.exit_status,
                stderr: output.stderr,
            })
        }
    }

    /// Commands captured so far.
    pub fn outputs(&self) -> &[CapturedCommand] {
        &self.outputs
    }

    pub(crate) fn take_outputs(&mut self) -> Vec<CapturedCommand> {
        std::mem::take(&mut self.outputs)
    }
}
