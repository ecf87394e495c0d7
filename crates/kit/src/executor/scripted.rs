//! Replay executor for exercising scenarios without a hypervisor
//!
//! Replies are matched by argv prefix. One-shot replies are consumed in the
//! order they were added and take precedence over standing replies; a
//! command that matches nothing succeeds with empty output.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::CommandExecutor;
use crate::cmdext::{CommandLine, CommandOutput};
use crate::error::ScenarioError;

/// What a matched command produces.
#[derive(Debug, Clone)]
enum Reply {
    Output(CommandOutput),
    Timeout,
}

#[derive(Debug, Clone)]
struct Rule {
    prefix: Vec<String>,
    reply: Reply,
}

impl Rule {
    fn new(prefix: &str, reply: Reply) -> Self {
        Self {
            prefix: prefix.split_whitespace().map(str::to_owned).collect(),
            reply,
        }
    }

    fn matches(&self, command: &CommandLine) -> bool {
        let argv: Vec<&str> = command.argv().collect();
        argv.len() >= self.prefix.len() && self.prefix.iter().zip(&argv).all(|(p, a)| p == a)
    }
}

#[derive(Debug, Default)]
struct Script {
    once: Vec<Rule>,
    always: Vec<Rule>,
    calls: Vec<CommandLine>,
}

/// A [`CommandExecutor`] that answers from a script and records every call.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<Script>,
}

impl ScriptedExecutor {
    /// An executor where every command succeeds with empty output.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Always answer commands starting with `prefix` with `output`.
    pub fn on(self, prefix: &str, output: CommandOutput) -> Self {
        self.lock().always.push(Rule::new(prefix, Reply::Output(output)));
        self
    }

    /// Answer the next command starting with `prefix` with `output`.
    pub fn once(self, prefix: &str, output: CommandOutput) -> Self {
        self.lock().once.push(Rule::new(prefix, Reply::Output(output)));
        self
    }

    /// Make every command starting with `prefix` time out.
    pub fn timeout_on(self, prefix: &str) -> Self {
        self.lock().always.push(Rule::new(prefix, Reply::Timeout));
        self
    }

    /// Every command run so far, rendered as strings.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.iter().map(|c| c.to_string()).collect()
    }

    /// How many commands started with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        let probe = Rule::new(prefix, Reply::Timeout);
        self.lock().calls.iter().filter(|c| probe.matches(c)).count()
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(
        &self,
        command: &CommandLine,
        timeout: Duration,
    ) -> Result<CommandOutput, ScenarioError> {
        let mut script = self.lock();
        script.calls.push(command.clone());

        let reply = match script.once.iter().position(|r| r.matches(command)) {
            Some(idx) => Some(script.once.remove(idx).reply),
            None => script
                .always
                .iter()
                .find(|r| r.matches(command))
                .map(|r| r.reply.clone()),
        };

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Timeout) => Err(ScenarioError::CommandTimeout {
                command: command.to_string(),
                timeout,
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(exec: &ScriptedExecutor, cmd: &str) -> Result<CommandOutput, ScenarioError> {
        exec.execute(&CommandLine::parse(cmd).unwrap(), Duration::from_secs(1))
    }

    #[test]
    fn test_once_takes_precedence_then_falls_back() {
        let exec = ScriptedExecutor::new()
            .on("virsh pool-list", CommandOutput::ok("always"))
            .once("virsh pool-list", CommandOutput::ok("first"));

        assert_eq!(run(&exec, "virsh pool-list --all").unwrap().stdout, "first");
        assert_eq!(run(&exec, "virsh pool-list --all").unwrap().stdout, "always");
        assert_eq!(exec.count("virsh pool-list"), 2);
    }

    #[test]
    fn test_unmatched_succeeds() {
        let exec = ScriptedExecutor::new().on("virsh pool-start", CommandOutput::failed(1, ""));
        assert!(run(&exec, "virsh pool-destroy p").unwrap().success());
        assert!(!run(&exec, "virsh pool-start p").unwrap().success());
        assert_eq!(exec.calls(), ["virsh pool-destroy p", "virsh pool-start p"]);
    }

    #[test]
    fn test_prefix_must_match_whole_words() {
        let exec = ScriptedExecutor::new().on("virsh net-start net1", CommandOutput::failed(1, ""));
        assert!(run(&exec, "virsh net-start net10").unwrap().success());
        assert!(!run(&exec, "virsh net-start net1").unwrap().success());
    }

    #[test]
    fn test_timeout_reply() {
        let exec = ScriptedExecutor::new().timeout_on("virsh list");
        assert!(matches!(
            run(&exec, "virsh list --all"),
            Err(ScenarioError::CommandTimeout { .. })
        ));
    }
}
