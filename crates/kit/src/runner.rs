//! The four-phase scenario runner
//!
//! A scenario runs Setup, Action and Verify in order. The first phase that
//! returns an error (or panics) ends the sequence; Cleanup then releases
//! every resource still held, newest first, no matter how the earlier
//! phases ended. Verification failures recorded through
//! [`ScenarioContext::check`] do not stop a phase, so all mismatches are
//! reported together.

use chrono::Utc;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn};

use crate::cmdext::{CommandLine, CommandOutput};
use crate::config::DEFAULT_COMMAND_TIMEOUT;
use crate::document::{DocumentStore, FsDocumentStore};
use crate::error::{CleanupError, ScenarioError};
use crate::executor::CommandExecutor;
use crate::resources::{Release, ResourceHandle, ResourceKind, ResourceTracker};
use crate::result::{CapturedCommand, Diagnostic, DiagnosticKind, Phase, ScenarioResult};
use crate::session::Session;
use crate::virsh::Virsh;
use crate::wait::{self, Retry};

/// A test scenario driven by the [`Runner`].
///
/// Implementations parse their parameters when constructed; the phase
/// methods only talk to the outside world through the context.
pub trait Scenario: fmt::Debug {
    /// Scenario name as shown in results.
    fn name(&self) -> &str;

    /// Check preconditions and prepare fixtures.
    fn setup(&mut self, _ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        Ok(())
    }

    /// Perform the state change under test.
    fn action(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError>;

    /// Compare observed state against expectations.
    fn verify(&mut self, _ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
        Ok(())
    }
}

/// Per-run state handed to each phase.
///
/// Dropping the context releases anything still held.
#[derive(Debug)]
pub struct ScenarioContext {
    session: Session,
    resources: ResourceTracker,
    documents: Arc<dyn DocumentStore>,
    diagnostics: Vec<Diagnostic>,
}

impl ScenarioContext {
    /// A fresh context around `session`.
    pub fn new(session: Session, documents: Arc<dyn DocumentStore>) -> Self {
        Self {
            session,
            resources: ResourceTracker::new(),
            documents,
            diagnostics: Vec::new(),
        }
    }

    /// The phase currently running.
    pub fn phase(&self) -> Phase {
        self.session.phase()
    }

    /// The command session.
    pub fn session(&mut self) -> &mut Session {
        &mut self.session
    }

    /// A virsh builder for this run's connection.
    pub fn virsh(&self) -> Virsh {
        self.session.virsh()
    }

    /// Document store for loading descriptor files.
    pub fn documents(&self) -> &dyn DocumentStore {
        self.documents.as_ref()
    }

    /// Run a command, accepting any exit status.
    pub fn run(&mut self, command: &CommandLine) -> Result<CommandOutput, ScenarioError> {
        self.session.run(command)
    }

    /// Run a command that must succeed.
    pub fn run_checked(&mut self, command: &CommandLine) -> Result<CommandOutput, ScenarioError> {
        self.session.run_checked(command)
    }

    /// Track a resource for cleanup.
    pub fn acquire(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        release: Release,
    ) -> ResourceHandle {
        self.resources.acquire(kind, name, release)
    }

    /// Release a resource before cleanup. Later releases of it do nothing.
    pub fn release(&mut self, handle: ResourceHandle) -> Result<(), CleanupError> {
        self.resources.release(handle, &mut self.session)
    }

    /// Whether `handle` is still held.
    pub fn is_held(&self, handle: ResourceHandle) -> bool {
        self.resources.is_held(handle)
    }

    /// Record a verification failure unless `condition` holds.
    pub fn check(&mut self, condition: bool, message: impl Into<String>) -> bool {
        if !condition {
            self.fail(message);
        }
        condition
    }

    /// Record a verification failure.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("Verification failed: {message}");
        let phase = self.phase();
        self.diagnostics
            .push(Diagnostic::new(DiagnosticKind::Verification, phase, message));
    }

    /// Number of verification failures recorded so far.
    pub fn failures(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.kind == DiagnosticKind::Verification)
            .count()
    }

    /// Poll `probe` under `retry` until it returns true.
    pub fn wait_until<F>(&mut self, what: &str, retry: Retry, mut probe: F) -> Result<(), ScenarioError>
    where
        F: FnMut(&mut Session, u32) -> Result<bool, ScenarioError>,
    {
        let session = &mut self.session;
        wait::poll_until(what, retry, |attempt| probe(session, attempt))
    }

    fn record_error(&mut self, phase: Phase, err: ScenarioError) {
        let diagnostic = match err {
            ScenarioError::Skipped(reason) => {
                info!("{phase} skipped: {reason}");
                Diagnostic::new(DiagnosticKind::Skipped, phase, reason)
            }
            err => {
                warn!("{phase} failed: {err}");
                Diagnostic::new(DiagnosticKind::PhaseError, phase, err.to_string())
            }
        };
        self.diagnostics.push(diagnostic);
    }

    fn cleanup(&mut self) {
        self.session.set_phase(Phase::Cleanup);
        for err in self.resources.release_all(&mut self.session) {
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::Cleanup,
                Phase::Cleanup,
                err.to_string(),
            ));
        }
    }

    fn finish(&mut self) -> (Vec<Diagnostic>, Vec<CapturedCommand>, Vec<String>) {
        (
            std::mem::take(&mut self.diagnostics),
            self.session.take_outputs(),
            self.resources.take_released(),
        )
    }
}

impl Drop for ScenarioContext {
    fn drop(&mut self) {
        if self.resources.held() > 0 {
            warn!("Releasing {} leftover resource(s)", self.resources.held());
            self.cleanup();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Runs scenarios against one command executor.
#[derive(Debug, Clone)]
pub struct Runner {
    executor: Arc<dyn CommandExecutor>,
    documents: Arc<dyn DocumentStore>,
    command_timeout: Duration,
    connect: Option<String>,
}

impl Runner {
    /// A runner with default settings.
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            documents: Arc::new(FsDocumentStore),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            connect: None,
        }
    }

    /// Set the per-command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the hypervisor connection URI passed to virsh.
    pub fn connect(mut self, uri: Option<String>) -> Self {
        self.connect = uri;
        self
    }

    /// Use a different document store.
    pub fn documents(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = documents;
        self
    }

    /// Run all phases of `scenario` and report the outcome.
    pub fn run(&self, scenario: &mut dyn Scenario) -> ScenarioResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let name = scenario.name().to_owned();
        let span = info_span!("scenario", name = %name);
        let _guard = span.enter();

        let session = Session::new(
            self.executor.clone(),
            self.command_timeout,
            self.connect.as_deref(),
        );
        let mut ctx = ScenarioContext::new(session, self.documents.clone());

        for phase in [Phase::Setup, Phase::Action, Phase::Verify] {
            ctx.session.set_phase(phase);
            info!("{phase} phase");
            let r = catch_unwind(AssertUnwindSafe(|| match phase {
                Phase::Setup => scenario.setup(&mut ctx),
                Phase::Action => scenario.action(&mut ctx),
                _ => scenario.verify(&mut ctx),
            }))
            .unwrap_or_else(|payload| Err(ScenarioError::Panicked(panic_message(payload))));
            if let Err(e) = r {
                ctx.record_error(phase, e);
                break;
            }
        }

        info!("Cleanup phase");
        ctx.cleanup();
        let (diagnostics, outputs, released) = ctx.finish();
        let result = ScenarioResult::new(
            &name,
            diagnostics,
            outputs,
            released,
            started_at,
            start.elapsed(),
        );
        info!("Scenario {} {}", name, result.outcome());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::scripted::ScriptedExecutor;
    use crate::result::Outcome;
    use crate::resources::CleanupStep;

    /// Acquires a pool in setup; each phase's behavior is configurable.
    #[derive(Default)]
    struct Probe {
        fail_setup: Option<fn() -> ScenarioError>,
        action_cmd: Option<&'static str>,
        verify_failures: Vec<&'static str>,
        panic_in: Option<Phase>,
        phases: Vec<Phase>,
    }

    impl fmt::Debug for Probe {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("Probe").field("phases", &self.phases).finish()
        }
    }

    impl Scenario for Probe {
        fn name(&self) -> &str {
            "probe"
        }

        fn setup(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
            self.phases.push(Phase::Setup);
            if let Some(f) = self.fail_setup {
                return Err(f());
            }
            let undefine = ctx.virsh().cmd("pool-undefine").arg("poolA");
            ctx.acquire(ResourceKind::Pool, "poolA", Release::command(undefine));
            if self.panic_in == Some(Phase::Setup) {
                panic!("setup exploded");
            }
            Ok(())
        }

        fn action(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
            self.phases.push(Phase::Action);
            if let Some(cmd) = self.action_cmd {
                ctx.run_checked(&CommandLine::parse(cmd)?)?;
            }
            Ok(())
        }

        fn verify(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
            self.phases.push(Phase::Verify);
            for msg in &self.verify_failures {
                ctx.check(false, *msg);
            }
            if self.panic_in == Some(Phase::Verify) {
                panic!("verify exploded");
            }
            Ok(())
        }
    }

    fn pool_exists() -> ScenarioError {
        ScenarioError::Precondition("pool poolA already exists".into())
    }

    fn no_hba() -> ScenarioError {
        ScenarioError::Skipped("no online HBA".into())
    }

    fn runner(exec: &Arc<ScriptedExecutor>) -> Runner {
        Runner::new(exec.clone()).command_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_passing_run_cleans_up_once() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut s = Probe::default();
        let result = runner(&exec).run(&mut s);
        assert!(result.success());
        assert_eq!(result.outcome(), Outcome::Passed);
        assert_eq!(s.phases, [Phase::Setup, Phase::Action, Phase::Verify]);
        assert_eq!(exec.count("virsh pool-undefine poolA"), 1);
        assert_eq!(result.released(), ["pool:poolA"]);
        assert_eq!(result.outputs()[0].phase, Phase::Cleanup);
    }

    #[test]
    fn test_precondition_skips_action() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut s = Probe {
            fail_setup: Some(pool_exists),
            ..Default::default()
        };
        let result = runner(&exec).run(&mut s);
        assert!(!result.success());
        assert_eq!(s.phases, [Phase::Setup]);
        assert_eq!(
            result.messages(),
            ["Setup failed: precondition not met: pool poolA already exists"]
        );
        assert!(exec.calls().is_empty());
    }

    #[test]
    fn test_action_failure_still_cleans_up() {
        let exec = Arc::new(
            ScriptedExecutor::new().on("virsh pool-start poolA", CommandOutput::failed(1, "error")),
        );
        let mut s = Probe {
            action_cmd: Some("virsh pool-start poolA"),
            verify_failures: vec!["never reached"],
            ..Default::default()
        };
        let result = runner(&exec).run(&mut s);
        assert!(!result.success());
        assert_eq!(result.messages(), ["Action failed: exit_status=1"]);
        assert_eq!(s.phases, [Phase::Setup, Phase::Action]);
        assert_eq!(
            exec.calls(),
            ["virsh pool-start poolA", "virsh pool-undefine poolA"]
        );
    }

    #[test]
    fn test_verification_failures_are_collected_in_order() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut s = Probe {
            verify_failures: vec!["pool state mismatch", "disk count mismatch"],
            ..Default::default()
        };
        let result = runner(&exec).run(&mut s);
        assert_eq!(result.outcome(), Outcome::Failed);
        assert_eq!(
            result.messages(),
            ["pool state mismatch", "disk count mismatch"]
        );
        assert_eq!(exec.count("virsh pool-undefine"), 1);
    }

    #[test]
    fn test_cleanup_errors_follow_primary_failures() {
        let exec = Arc::new(
            ScriptedExecutor::new()
                .on("virsh pool-undefine", CommandOutput::failed(1, "pool is busy")),
        );
        let mut s = Probe {
            verify_failures: vec!["pool state mismatch"],
            ..Default::default()
        };
        let result = runner(&exec).run(&mut s);
        assert_eq!(
            result.messages(),
            [
                "pool state mismatch",
                "cleanup: pool:poolA: `virsh pool-undefine poolA` exited with status 1: pool is busy"
            ]
        );
        assert_eq!(result.outcome(), Outcome::Failed);
    }

    #[test]
    fn test_cleanup_error_alone_does_not_fail() {
        let exec = Arc::new(
            ScriptedExecutor::new().on("virsh pool-undefine", CommandOutput::failed(1, "")),
        );
        let result = runner(&exec).run(&mut Probe::default());
        assert!(result.success());
        assert_eq!(result.diagnostics().len(), 1);
    }

    #[test]
    fn test_panic_is_a_phase_failure() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut s = Probe {
            panic_in: Some(Phase::Setup),
            ..Default::default()
        };
        let result = runner(&exec).run(&mut s);
        assert_eq!(result.messages(), ["Setup failed: panicked: setup exploded"]);
        assert_eq!(exec.count("virsh pool-undefine poolA"), 1);
    }

    #[test]
    fn test_verify_panic_still_cleans_up() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut s = Probe {
            verify_failures: vec!["pool state mismatch"],
            panic_in: Some(Phase::Verify),
            ..Default::default()
        };
        let result = runner(&exec).run(&mut s);
        assert_eq!(result.outcome(), Outcome::Failed);
        assert_eq!(s.phases, [Phase::Setup, Phase::Action, Phase::Verify]);
        assert_eq!(
            result.messages(),
            [
                "pool state mismatch",
                "Verify failed: panicked: verify exploded"
            ]
        );
        assert_eq!(exec.count("virsh pool-undefine poolA"), 1);
        assert_eq!(result.released(), ["pool:poolA"]);
    }

    #[test]
    fn test_command_timeout_fails_phase_and_cleans_up() {
        let exec = Arc::new(ScriptedExecutor::new().timeout_on("virsh pool-start"));
        let mut s = Probe {
            action_cmd: Some("virsh pool-start poolA"),
            verify_failures: vec!["never reached"],
            ..Default::default()
        };
        let result = runner(&exec).run(&mut s);
        assert_eq!(result.outcome(), Outcome::Failed);
        assert_eq!(s.phases, [Phase::Setup, Phase::Action]);
        assert_eq!(
            result.messages(),
            ["Action failed: command `virsh pool-start poolA` timed out after 5s"]
        );
        assert_eq!(
            exec.calls(),
            ["virsh pool-start poolA", "virsh pool-undefine poolA"]
        );
    }

    #[test]
    fn test_skip_outcome() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut s = Probe {
            fail_setup: Some(no_hba),
            ..Default::default()
        };
        let result = runner(&exec).run(&mut s);
        assert_eq!(result.outcome(), Outcome::Skipped);
        assert_eq!(result.messages(), ["Setup skipped: no online HBA"]);
    }

    #[test]
    fn test_early_release_is_not_repeated() {
        #[derive(Debug)]
        struct Early;
        impl Scenario for Early {
            fn name(&self) -> &str {
                "early"
            }
            fn action(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
                let detach = ctx.virsh().cmd("detach-disk").args(["vm", "vdb"]);
                let h = ctx.acquire(
                    ResourceKind::Disk,
                    "vdb",
                    Release::Steps(vec![CleanupStep::required(detach)]),
                );
                ctx.release(h).map_err(|e| ScenarioError::Other(e.into()))?;
                assert!(!ctx.is_held(h));
                Ok(())
            }
        }
        let exec = Arc::new(ScriptedExecutor::new());
        let result = runner(&exec).run(&mut Early);
        assert!(result.success());
        assert_eq!(exec.count("virsh detach-disk"), 1);
        assert_eq!(result.released(), ["disk:vdb"]);
    }

    #[test]
    fn test_wait_until_timeout_fails_phase() {
        #[derive(Debug)]
        struct Waits;
        impl Scenario for Waits {
            fn name(&self) -> &str {
                "waits"
            }
            fn action(&mut self, ctx: &mut ScenarioContext) -> Result<(), ScenarioError> {
                let list = ctx.virsh().cmd("vol-list").arg("poolA");
                ctx.wait_until("volumes in poolA", Retry::new(3, Duration::ZERO), |s, _| {
                    Ok(!s.run(&list)?.stdout.is_empty())
                })
            }
        }
        let exec = Arc::new(ScriptedExecutor::new());
        let result = runner(&exec).run(&mut Waits);
        assert_eq!(
            result.messages(),
            ["Action failed: volumes in poolA did not converge after 3 attempts"]
        );
        assert_eq!(exec.count("virsh vol-list"), 3);
    }

    #[test]
    fn test_dropped_context_releases_leftovers() {
        let exec = Arc::new(ScriptedExecutor::new());
        {
            let session = Session::new(exec.clone(), Duration::from_secs(5), None);
            let mut ctx = ScenarioContext::new(session, Arc::new(FsDocumentStore));
            let cmd = ctx.virsh().cmd("net-undefine").arg("n");
            ctx.acquire(ResourceKind::Network, "n", Release::command(cmd));
        }
        assert_eq!(exec.calls(), ["virsh net-undefine n"]);
    }
}
