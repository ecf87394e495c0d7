//! Tracking of external resources created by a scenario
//!
//! Every pool, network, disk or backup a scenario creates is registered with
//! the [`ResourceTracker`] together with a [`Release`] describing how to
//! undo it. The runner releases whatever is still held, newest first, once
//! the scenario phases are done. Each resource is released at most once.

use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

use crate::cmdext::CommandLine;
use crate::error::{CleanupError, ScenarioError};
use crate::session::Session;

/// What kind of external object a resource is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceKind {
    /// A storage pool
    Pool,
    /// A storage volume
    Volume,
    /// A virtual network
    Network,
    /// A disk attached to a domain
    Disk,
    /// A node device such as a vHBA
    NodeDevice,
    /// A libvirt secret
    Secret,
    /// A domain checkpoint
    Checkpoint,
    /// Saved configuration restored on release
    Backup,
}

/// Opaque identifier for a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle(u64);

/// A single command run while releasing a resource.
#[derive(Debug, Clone)]
pub struct CleanupStep {
    /// Command to run
    pub command: CommandLine,
    /// Whether a non-zero exit status is acceptable
    pub allow_failure: bool,
}

impl CleanupStep {
    /// A step that must succeed.
    pub fn required(command: CommandLine) -> Self {
        Self {
            command,
            allow_failure: false,
        }
    }

    /// A step whose exit status is ignored.
    pub fn tolerated(command: CommandLine) -> Self {
        Self {
            command,
            allow_failure: true,
        }
    }
}

/// Custom release logic.
pub type ReleaseFn = Box<dyn FnOnce(&mut Session) -> Result<(), ScenarioError> + Send>;

/// How to undo a resource.
pub enum Release {
    /// Run these commands in order; every step is attempted.
    Steps(Vec<CleanupStep>),
    /// Run arbitrary code with access to the session.
    Custom(ReleaseFn),
}

impl Release {
    /// Release with a single required command.
    pub fn command(command: CommandLine) -> Self {
        Self::Steps(vec![CleanupStep::required(command)])
    }

    /// Release with custom code.
    pub fn custom<F>(f: F) -> Self
    where
        F: FnOnce(&mut Session) -> Result<(), ScenarioError> + Send + 'static,
    {
        Self::Custom(Box::new(f))
    }

    fn run(self, session: &mut Session) -> Result<(), String> {
        match self {
            Release::Steps(steps) => {
                let mut errors = Vec::new();
                for step in steps {
                    match session.run(&step.command) {
                        Ok(out) if out.success() || step.allow_failure => {}
                        Ok(out) => errors.push(format!(
                            "`{}` exited with status {}: {}",
                            step.command,
                            out.exit_status,
                            out.stderr.trim()
                        )),
                        Err(e) => errors.push(e.to_string()),
                    }
                }
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(errors.join("; "))
                }
            }
            Release::Custom(f) => f(session).map_err(|e| e.to_string()),
        }
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Release::Steps(steps) => f.debug_tuple("Steps").field(steps).finish(),
            Release::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug)]
struct Entry {
    handle: ResourceHandle,
    kind: ResourceKind,
    name: String,
    release: Option<Release>,
}

impl Entry {
    fn label(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }
}

/// Owns the release actions of every resource acquired during a run.
#[derive(Debug, Default)]
pub struct ResourceTracker {
    next: u64,
    entries: Vec<Entry>,
    released: Vec<String>,
}

impl ResourceTracker {
    /// An empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource and how to release it.
    pub fn acquire(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        release: Release,
    ) -> ResourceHandle {
        let handle = ResourceHandle(self.next);
        self.next += 1;
        let entry = Entry {
            handle,
            kind,
            name: name.into(),
            release: Some(release),
        };
        debug!("Acquired {}", entry.label());
        self.entries.push(entry);
        handle
    }

    /// Number of resources not yet released.
    pub fn held(&self) -> usize {
        self.entries.iter().filter(|e| e.release.is_some()).count()
    }

    /// Whether `handle` refers to a resource that is still held.
    pub fn is_held(&self, handle: ResourceHandle) -> bool {
        self.entries
            .iter()
            .any(|e| e.handle == handle && e.release.is_some())
    }

    /// Labels (`kind:name`) of released resources, in release order.
    pub fn released(&self) -> &[String] {
        &self.released
    }

    pub(crate) fn take_released(&mut self) -> Vec<String> {
        std::mem::take(&mut self.released)
    }

    /// Release one resource now.
    ///
    /// Releasing an unknown or already released handle does nothing.
    pub fn release(
        &mut self,
        handle: ResourceHandle,
        session: &mut Session,
    ) -> Result<(), CleanupError> {
        match self.entries.iter().position(|e| e.handle == handle) {
            Some(idx) => self.release_at(idx, session),
            None => Ok(()),
        }
    }

    /// Release everything still held, newest first.
    ///
    /// Every release is attempted; failures are returned in the order they
    /// happened.
    pub fn release_all(&mut self, session: &mut Session) -> Vec<CleanupError> {
        (0..self.entries.len())
            .rev()
            .filter_map(|idx| self.release_at(idx, session).err())
            .collect()
    }

    fn release_at(&mut self, idx: usize, session: &mut Session) -> Result<(), CleanupError> {
        let entry = &mut self.entries[idx];
        let Some(release) = entry.release.take() else {
            return Ok(());
        };
        let label = entry.label();
        debug!("Releasing {label}");
        self.released.push(label.clone());

        let r = catch_unwind(AssertUnwindSafe(|| release.run(session)))
            .unwrap_or_else(|_| Err("release panicked".to_owned()));
        r.map_err(|message| {
            warn!("Failed to release {label}: {message}");
            CleanupError {
                resource: label,
                message,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdext::CommandOutput;
    use crate::executor::scripted::ScriptedExecutor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn session(exec: ScriptedExecutor) -> (Arc<ScriptedExecutor>, Session) {
        let exec = Arc::new(exec);
        let session = Session::new(exec.clone(), Duration::from_secs(5), None);
        (exec, session)
    }

    fn virsh(args: &str) -> CommandLine {
        CommandLine::parse(&format!("virsh {args}")).unwrap()
    }

    #[test]
    fn test_release_all_is_reverse_order() {
        let (exec, mut session) = session(ScriptedExecutor::new());
        let mut tracker = ResourceTracker::new();
        tracker.acquire(ResourceKind::Pool, "p", Release::command(virsh("pool-undefine p")));
        tracker.acquire(ResourceKind::Volume, "v", Release::command(virsh("vol-delete v --pool p")));
        tracker.acquire(ResourceKind::Disk, "vdb", Release::command(virsh("detach-disk vm vdb")));

        assert!(tracker.release_all(&mut session).is_empty());
        assert_eq!(tracker.released(), ["disk:vdb", "volume:v", "pool:p"]);
        assert_eq!(
            exec.calls(),
            [
                "virsh detach-disk vm vdb",
                "virsh vol-delete v --pool p",
                "virsh pool-undefine p"
            ]
        );
        assert_eq!(tracker.held(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (exec, mut session) = session(ScriptedExecutor::new());
        let mut tracker = ResourceTracker::new();
        let h = tracker.acquire(ResourceKind::Network, "n", Release::command(virsh("net-undefine n")));
        assert!(tracker.is_held(h));

        tracker.release(h, &mut session).unwrap();
        tracker.release(h, &mut session).unwrap();
        assert!(tracker.release_all(&mut session).is_empty());
        assert!(!tracker.is_held(h));
        assert_eq!(exec.count("virsh net-undefine"), 1);
        assert_eq!(tracker.released(), ["network:n"]);

        // A handle from another tracker is unknown here
        let mut other = ResourceTracker::new();
        other.acquire(ResourceKind::Pool, "x", Release::Steps(vec![]));
        let foreign = other.acquire(ResourceKind::Pool, "y", Release::Steps(vec![]));
        tracker.release(foreign, &mut session).unwrap();
    }

    #[test]
    fn test_steps_continue_after_failure() {
        let exec = ScriptedExecutor::new()
            .on("virsh pool-destroy", CommandOutput::failed(1, "not active"))
            .on("virsh pool-undefine", CommandOutput::failed(1, "busy"));
        let (exec, mut session) = session(exec);
        let mut tracker = ResourceTracker::new();
        tracker.acquire(
            ResourceKind::Pool,
            "poolA",
            Release::Steps(vec![
                CleanupStep::tolerated(virsh("pool-destroy poolA")),
                CleanupStep::required(virsh("pool-undefine poolA")),
                CleanupStep::required(virsh("pool-delete poolA")),
            ]),
        );
        let errors = tracker.release_all(&mut session);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].resource, "pool:poolA");
        assert_eq!(
            errors[0].message,
            "`virsh pool-undefine poolA` exited with status 1: busy"
        );
        assert_eq!(exec.calls().len(), 3);
    }

    #[test]
    fn test_custom_release_runs_once_even_when_failing() {
        let (_exec, mut session) = session(ScriptedExecutor::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tracker = ResourceTracker::new();
        let c = calls.clone();
        tracker.acquire(
            ResourceKind::Backup,
            "domain-xml",
            Release::custom(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ScenarioError::Precondition("boom".into()))
            }),
        );
        tracker.acquire(
            ResourceKind::Secret,
            "s",
            Release::custom(|_| panic!("release exploded")),
        );
        let errors = tracker.release_all(&mut session);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].to_string(), "secret:s: release panicked");
        assert_eq!(errors[1].resource, "backup:domain-xml");
        assert!(tracker.release_all(&mut session).is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
