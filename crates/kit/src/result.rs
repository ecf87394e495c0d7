//! Scenario outcome records

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// The phases of a scenario run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Acquire preconditions
    Setup,
    /// Perform the state change under test
    Action,
    /// Compare observed state against expectations
    Verify,
    /// Release everything acquired
    Cleanup,
}

/// Final classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Outcome {
    /// No failures were recorded
    Passed,
    /// A phase failed or a verification did not hold
    Failed,
    /// The host lacks something the scenario needs
    Skipped,
}

impl Outcome {
    /// Process exit code for this outcome (automake convention for skips).
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Passed => 0,
            Outcome::Failed => 1,
            Outcome::Skipped => 77,
        }
    }
}

/// What kind of problem a [`Diagnostic`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiagnosticKind {
    /// An error that ended its phase
    PhaseError,
    /// A collected expectation mismatch
    Verification,
    /// The scenario declined to run
    Skipped,
    /// A resource could not be released
    Cleanup,
}

/// One entry in the ordered diagnostics of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    /// Kind of diagnostic
    pub kind: DiagnosticKind,
    /// Phase in which it was recorded
    pub phase: Phase,
    /// Human-readable detail
    pub message: String,
}

impl Diagnostic {
    pub(crate) fn new(kind: DiagnosticKind, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            message: message.into(),
        }
    }

    /// Whether this diagnostic makes the run fail.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.kind,
            DiagnosticKind::PhaseError | DiagnosticKind::Verification
        )
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DiagnosticKind::PhaseError => write!(f, "{} failed: {}", self.phase, self.message),
            DiagnosticKind::Verification => f.write_str(&self.message),
            DiagnosticKind::Skipped => write!(f, "{} skipped: {}", self.phase, self.message),
            DiagnosticKind::Cleanup => write!(f, "cleanup: {}", self.message),
        }
    }
}

/// A command that ran to completion during a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapturedCommand {
    /// Phase that ran the command
    pub phase: Phase,
    /// The command line as a shell string
    pub command: String,
    /// Exit status
    pub exit_status: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

/// Outcome record of one scenario run. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    scenario: String,
    outcome: Outcome,
    success: bool,
    diagnostics: Vec<Diagnostic>,
    outputs: Vec<CapturedCommand>,
    released: Vec<String>,
    started_at: DateTime<Utc>,
    duration_ms: u64,
}

impl ScenarioResult {
    pub(crate) fn new(
        scenario: &str,
        diagnostics: Vec<Diagnostic>,
        outputs: Vec<CapturedCommand>,
        released: Vec<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let outcome = if diagnostics.iter().any(Diagnostic::is_failure) {
            Outcome::Failed
        } else if diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::Skipped)
        {
            Outcome::Skipped
        } else {
            Outcome::Passed
        };
        Self {
            scenario: scenario.to_owned(),
            outcome,
            success: outcome == Outcome::Passed,
            diagnostics,
            outputs,
            released,
            started_at,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Name of the scenario that ran.
    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    /// Final outcome.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Whether the scenario passed.
    pub fn success(&self) -> bool {
        self.success
    }

    /// All diagnostics in the order they were recorded.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Rendered diagnostic messages.
    pub fn messages(&self) -> Vec<String> {
        self.diagnostics.iter().map(ToString::to_string).collect()
    }

    /// Commands that ran, in order.
    pub fn outputs(&self) -> &[CapturedCommand] {
        &self.outputs
    }

    /// Labels of released resources, in release order.
    pub fn released(&self) -> &[String] {
        &self.released
    }

    /// When the run started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock duration of the run.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}
