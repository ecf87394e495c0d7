//! Error types for scenario execution
//!
//! Phase functions return [`ScenarioError`]; the runner turns those into
//! diagnostics on the final result. Configuration problems are reported as
//! [`ConfigError`] before anything runs.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while reading scenario parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required parameter was not supplied.
    #[error("missing required parameter '{0}'")]
    Missing(String),

    /// A parameter has a value that cannot be read as the requested type.
    #[error("parameter '{key}' expected {expected}, got '{found}'")]
    WrongType {
        /// Parameter name
        key: String,
        /// Expected type description
        expected: &'static str,
        /// The value that was found
        found: String,
    },

    /// A parameter has a value outside the accepted set.
    #[error("parameter '{key}' has unsupported value '{value}' (expected one of: {allowed})")]
    Unsupported {
        /// Parameter name
        key: String,
        /// The value that was found
        value: String,
        /// Comma-separated list of accepted values
        allowed: String,
    },

    /// A `key=value` pair or command string could not be parsed.
    #[error("invalid parameter syntax: {0}")]
    Syntax(String),
}

/// Errors that end a scenario phase.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// A setup precondition is unmet.
    #[error("precondition not met: {0}")]
    Precondition(String),

    /// A command exceeded its timeout.
    #[error("command `{command}` timed out after {}s", .timeout.as_secs())]
    CommandTimeout {
        /// The command line
        command: String,
        /// The timeout that was exceeded
        timeout: Duration,
    },

    /// A polled condition never became true.
    #[error("{what} did not converge after {attempts} attempts")]
    ConvergenceTimeout {
        /// Description of the awaited condition
        what: String,
        /// Number of probes made
        attempts: u32,
    },

    /// A checked command exited non-zero.
    #[error("exit_status={exit_status}")]
    CommandFailed {
        /// The command line
        command: String,
        /// Exit status of the command
        exit_status: i32,
        /// Captured standard error
        stderr: String,
    },

    /// A command could not be started at all.
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        /// The command line
        command: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Scenario parameters are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The host lacks something the scenario needs.
    #[error("skipped: {0}")]
    Skipped(String),

    /// A phase panicked.
    #[error("panicked: {0}")]
    Panicked(String),

    /// Any other error.
    #[error("{0:#}")]
    Other(color_eyre::Report),
}

impl From<color_eyre::Report> for ScenarioError {
    fn from(err: color_eyre::Report) -> Self {
        Self::Other(err)
    }
}

impl From<std::io::Error> for ScenarioError {
    fn from(err: std::io::Error) -> Self {
        Self::Other(err.into())
    }
}

impl ScenarioError {
    /// Whether this error marks the scenario as skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// A failure while releasing a resource.
///
/// These are recorded as secondary diagnostics and never change the
/// outcome of a scenario.
#[derive(Debug, Error)]
#[error("{resource}: {message}")]
pub struct CleanupError {
    /// Label of the resource being released
    pub resource: String,
    /// What went wrong
    pub message: String,
}
