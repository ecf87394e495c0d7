//! Bounded polling

use std::time::Duration;
use tracing::debug;

use crate::config::ScenarioConfig;
use crate::error::{ConfigError, ScenarioError};

/// Bounded retry policy: a fixed number of probes with a fixed delay between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retry {
    /// Maximum number of probes (at least one is always made)
    pub attempts: u32,
    /// Delay between consecutive probes
    pub delay: Duration,
}

impl Retry {
    /// A policy with `attempts` probes spaced by `delay`.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Read `wait_attempts` and `wait_delay_secs` from scenario parameters.
    pub fn from_config(config: &ScenarioConfig, default_attempts: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            attempts: config.count("wait_attempts", default_attempts)?,
            delay: Duration::from_secs(config.count("wait_delay_secs", 1)?.into()),
        })
    }
}

/// Probe until `probe` reports convergence.
///
/// The probe receives the 1-based attempt number. Errors from the probe end
/// the wait immediately. After `retry.attempts` unsuccessful probes this
/// returns [`ScenarioError::ConvergenceTimeout`]; there is no sleep after the
/// last probe.
pub fn poll_until<F>(what: &str, retry: Retry, mut probe: F) -> Result<(), ScenarioError>
where
    F: FnMut(u32) -> Result<bool, ScenarioError>,
{
    let attempts = retry.attempts.max(1);
    for attempt in 1..=attempts {
        if probe(attempt)? {
            debug!("{what} converged after {attempt} attempt(s)");
            return Ok(());
        }
        if attempt < attempts {
            std::thread::sleep(retry.delay);
        }
    }
    Err(ScenarioError::ConvergenceTimeout {
        what: what.to_owned(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_never_converges_after_exact_attempts() {
        let mut probes = 0;
        let err = poll_until("pool volumes", Retry::new(3, Duration::from_millis(10)), |_| {
            probes += 1;
            Ok(false)
        })
        .unwrap_err();
        assert_eq!(probes, 3);
        assert!(matches!(
            err,
            ScenarioError::ConvergenceTimeout { attempts: 3, .. }
        ));
    }

    #[test]
    fn test_sleeps_only_between_attempts() {
        let start = Instant::now();
        let _ = poll_until("x", Retry::new(3, Duration::from_millis(50)), |_| Ok(false));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150) + Duration::from_millis(500));
    }

    #[test]
    fn test_converges_and_propagates_errors() {
        poll_until("x", Retry::new(5, Duration::ZERO), |n| Ok(n == 2)).unwrap();
        let err = poll_until("x", Retry::new(5, Duration::ZERO), |_| {
            Err(ScenarioError::Precondition("gone".into()))
        })
        .unwrap_err();
        assert!(matches!(err, ScenarioError::Precondition(_)));
    }

    #[test]
    fn test_zero_attempts_still_probes_once() {
        let mut probes = 0;
        let _ = poll_until("x", Retry::new(0, Duration::ZERO), |_| {
            probes += 1;
            Ok(false)
        });
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_from_config() {
        let config: ScenarioConfig = [("wait_attempts", 4i64), ("wait_delay_secs", 0)]
            .into_iter()
            .collect();
        assert_eq!(
            Retry::from_config(&config, 10).unwrap(),
            Retry::new(4, Duration::ZERO)
        );
        assert_eq!(
            Retry::from_config(&ScenarioConfig::default(), 10).unwrap(),
            Retry::new(10, Duration::from_secs(1))
        );
    }
}
