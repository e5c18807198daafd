//! Bounded retry for mutating entry points.

use std::time::Duration;

use tracing::warn;

use crate::error::{DeploymentError, DeploymentResult};

/// Run `op` until it succeeds, fails permanently, or `max_attempts` transient
/// failures have been seen. Sleeps `backoff` between attempts.
///
/// `op` must open its own unit of work so every attempt starts from committed
/// state. Exhaustion is reported as [`DeploymentError::RetriesExhausted`].
pub fn with_retry<T>(
    max_attempts: u32,
    backoff: Duration,
    mut op: impl FnMut() -> DeploymentResult<T>,
) -> DeploymentResult<T> {
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= max_attempts {
                    warn!(attempts = attempt, error = %e, "retries exhausted");
                    return Err(DeploymentError::RetriesExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                warn!(attempt, max_attempts, error = %e, "transient conflict, retrying");
                std::thread::sleep(backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflict() -> DeploymentError {
        DeploymentError::TransientConflict("target dev-1 changed".to_string())
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = with_retry(3, Duration::ZERO, || {
            calls += 1;
            if calls < 3 { Err(conflict()) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut calls = 0;
        let result: DeploymentResult<()> = with_retry(3, Duration::ZERO, || {
            calls += 1;
            Err(conflict())
        });
        assert_eq!(calls, 3);
        match result {
            Err(DeploymentError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.contains("dev-1"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let mut calls = 0;
        let result: DeploymentResult<()> = with_retry(3, Duration::ZERO, || {
            calls += 1;
            Err(DeploymentError::not_found("action", 1))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(DeploymentError::NotFound { .. })));
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let mut calls = 0;
        let _ = with_retry(0, Duration::ZERO, || {
            calls += 1;
            Err::<(), _>(conflict())
        });
        assert_eq!(calls, 1);
    }
}
