//! Bounded exponential-backoff retry for transient broker failures.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::{BrokerError, ConnectivityError};

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Retry policy applied to broker connect and send operations.
///
/// Only [`BrokerError::Unreachable`] is retried; every other failure is
/// application-level and surfaces immediately. Delay for attempt *n* is
/// `base_delay * 2^(n-1)`, capped at `max_delay`; with the default 2s base
/// that is 2s, 4s, 8s, ... after the first, second, third failure.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    sleeper: Sleeper,
}

impl RetryPolicy {
    /// Exponential backoff bounded at `max_attempts` total attempts.
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            sleeper: Arc::new(|delay| std::thread::sleep(delay)),
        }
    }

    /// Replace the sleeping primitive; tests record delays instead of waiting.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before retrying after the `attempt`-th failure (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = 2_f64.powi((attempt - 1) as i32);
        let delay_ms = (self.base_delay.as_millis() as f64 * exp)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Run `op`, retrying transient failures until it succeeds or the
    /// attempt budget is spent.
    pub fn run<T>(
        &self,
        mut op: impl FnMut() -> Result<T, BrokerError>,
    ) -> Result<T, ConnectivityError> {
        let mut attempt = 1u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(BrokerError::Unreachable(reason)) if attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient broker failure; backing off"
                    );
                    (self.sleeper)(delay);
                    attempt += 1;
                }
                Err(BrokerError::Unreachable(reason)) => {
                    return Err(ConnectivityError::Exhausted {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(err) => return Err(ConnectivityError::Fatal(err)),
            }
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_policy(max_attempts: u32) -> (RetryPolicy, Arc<Mutex<Vec<Duration>>>) {
        let delays = Arc::new(Mutex::new(Vec::new()));
        let seen = delays.clone();
        let policy = RetryPolicy::exponential(max_attempts)
            .with_sleeper(move |d| seen.lock().unwrap().push(d));
        (policy, delays)
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::exponential(5);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::exponential(20);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(120));
    }

    #[test]
    fn succeeds_after_transient_failures_with_increasing_delays() {
        let (policy, delays) = recording_policy(5);
        let mut calls = 0u32;

        let result = policy.run(|| {
            calls += 1;
            if calls <= 3 {
                Err(BrokerError::unreachable("connection refused"))
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result.unwrap(), 4);
        let delays = delays.lock().unwrap();
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let (policy, delays) = recording_policy(3);
        let mut calls = 0u32;

        let err = policy
            .run::<()>(|| {
                calls += 1;
                Err(BrokerError::unreachable("connection refused"))
            })
            .unwrap_err();

        assert_eq!(calls, 3);
        // Sleeps happen between attempts only.
        assert_eq!(delays.lock().unwrap().len(), 2);
        match err {
            ConnectivityError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn non_transient_failures_are_not_retried() {
        let (policy, delays) = recording_policy(5);
        let mut calls = 0u32;

        let err = policy
            .run::<()>(|| {
                calls += 1;
                Err(BrokerError::other("access refused"))
            })
            .unwrap_err();

        assert_eq!(calls, 1);
        assert!(delays.lock().unwrap().is_empty());
        assert!(matches!(err, ConnectivityError::Fatal(BrokerError::Other(_))));
    }
}
