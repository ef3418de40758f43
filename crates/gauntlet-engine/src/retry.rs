use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use gauntlet_core::config::{RetryConfig, MAX_JITTER_RATIO};
use gauntlet_core::error::NodeFailure;
use gauntlet_core::traits::{Sleeper, TokioSleeper};
use gauntlet_core::types::AttemptRecord;

/// What the unit of work knows about its own retry history.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// 1-based attempt number.
    pub attempt: u32,
    pub last_failure: Option<NodeFailure>,
    /// Backoff that will be slept if this attempt fails retryably.
    pub next_delay: Duration,
}

/// Final result of [`RetryPolicy::execute`] plus every attempt made.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: std::result::Result<T, NodeFailure>,
    pub attempts: Vec<AttemptRecord>,
    /// The deadline passed before a retry could be dispatched.
    pub cancelled: bool,
}

/// Exponential backoff with proportional jitter.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_ratio: f64,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("jitter_ratio", &self.jitter_ratio)
            .finish()
    }
}

/// Delay after a retryable failure of attempt `attempt` (1-based):
/// `base * 2^(attempt-1)` plus `jitter_ratio * sample` of that, `sample` in `[0, 1]`.
pub fn backoff_delay(base: Duration, attempt: u32, jitter_ratio: f64, sample: f64) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let delay = base.saturating_mul(factor);
    let jitter = delay.mul_f64((jitter_ratio * sample.clamp(0.0, 1.0)).max(0.0));
    delay.saturating_add(jitter)
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            jitter_ratio: MAX_JITTER_RATIO,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
            .with_jitter(config.jitter_ratio)
    }

    /// Clamped to `0..=MAX_JITTER_RATIO`.
    pub fn with_jitter(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, MAX_JITTER_RATIO);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Jittered delay to sleep after attempt `attempt` fails retryably.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt, self.jitter_ratio, rand::random::<f64>())
    }

    /// Run `op` until it succeeds, fails fatally, or the attempt budget is spent.
    ///
    /// Attempt 1 runs immediately. `deadline` is checked before every retry; once
    /// it has passed no further attempt is dispatched and the outcome is marked
    /// cancelled.
    pub async fn execute<T, F, Fut>(&self, deadline: Option<Instant>, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(RetryState) -> Fut,
        Fut: Future<Output = std::result::Result<T, NodeFailure>>,
    {
        let mut attempts = Vec::new();
        let mut delay_before = Duration::ZERO;
        let mut state = RetryState {
            attempt: 1,
            last_failure: None,
            next_delay: self.delay_for(1),
        };

        loop {
            let started_at = Utc::now();
            let result = op(state.clone()).await;
            let ended_at = Utc::now();

            let failure = match result {
                Ok(value) => {
                    attempts.push(AttemptRecord {
                        attempt: state.attempt,
                        started_at,
                        ended_at,
                        delay_before_ms: delay_before.as_millis() as u64,
                        failure: None,
                    });
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                        cancelled: false,
                    };
                }
                Err(failure) => failure,
            };

            let exhausted = state.attempt >= self.max_attempts;
            if !failure.is_retryable() || exhausted {
                let failure = failure.escalate();
                debug!(
                    attempt = state.attempt,
                    exhausted,
                    error = %failure,
                    "Giving up"
                );
                attempts.push(AttemptRecord {
                    attempt: state.attempt,
                    started_at,
                    ended_at,
                    delay_before_ms: delay_before.as_millis() as u64,
                    failure: Some(failure.clone()),
                });
                return RetryOutcome {
                    result: Err(failure),
                    attempts,
                    cancelled: false,
                };
            }

            attempts.push(AttemptRecord {
                attempt: state.attempt,
                started_at,
                ended_at,
                delay_before_ms: delay_before.as_millis() as u64,
                failure: Some(failure.clone()),
            });

            let delay = state.next_delay;
            warn!(
                attempt = state.attempt,
                max_attempts = self.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %failure,
                "Retryable failure, backing off"
            );
            self.sleeper.sleep(delay).await;

            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!(attempt = state.attempt, "Deadline passed before retry");
                return RetryOutcome {
                    result: Err(failure),
                    attempts,
                    cancelled: true,
                };
            }

            let attempt = state.attempt + 1;
            delay_before = delay;
            state = RetryState {
                attempt,
                last_failure: Some(failure),
                next_delay: self.delay_for(attempt),
            };
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use gauntlet_core::error::{FailureCategory, FailureKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records requested sleeps without waiting.
    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> BoxFuture<'_, ()> {
            self.slept.lock().unwrap().push(duration);
            Box::pin(async {})
        }
    }

    fn policy(max_attempts: u32, sleeper: Arc<RecordingSleeper>) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100))
            .with_jitter(0.0)
            .with_sleeper(sleeper)
    }

    #[test]
    fn test_backoff_doubles_without_jitter() {
        let base = Duration::from_millis(100);
        let delays: Vec<_> = (1..=5).map(|n| backoff_delay(base, n, 0.0, 0.7)).collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[4], Duration::from_millis(1600));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = RetryPolicy::new(4, Duration::from_millis(250));
        let bound = Duration::from_millis(250 * 8).mul_f64(1.2);
        for attempt in 1..=4 {
            let floor = backoff_delay(Duration::from_millis(250), attempt, 0.0, 0.0);
            for _ in 0..200 {
                let d = policy.delay_for(attempt);
                assert!(d >= floor);
                assert!(d <= floor.mul_f64(1.2) + Duration::from_micros(1));
                assert!(d <= bound + Duration::from_micros(1));
            }
        }
    }

    #[test]
    fn test_oversized_jitter_is_capped() {
        let policy = RetryPolicy::new(4, Duration::from_millis(250)).with_jitter(1.0);
        assert!((policy.jitter_ratio - MAX_JITTER_RATIO).abs() < f64::EPSILON);
        for attempt in 1..=4 {
            let floor = backoff_delay(Duration::from_millis(250), attempt, 0.0, 0.0);
            for _ in 0..200 {
                assert!(policy.delay_for(attempt) <= floor.mul_f64(1.2) + Duration::from_micros(1));
            }
        }
    }

    #[tokio::test]
    async fn test_retryable_then_success() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let calls = AtomicU32::new(0);
        let outcome = policy(3, sleeper.clone())
            .execute(None, |state| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(state.attempt, n);
                async move {
                    if n < 3 {
                        Err(NodeFailure::retryable(FailureCategory::Transient, "503"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "done");
        assert_eq!(outcome.attempts.len(), 3);
        assert!(outcome.attempts[2].failure.is_none());
        assert_eq!(outcome.attempts[1].delay_before_ms, 100);
        assert_eq!(outcome.attempts[2].delay_before_ms, 200);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test]
    async fn test_fatal_stops_immediately() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let outcome: RetryOutcome<()> = policy(5, sleeper.clone())
            .execute(None, |_| async {
                Err(NodeFailure::fatal(FailureCategory::Permanent, "401"))
            })
            .await;

        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.category, FailureCategory::Permanent);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_escalates_to_fatal() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let outcome: RetryOutcome<()> = policy(3, sleeper.clone())
            .execute(None, |_| async {
                Err(NodeFailure::retryable(FailureCategory::Transient, "timeout"))
            })
            .await;

        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Fatal);
        assert_eq!(failure.category, FailureCategory::Transient);
        assert_eq!(outcome.attempts.len(), 3);
        assert_eq!(sleeper.slept.lock().unwrap().len(), 2);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn test_last_failure_is_visible_to_next_attempt() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let outcome = policy(2, sleeper)
            .execute(None, |state| async move {
                match state.last_failure {
                    None => Err(NodeFailure::retryable(FailureCategory::Malformed, "not json")),
                    Some(prev) => Ok(prev.category),
                }
            })
            .await;
        assert_eq!(outcome.result.unwrap(), FailureCategory::Malformed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_blocks_retry() {
        let policy = RetryPolicy::new(5, Duration::from_secs(2)).with_jitter(0.0);
        let deadline = Instant::now() + Duration::from_secs(1);
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = policy
            .execute(Some(deadline), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(NodeFailure::retryable(FailureCategory::Transient, "429")) }
            })
            .await;

        assert!(outcome.cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts.len(), 1);
    }
}
