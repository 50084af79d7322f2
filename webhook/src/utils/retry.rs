/*
This file contains a bounded retry with a fixed, jittered delay.
The placement decision uses it to wait for the workload cache
to catch up with objects the admission request already references.
Sleeping goes through a Sleeper so tests can observe delays.
*/

use std::{
    future::Future,
    time::Duration
};
use rand::Rng;
use tracing::debug;



// Jitter above this would let a sleep shrink to nothing.
pub const MAX_JITTER: f64 = 0.99;

/*
Retry budget for operations waiting on an eventually consistent view.
`max_attempts` counts the first attempt too; `jitter` is the fraction
of `base_delay` added or removed at random on every sleep.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /*
    This function computes the delay of one sleep:
    base_delay scaled by a random factor in [1 - jitter, 1 + jitter].
    */
    pub fn jittered_delay(&self) -> Duration {
        let jitter = self.effective_jitter();
        if jitter == 0.0 {
            return self.base_delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * factor)
    }

    // NaN and out of range values never reach the random range.
    fn effective_jitter(&self) -> f64 {
        if self.jitter.is_finite() {
            self.jitter.clamp(0.0, MAX_JITTER)
        } else {
            0.0
        }
    }

    // Longest wall-clock time the sleeps of one retry loop can add up to.
    pub fn max_total_delay(&self) -> Duration {
        let sleeps = self.max_attempts.max(1) - 1;
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * (1.0 + self.effective_jitter()) * sleeps as f64)
    }
}

// Source of delays for the retry loop.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, delay: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(delay)
    }
}

/*
Outcome of a single attempt: the final value, or the
reason the operation should be tried again.
*/
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T> {
    Done(T),
    Retry(String),
}

// The retry budget ran out; carries the reason given by the last attempt.
#[derive(Debug, PartialEq, Eq)]
pub struct RetriesExhausted {
    pub attempts: u32,
    pub last_reason: String,
}

/*
This function runs `operation` until it returns Done or the
policy runs out of attempts. No sleep follows the last attempt.
The operation is synchronous on purpose: it must never hold a
lock across the sleep.
*/
pub async fn retry_bounded<T, F, S>(
    policy: &RetryPolicy,
    sleeper: &S,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetriesExhausted>
where
    F: FnMut() -> Attempt<T>,
    S: Sleeper,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation() {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry(reason) => {
                if attempt >= max_attempts {
                    return Err(RetriesExhausted {
                        attempts: attempt,
                        last_reason: reason,
                    });
                }
                let delay = policy.jittered_delay();
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    reason = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Not ready yet, retrying"
                );
                sleeper.sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    // Records requested delays and returns immediately.
    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub(crate) delays: Mutex<Vec<Duration>>,
    }

    impl RecordingSleeper {
        pub(crate) fn total(&self) -> Duration {
            self.delays.lock().unwrap().iter().sum()
        }

        pub(crate) fn count(&self) -> usize {
            self.delays.lock().unwrap().len()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, delay: Duration) -> impl Future<Output = ()> + Send {
            self.delays.lock().unwrap().push(delay);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn succeeds_immediately_without_sleeping() {
        let sleeper = RecordingSleeper::default();
        let result = retry_bounded(&RetryPolicy::default(), &sleeper, "op", || Attempt::Done(42)).await;
        assert_eq!(result, Ok(42));
        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test]
    async fn succeeds_after_pending_attempts() {
        let sleeper = RecordingSleeper::default();
        let mut calls = 0;
        let result = retry_bounded(&RetryPolicy::default(), &sleeper, "op", || {
            calls += 1;
            if calls < 3 {
                Attempt::Retry("not cached".to_string())
            } else {
                Attempt::Done("ready")
            }
        })
        .await;

        assert_eq!(result, Ok("ready"));
        assert_eq!(calls, 3);
        assert_eq!(sleeper.count(), 2);
    }

    #[tokio::test]
    async fn exhausts_budget_with_bounded_delay() {
        let policy = RetryPolicy::default();
        let sleeper = RecordingSleeper::default();
        let mut calls = 0;
        let result: Result<(), _> = retry_bounded(&policy, &sleeper, "op", || {
            calls += 1;
            Attempt::Retry(format!("attempt {calls}"))
        })
        .await;

        assert_eq!(
            result,
            Err(RetriesExhausted {
                attempts: 5,
                last_reason: "attempt 5".to_string(),
            })
        );
        assert_eq!(calls, 5);
        assert_eq!(sleeper.count(), 4);
        assert!(sleeper.total() <= policy.max_total_delay() + Duration::from_millis(1));
        assert!(sleeper.total() >= Duration::from_millis(4 * 89));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let delay = policy.jittered_delay();
            assert!(delay >= Duration::from_millis(89), "{delay:?}");
            assert!(delay <= Duration::from_millis(111), "{delay:?}");
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.jittered_delay(), Duration::from_millis(100));
        assert_eq!(policy.max_total_delay(), Duration::from_millis(400));
    }

    #[test]
    fn non_finite_jitter_is_ignored() {
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let policy = RetryPolicy {
                jitter,
                ..RetryPolicy::default()
            };
            assert_eq!(policy.jittered_delay(), Duration::from_millis(100));
            assert_eq!(policy.max_total_delay(), Duration::from_millis(400));
        }

        let wide = RetryPolicy {
            jitter: 5.0,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            assert!(wide.jittered_delay() <= Duration::from_millis(199));
        }
    }
}
