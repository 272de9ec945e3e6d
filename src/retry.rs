//! Retry with exponential backoff and jitter
//!
//! Wraps an execution closure and re-invokes it until it succeeds, the
//! retryability predicate rejects the result, or the budget is exhausted.
//! Retry decisions consider the execution result, not the error type: a
//! predicate may allow retrying an unreachable host but refuse to retry a
//! clean non-zero exit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{EventBus, EventPayload};
use crate::result::ExecutionResult;

/// Decides whether a failed result is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&ExecutionResult) -> bool + Send + Sync>;

/// Observer invoked before each retry sleep.
pub type RetryObserver = Arc<dyn Fn(u32, &Duration) + Send + Sync>;

/// Backoff policy.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Perturb each delay uniformly by ±25%.
    pub jitter: bool,
    /// Predicate gating retries of non-zero exits; `None` retries any
    /// failed result.
    pub is_retryable: Option<RetryPredicate>,
    /// Hook invoked with (attempt, delay) before each retry.
    pub on_retry: Option<RetryObserver>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            is_retryable: None,
            on_retry: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with the given retry count and defaults elsewhere.
    pub fn times(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Set the initial delay.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Gate retries with a result predicate.
    pub fn retry_if(mut self, predicate: RetryPredicate) -> Self {
        self.is_retryable = Some(predicate);
        self
    }

    /// Observe retries.
    pub fn on_retry(mut self, observer: RetryObserver) -> Self {
        self.on_retry = Some(observer);
        self
    }

    /// Delay before retry number `attempt` (0-based):
    /// `min(initial × multiplier^attempt, max)`, optionally jittered ±25%.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Run `op` under `policy`, publishing `retry:*` events on `events`.
///
/// `op` receives the 0-based attempt number. A result with exit 0 returns
/// immediately. A failed result consults the predicate: not retryable, or
/// out of budget, yields [`Error::RetryExhausted`] carrying every interim
/// result. Transport errors are retried until the budget runs out, then
/// surface inside `RetryExhausted` as `last_error`.
pub async fn retry_execute<F, Fut>(
    policy: &RetryPolicy,
    events: &EventBus,
    mut op: F,
) -> Result<ExecutionResult>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<ExecutionResult>>,
{
    let started = std::time::Instant::now();
    let mut results: Vec<ExecutionResult> = Vec::new();
    let mut last_error: Option<Error> = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt - 1);
            debug!(
                attempt,
                total = policy.max_retries + 1,
                ?delay,
                "retrying command"
            );
            if let Some(observer) = &policy.on_retry {
                observer(attempt, &delay);
            }
            events.publish(EventPayload::RetryAttempt { attempt, delay });
            tokio::time::sleep(delay).await;
        }

        match op(attempt).await {
            Ok(result) if result.ok() => {
                if attempt > 0 {
                    events.publish(EventPayload::RetrySuccess {
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                    });
                }
                return Ok(result);
            }
            Ok(result) => {
                let retryable = policy
                    .is_retryable
                    .as_ref()
                    .map(|p| p(&result))
                    .unwrap_or(true);
                results.push(result);
                if !retryable {
                    warn!("result not retryable, giving up after {} attempts", attempt + 1);
                    events.publish(EventPayload::RetryFailed {
                        attempts: attempt + 1,
                        elapsed: started.elapsed(),
                    });
                    return Err(Error::RetryExhausted {
                        attempts: attempt + 1,
                        last_error: None,
                        results,
                    });
                }
            }
            Err(e) => {
                warn!(error = %e, attempt, "attempt failed");
                last_error = Some(e);
            }
        }
    }

    events.publish(EventPayload::RetryFailed {
        attempts: policy.max_retries + 1,
        elapsed: started.elapsed(),
    });
    Err(Error::RetryExhausted {
        attempts: policy.max_retries + 1,
        last_error: last_error.map(|e| e.to_string()),
        results,
    })
}
