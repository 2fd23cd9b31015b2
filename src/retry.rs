//! Bounded exponential backoff with jitter, and the per-invocation deadline.
//!
//! Every external call in the pipeline goes through [`with_backoff`]:
//!
//! - each attempt is wrapped in a timeout of `min(call_timeout, remaining)`;
//!   an elapsed timeout becomes the step's retryable error;
//! - retryable errors are retried up to `max_attempts`, sleeping
//!   `base * 2^(attempt-1)` (capped, with jitter in `[d/2, d]`);
//! - a retry whose delay would cross the invocation deadline is skipped and
//!   [`PipelineError::DeadlineExceeded`] is returned instead.
//!
//! A timed-out attempt is dropped, not rolled back: work the callee already
//! handed off (a statement queued on the SQLite worker, say) may still
//! complete. Callers whose effects must be known re-check after a failure,
//! as [`crate::store::ResultWriter`] does.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::RetryConfig;
use crate::error::PipelineError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Ceiling of the delay after failed attempt `attempt` (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let half = ceiling / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=(ceiling - half).as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Wall-clock budget shared by every step of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: started + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// The pipeline step an external call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fetch,
    Extract,
    Summarize,
    Store,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Fetch => "fetch",
            Step::Extract => "extract",
            Step::Summarize => "summarize",
            Step::Store => "store",
        }
    }

    fn timeout_error(&self, after: Duration) -> PipelineError {
        let msg = format!("{} call timed out after {}ms", self.as_str(), after.as_millis());
        match self {
            Step::Fetch => PipelineError::TransientStore(msg),
            Step::Extract | Step::Summarize => PipelineError::ModelUnavailable(msg),
            Step::Store => PipelineError::StoreUnavailable(msg),
        }
    }

    /// The store write is attempted once even past the deadline, so a fully
    /// processed document is not discarded at the last step.
    fn guarantees_first_attempt(&self) -> bool {
        matches!(self, Step::Store)
    }
}

/// Run `op` under the retry policy, per-call timeout, and invocation deadline.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    step: Step,
    call_timeout: Duration,
    deadline: &Deadline,
    mut op: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let budget = if attempt == 1 && step.guarantees_first_attempt() {
            call_timeout
        } else if deadline.is_expired() {
            return Err(PipelineError::DeadlineExceeded {
                step: step.as_str(),
            });
        } else {
            call_timeout.min(deadline.remaining())
        };

        let result = match tokio::time::timeout(budget, op()).await {
            Ok(result) => result,
            Err(_) => Err(step.timeout_error(budget)),
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= policy.max_attempts {
            tracing::warn!(
                step = step.as_str(),
                attempts = attempt,
                error = %err,
                "retries exhausted"
            );
            return Err(err);
        }

        let delay = policy.delay_for(attempt);
        if delay >= deadline.remaining() {
            tracing::warn!(
                step = step.as_str(),
                attempt,
                error = %err,
                "skipping retry: invocation deadline would be exceeded"
            );
            return Err(PipelineError::DeadlineExceeded {
                step: step.as_str(),
            });
        }

        tracing::warn!(
            step = step.as_str(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}
