//! Bounded retry with escalating slippage and linear backoff.
//!
//! Every mutating action goes through one `RetryExecutor`. An attempt gets its
//! own slippage tolerance and confirmation timeout; a timeout counts as a
//! failed attempt. Errors that retrying cannot fix abort immediately.

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ExecutionConfig;
use crate::error::ExecutionError;

pub const SWAP_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const MINT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(600);
pub const DECREASE_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(300);
pub const COLLECT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_slippage_pct: f64,
    pub slippage_step_pct: f64,
    pub base_delay: Duration,
    pub delay_increment: Duration,
    pub confirmation_timeout: Duration,
}

impl RetryPolicy {
    pub fn swap(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            base_slippage_pct: config.swap_base_slippage_pct,
            slippage_step_pct: config.swap_slippage_step_pct,
            base_delay: config.swap_retry_delay,
            delay_increment: config.swap_retry_increment,
            confirmation_timeout: SWAP_CONFIRMATION_TIMEOUT,
        }
    }

    pub fn position_create(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            base_slippage_pct: config.position_base_slippage_pct,
            slippage_step_pct: config.position_slippage_step_pct,
            base_delay: config.position_retry_delay,
            delay_increment: config.position_retry_increment,
            confirmation_timeout: MINT_CONFIRMATION_TIMEOUT,
        }
    }

    /// Closing takes everything with zero minimums, so slippage does not apply.
    pub fn position_close(config: &ExecutionConfig, confirmation_timeout: Duration) -> Self {
        Self {
            max_attempts: config.max_retries,
            base_slippage_pct: 0.0,
            slippage_step_pct: 0.0,
            base_delay: config.position_retry_delay,
            delay_increment: config.position_retry_increment,
            confirmation_timeout,
        }
    }

    /// Tolerance for 0-indexed `attempt`.
    pub fn slippage_for(&self, attempt: u32) -> f64 {
        self.base_slippage_pct + attempt as f64 * self.slippage_step_pct
    }

    /// Wait after failed 0-indexed `attempt` before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay + self.delay_increment * attempt
    }
}

/// What one attempt is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptContext {
    pub attempt: u32,
    pub slippage_pct: f64,
    pub confirmation_timeout: Duration,
}

impl AttemptContext {
    /// `amount × (1 − slippage)`, floored at zero.
    pub fn min_amount(&self, amount: f64) -> f64 {
        (amount * (1.0 - self.slippage_pct / 100.0)).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last_error: ExecutionError },
    /// A non-retryable error stopped the loop early.
    Aborted { attempts: u32, error: ExecutionError },
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Aborted { attempts, .. } => *attempts,
        }
    }

    pub fn error(&self) -> Option<&ExecutionError> {
        match self {
            RetryOutcome::Succeeded { .. } => None,
            RetryOutcome::Exhausted { last_error, .. } => Some(last_error),
            RetryOutcome::Aborted { error, .. } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, ExecutionError> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
            RetryOutcome::Aborted { error, .. } => Err(error),
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute<T, F, Fut>(&self, label: &str, mut action: F) -> RetryOutcome<T>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, ExecutionError>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = ExecutionError::Submission("no attempt made".to_string());

        for attempt in 0..max_attempts {
            let ctx = AttemptContext {
                attempt,
                slippage_pct: self.policy.slippage_for(attempt),
                confirmation_timeout: self.policy.confirmation_timeout,
            };
            info!(
                "🔄 {} attempt {}/{} (slippage {:.2}%)",
                label,
                attempt + 1,
                max_attempts,
                ctx.slippage_pct
            );

            match action(ctx).await {
                Ok(value) => {
                    info!("✅ {} succeeded on attempt {}", label, attempt + 1);
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt + 1,
                    };
                }
                Err(e) if !e.is_retryable() => {
                    warn!("❌ {} aborted: {}", label, e);
                    return RetryOutcome::Aborted {
                        attempts: attempt + 1,
                        error: e,
                    };
                }
                Err(e) => {
                    warn!("⚠️ {} attempt {} failed: {}", label, attempt + 1, e);
                    last_error = e;
                }
            }

            if attempt + 1 < max_attempts {
                let wait = self.policy.delay_after(attempt);
                if !wait.is_zero() {
                    info!("⏳ Waiting {:?} before retrying {}", wait, label);
                    tokio::time::sleep(wait).await;
                }
            }
        }

        warn!("❌ All {} {} attempts failed", max_attempts, label);
        RetryOutcome::Exhausted {
            attempts: max_attempts,
            last_error,
        }
    }
}
