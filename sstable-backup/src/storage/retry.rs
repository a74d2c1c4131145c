//! Retrying of storage operations.

use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Base delay between attempts (seconds)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_strategy() -> RetryStrategy {
    RetryStrategy::Exponential
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            max_attempts: default_max_attempts(),
            strategy: default_strategy(),
        }
    }
}

impl RetrySpec {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn attempts(&self) -> u32 {
        if self.enabled {
            self.max_attempts.max(1)
        } else {
            1
        }
    }

    /// Delay after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_secs(self.interval_secs);
        match self.strategy {
            RetryStrategy::Linear => base,
            RetryStrategy::Exponential => base * 2u32.saturating_pow(attempt.saturating_sub(1)),
        }
    }
}

/// Run `op` until it succeeds, attempts run out or `cancel` fires.
///
/// Cancellation errors are never retried.
pub async fn with_retry<T, F, Fut>(
    spec: &RetrySpec,
    what: &str,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = spec.attempts();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e @ BackupError::Cancelled(_)) => return Err(e),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                let delay = spec.delay(attempt);
                warn!(operation = what, attempt, max_attempts = attempts, error = %e, "Retrying after {:?}", delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(BackupError::Cancelled(what.to_string()));
                    }
                }
                attempt += 1;
            }
        }
    }
}
