use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    util::config::BackupConfig,
};

/// Exponential backoff for store writes.
///
/// Only errors for which [`Error::is_transient`] holds are retried; anything
/// else is returned at once. Waiting between attempts ends early, with
/// [`Error::Cancelled`], when the token is cancelled.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BackupConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            max_retries: config.retry_max_attempts,
            initial_interval: config.retry_initial(),
            max_interval: config.retry_max_interval(),
            multiplier: 2.0,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        self.initial_interval
            .mul_f64(factor)
            .min(self.max_interval.max(self.initial_interval))
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of retries.
    pub async fn run<T, F, Fut>(&self, op_name: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            let err = match cancellable(cancel, op()).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !err.is_transient() || retry >= self.max_retries {
                return Err(err);
            }
            retry += 1;
            let delay = self.delay_for(retry);
            tracing::warn!(
                "{op_name}: transient error (attempt {}/{}), retrying in {:?}: {err}",
                retry,
                self.max_retries,
                delay
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }
}

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, Fut>(cancel: &CancellationToken, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        res = fut => res,
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}
