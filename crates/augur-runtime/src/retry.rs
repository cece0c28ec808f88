//! Exponential backoff for store contention.

use crate::config::RetryConfig;
use crate::store::StoreError;
use backon::{BlockingRetryable, ExponentialBuilder};
use std::time::Duration;

/// Run `op`, retrying while it fails with [`StoreError::StoreContention`].
///
/// Makes at most `config.max_attempts` calls in total. Non-retryable errors
/// are returned immediately; the last contention error is returned once
/// attempts run out.
pub fn with_contention_retry<T, F>(config: &RetryConfig, op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.min_delay)
        .with_max_delay(config.max_delay)
        .with_max_times(config.max_attempts.saturating_sub(1));

    op.retry(backoff)
        .sleep(std::thread::sleep)
        .when(StoreError::is_retryable)
        .notify(|err: &StoreError, delay: Duration| {
            tracing::warn!(error = %err, ?delay, "Store contention, retrying");
        })
        .call()
}
