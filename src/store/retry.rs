//! Retry policy for blob store operations.
//!
//! Every store call the runner makes is wrapped here: bounded attempts,
//! exponential backoff, jitter. Only errors the store classifies as
//! transient are retried; the wrapped operations are all idempotent.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use super::BlobStoreError;
use crate::constants::STORE_RETRY_ATTEMPTS;
use crate::constants::STORE_RETRY_INITIAL_BACKOFF;
use crate::constants::STORE_RETRY_MAX_BACKOFF;

/// Run a store operation with bounded retries on transient failures.
pub async fn with_retries<T, F, Fut>(operation: &str, mut call: F) -> Result<T, BlobStoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BlobStoreError>>,
{
    let mut backoff = STORE_RETRY_INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < STORE_RETRY_ATTEMPTS => {
                let jitter = rand::rng().random_range(0..=backoff.as_millis() as u64 / 2);
                let sleep = backoff + Duration::from_millis(jitter);
                debug!(operation, attempt, error = %err, backoff_ms = sleep.as_millis() as u64, "transient store error, backing off");
                tokio::time::sleep(sleep).await;
                backoff = (backoff * 2).min(STORE_RETRY_MAX_BACKOFF);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
