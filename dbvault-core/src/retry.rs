//! Bounded retry of transient chunk I/O.

use crate::Result;
use crate::config::RetryPolicy;
use crate::error::DbVaultError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Uniform jitter in `[ceiling / 2, ceiling]`.
fn jittered(ceiling: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.5..=1.0);
    ceiling.mul_f64(factor)
}

/// Runs `operation` until it succeeds, fails with a non-transient error or
/// the policy runs out of attempts.
///
/// Only errors for which [`DbVaultError::is_transient`] holds are retried.
/// The final transient error is returned with its attempt count updated.
/// Cancellation during a backoff sleep returns `Cancelled` immediately.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    table: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                let delay = jittered(policy.backoff_ceiling(attempt));
                tracing::warn!(
                    "Transient failure on table '{}' (attempt {}/{}), retrying in {:?}: {}",
                    table,
                    attempt,
                    policy.max_attempts,
                    delay,
                    error
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(DbVaultError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt = attempt.saturating_add(1);
            }
            Err(DbVaultError::ChunkIo { table, source, .. }) => {
                return Err(DbVaultError::ChunkIo {
                    table,
                    attempts: attempt,
                    source,
                });
            }
            Err(error) => return Err(error),
        }
    }
}
