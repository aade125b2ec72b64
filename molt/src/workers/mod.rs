//! The migration's cooperating workers: row copy, event apply, throttler
//! and watchdog, plus the shared handle and retry machinery.

pub mod base;
pub mod event_apply;
pub mod row_copy;
pub mod throttler;
pub mod watchdog;

pub use base::WorkerHandle;

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{MoltError, MoltResult};

const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Spawns a worker whose failure is fatal to the whole migration: an error
/// result is published to the abort channel before the task exits. The
/// first published error wins; the coordinator tears everything down on
/// receipt.
pub fn spawn_supervised<F>(
    name: &'static str,
    context: std::sync::Arc<crate::context::MigrationContext>,
    future: F,
) -> base::WorkerHandle
where
    F: std::future::Future<Output = MoltResult<()>> + Send + 'static,
{
    base::WorkerHandle::spawn(name, async move {
        match future.await {
            Ok(()) => Ok(()),
            Err(err) => {
                let message = err.to_string();
                context.panic_abort(err);
                Err(MoltError::other(format!("{name}: {message}")))
            }
        }
    })
}

/// Retries a transient-failure-prone operation with jittered exponential
/// backoff, up to `retries` additional attempts. Non-retryable errors
/// propagate immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    retries: u32,
    operation: &str,
    mut f: F,
) -> MoltResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = MoltResult<T>>,
{
    let mut backoff = INITIAL_RETRY_BACKOFF;
    let mut attempt: u32 = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < retries => {
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "transient failure, retrying"
                );
                tokio::time::sleep(jittered(backoff)).await;
                backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
            }
            Err(err) if err.is_retryable() => {
                return Err(MoltError::with_source(
                    crate::error::ErrorKind::RetriesExceeded {
                        operation: operation.to_string(),
                        attempts: attempt + 1,
                    },
                    err,
                ));
            }
            Err(err) => return Err(err),
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let mut rng = rand::rng();
    base.mul_f64(rng.random_range(0.8..1.2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(5, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(MoltError::new(ErrorKind::ConnectionLost))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: MoltResult<()> = retry_with_backoff(5, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(MoltError::new(ErrorKind::UserPanic))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_retries_exceeded() {
        let result: MoltResult<()> = retry_with_backoff(1, "test", || async {
            Err(MoltError::new(ErrorKind::ConnectionLost))
        })
        .await;
        let err = result.unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::RetriesExceeded { attempts: 2, .. }
        ));
    }
}
