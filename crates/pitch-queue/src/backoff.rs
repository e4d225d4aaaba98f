//! Fixed-backoff retry for channel and store operations.
//!
//! Infra connectivity loss is never fatal: the caller retries forever at a
//! fixed interval, logging each failure.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry `op` until it succeeds, sleeping `interval` between attempts.
///
/// `what` names the operation for the failure log line.
pub async fn retry_with_backoff<T, E, F, Fut>(interval: Duration, what: &str, mut op: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u64 = 0;
    loop {
        match op().await {
            Ok(value) => return value,
            Err(e) => {
                attempt += 1;
                warn!(%what, attempt, error = %e, "operation failed, retrying after backoff");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(Duration::from_millis(1), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn immediate_success_does_not_sleep() {
        let result =
            retry_with_backoff(Duration::from_secs(3600), "test", || async { Ok::<_, String>(7) })
                .await;
        assert_eq!(result, 7);
    }
}
