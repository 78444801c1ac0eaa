//! Per-attempt timeout + retry for remote calls.

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use wafsync_adapters::RemoteError;
use wafsync_storage::{retry_with_backoff, BackoffPolicy};

use crate::context::CancelSignal;

#[derive(Debug, Clone, Copy)]
pub struct AttemptPolicy {
    pub backoff: BackoffPolicy,
    pub timeout: Duration,
}

/// Call `op` until it succeeds or fails permanently. An attempt exceeding
/// `policy.timeout` counts as a transient failure. No retry is scheduled
/// once `cancel` is raised.
pub async fn call_remote<T, F, Fut>(
    policy: AttemptPolicy,
    cancel: &CancelSignal,
    key: &str,
    mut op: F,
) -> (Result<T, RemoteError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let (result, attempts) = retry_with_backoff(
        &policy.backoff,
        |err: &RemoteError| err.is_retryable() && !cancel.is_cancelled(),
        |_| {
            let fut = op();
            async move {
                match tokio::time::timeout(policy.timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::transient(
                        key,
                        format!("attempt timed out after {}s", policy.timeout.as_secs_f32()),
                    )),
                }
            }
        },
    )
    .await;
    if let Err(err) = &result {
        if err.is_retryable() {
            warn!(key, attempts, error = %err, "giving up after retries");
        }
    }
    (result, attempts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(max_attempts: u32, timeout: Duration) -> AttemptPolicy {
        AttemptPolicy {
            backoff: BackoffPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            timeout,
        }
    }

    #[tokio::test]
    async fn slow_attempts_become_transient_failures() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = call_remote(
            quick(2, Duration::from_millis(5)),
            &CancelSignal::new(),
            "https://waf.test/slow/",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, RemoteError>(())
                }
            },
        )
        .await;
        assert_eq!(attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(result, Err(RemoteError::Transient { .. })));
    }

    #[tokio::test]
    async fn cancelled_runs_do_not_retry() {
        let cancel = CancelSignal::new();
        cancel.cancel();
        let (result, attempts) = call_remote(
            quick(5, Duration::from_secs(1)),
            &cancel,
            "https://waf.test/a.xml",
            || async { Err::<(), _>(RemoteError::transient("https://waf.test/a.xml", "reset")) },
        )
        .await;
        assert_eq!(attempts, 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn not_found_is_returned_without_retry() {
        let (result, attempts) = call_remote(
            quick(5, Duration::from_secs(1)),
            &CancelSignal::new(),
            "https://waf.test/a.xml",
            || async {
                Err::<(), _>(RemoteError::NotFound {
                    url: "https://waf.test/a.xml".into(),
                })
            },
        )
        .await;
        assert_eq!(attempts, 1);
        assert!(matches!(result, Err(RemoteError::NotFound { .. })));
    }
}
