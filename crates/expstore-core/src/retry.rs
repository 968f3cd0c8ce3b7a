use crate::backend::BackendResult;
use crate::errors::{BackendError, ExpStoreError, Result};
use std::future::Future;
use tokio::time::{sleep, timeout, Duration};

/// Bounds for one remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one, for transient errors only.
    pub max_retries: u32,
    /// Deadline for each attempt.
    pub max_operation_time: Duration,
    /// Linear backoff step between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_operation_time: Duration::from_secs(120),
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }
}

/// Runs `f` until it succeeds, fails permanently, or runs out of retries.
/// The final error names the operation and partition.
pub async fn with_retries<T, F, Fut>(
    op: &str,
    partition: &str,
    policy: RetryPolicy,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let res = match timeout(policy.max_operation_time, f()).await {
            Ok(r) => r,
            Err(_) => Err(BackendError::Timeout(op.to_string())),
        };
        match res {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt <= policy.max_retries => {
                tracing::warn!(
                    event = "expstore.retry",
                    op = %op,
                    partition = %partition,
                    attempt,
                    error = %e,
                    "transient backend error, retrying"
                );
                sleep(policy.backoff * attempt).await;
            }
            Err(e) => return Err(ExpStoreError::backend(op, partition, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            max_operation_time: Duration::from_millis(200),
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = with_retries("op", "master", fast(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(BackendError::Unavailable("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = with_retries("commit", "gerrit_1", fast(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(BackendError::Unavailable("down".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            ExpStoreError::Backend { op, partition, .. } => {
                assert_eq!(op, "commit");
                assert_eq!(partition, "gerrit_1");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res = with_retries("op", "master", fast(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(BackendError::StreamClosed)
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let policy = RetryPolicy {
            max_retries: 0,
            max_operation_time: Duration::from_millis(10),
            backoff: Duration::from_millis(1),
        };
        let err = with_retries("slow", "master", policy, || async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
