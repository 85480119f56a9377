//! Cancellation-aware retry of a fallible async step.

use crate::services::error::RenameResult;
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is exhausted.
///
/// `check` runs before every attempt; if it fails the attempt is not made and
/// its error is returned as is. A canceled error from `op` is never retried.
/// The pause between attempts ends early once `canceled` fires.
pub async fn retry<T, C, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    canceled: &CancellationToken,
    check: C,
    mut op: F,
) -> RenameResult<T>
where
    C: Fn() -> RenameResult<()>,
    F: FnMut() -> Fut,
    Fut: Future<Output = RenameResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        check()?;
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_canceled() || attempt >= max_attempts => return Err(err),
            Err(err) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    label, attempt, max_attempts, err
                );
                tokio::select! {
                    _ = canceled.cancelled() => {}
                    _ = tokio::time::sleep(policy.delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::error::{RenameError, StoreError};
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    };

    fn transient() -> RenameError {
        RenameError::Store(StoreError::Request("503".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let value = retry(&RetryPolicy::default(), "step", &CancellationToken::new(), || Ok(()), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err(transient()) } else { Ok(n) } }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 2,
            delay: Duration::from_secs(1),
        };
        let err = retry(&policy, "step", &CancellationToken::new(), || Ok(()), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(transient()) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RenameError::Store(StoreError::Request(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_check_stops_further_attempts() {
        let canceled = AtomicBool::new(false);
        let reason: Arc<str> = Arc::from("timeout");
        let attempts = AtomicU32::new(0);

        let err = retry(
            &RetryPolicy::default(),
            "step",
            &CancellationToken::new(),
            || {
                if canceled.load(Ordering::SeqCst) {
                    Err(RenameError::Canceled(reason.clone()))
                } else {
                    Ok(())
                }
            },
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                canceled.store(true, Ordering::SeqCst);
                async { Err::<(), _>(transient()) }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        match err {
            RenameError::Canceled(got) => assert!(Arc::ptr_eq(&got, &reason)),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn canceled_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let err = retry(&RetryPolicy::default(), "step", &CancellationToken::new(), || Ok(()), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RenameError::Canceled(Arc::from("stop"))) }
        })
        .await
        .unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cuts_the_pause_short() {
        let token = CancellationToken::new();
        let reason: Arc<str> = Arc::from("timeout");
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_secs(60),
        };
        let started = tokio::time::Instant::now();

        let err = retry(
            &policy,
            "step",
            &token,
            || {
                if token.is_cancelled() {
                    Err(RenameError::Canceled(reason.clone()))
                } else {
                    Ok(())
                }
            },
            || {
                token.cancel();
                async { Err::<(), _>(transient()) }
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_canceled());
        assert!(started.elapsed() < policy.delay);
    }
}
