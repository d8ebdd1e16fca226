//! Bounded, timeout-guarded retries for outbound sends.

use std::{future::Future, time::Duration};

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::{
    errors::{DispatchError, Error},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            max_attempts: cfg.dispatch_max_attempts.max(1),
            backoff: cfg.dispatch_backoff,
            call_timeout: cfg.network_timeout,
        }
    }

    /// Wait before attempt `attempt + 1`: exponential backoff, or the
    /// server-specified wait when that is longer.
    pub(crate) fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self
            .backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        retry_after.map_or(exp, |ra| ra.max(exp))
    }
}

/// Run `op` until it succeeds, fails non-transiently, or attempts run out.
///
/// `pace` is awaited before every attempt and outside `call_timeout`: only
/// the send itself is time-bounded. `Migrated` is returned immediately, the
/// caller owns migration repair.
pub async fn send_with_retry<T, P, PFut, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut pace: P,
    mut op: F,
) -> Result<T>
where
    P: FnMut() -> PFut,
    PFut: Future<Output = ()>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        pace().await;
        let res = match timeout(policy.call_timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(Error::Dispatch(DispatchError::Transient {
                reason: format!("timed out after {:?}", policy.call_timeout),
                retry_after: None,
            })),
        };

        match res {
            Ok(v) => return Ok(v),
            Err(Error::Dispatch(DispatchError::Transient {
                reason,
                retry_after,
            })) if attempt < policy.max_attempts => {
                let wait = policy.delay(attempt, retry_after);
                warn!(%what, attempt, ?wait, %reason, "transient send failure, retrying");
                sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::domain::ChatId;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
            call_timeout: Duration::from_secs(1),
        }
    }

    fn transient() -> Error {
        Error::Dispatch(DispatchError::Transient {
            reason: "flood".to_string(),
            retry_after: Some(Duration::from_millis(2)),
        })
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = send_with_retry(policy(), "test", || async {}, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
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
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = send_with_retry(policy(), "test", || async {}, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(transient())
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn migrated_is_returned_without_retry() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = send_with_retry(policy(), "test", || async {}, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Dispatch(DispatchError::Migrated {
                new_chat: ChatId(1000999),
            }))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Dispatch(DispatchError::Migrated { new_chat: ChatId(1000999) })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_wait_is_not_counted_against_call_timeout() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out = send_with_retry(
            policy(),
            "test",
            || sleep(Duration::from_secs(5)),
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            },
        )
        .await
        .unwrap();
        assert_eq!(out, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn server_wait_wins_when_longer() {
        let p = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(p.delay(1, None), Duration::from_millis(100));
        assert_eq!(p.delay(2, None), Duration::from_millis(200));
        assert_eq!(
            p.delay(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
    }
}
