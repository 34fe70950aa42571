use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;

/// Retry an async operation until it succeeds or the token is cancelled.
///
/// Used for ownership re-acquisition after marker loss: giving up would
/// leave a bucket permanently unowned, so attempts are unbounded. Each
/// failure is reported through `on_err` and followed by a jittered
/// exponential backoff capped at the policy's max delay.
pub async fn with_indefinite_retries<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
    mut on_err: impl FnMut(&E),
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = policy.initial_delay;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match op().await {
            Ok(value) => return Some(value),
            Err(e) => on_err(&e),
        }

        let jittered = jitter(delay);
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(jittered) => {}
        }
        delay = (delay * policy.multiplier).min(policy.max_delay);
    }
}

/// Randomize a delay to between 50% and 100% of its nominal value, so
/// retries from different processes spread out.
pub(crate) fn jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let millis = delay.as_millis().max(1) as u64;
    let low = (millis / 2).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(low..=millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let errors = AtomicU32::new(0);
        let attempts_ref = &attempts;
        let result = with_indefinite_retries(
            &fast_policy(),
            &CancellationToken::new(),
            || async move {
                if attempts_ref.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("not yet")
                } else {
                    Ok(42u32)
                }
            },
            |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert_eq!(result, Some(42));
        assert_eq!(errors.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Option<u32> = with_indefinite_retries(
            &fast_policy(),
            &cancel,
            || async { Err::<u32, _>("always") },
            |_| {},
        )
        .await;
        assert_eq!(result, None);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let d = jitter(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(100));
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}
