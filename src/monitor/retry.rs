use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use super::{MonitorContext, MonitorError, MonitorSettings};

/// Exponential backoff before retry number `retry` (0-based), capped at
/// `backoff_max`, without jitter.
pub(crate) fn compute_backoff(settings: &MonitorSettings, retry: u32) -> Duration {
    let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
    settings
        .backoff_base
        .checked_mul(factor)
        .unwrap_or(settings.backoff_max)
        .min(settings.backoff_max)
}

/// Backoff plus up to half a base interval of random jitter.
fn jittered(settings: &MonitorSettings, retry: u32) -> Duration {
    let jitter_max = (settings.backoff_base.as_millis() / 2) as u64;
    let jitter = if jitter_max == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_max)
    };
    compute_backoff(settings, retry) + Duration::from_millis(jitter)
}

/// Runs `op` up to `retry_count` times while it fails with a retryable error.
///
/// The run deadline is checked before every attempt. A backoff that would
/// end past the deadline is not slept; the last real error is returned.
pub(crate) async fn with_retry<T, F, Fut>(
    ctx: &MonitorContext,
    blog: &str,
    mut op: F,
) -> Result<T, MonitorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MonitorError>>,
{
    let attempts = ctx.settings.retry_count.max(1);
    let mut attempt = 0;

    loop {
        ctx.check_deadline()?;
        attempt += 1;

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !err.is_retryable() || attempt >= attempts {
            return Err(err);
        }

        let mut delay = jittered(&ctx.settings, attempt - 1);
        if let MonitorError::RateLimited(Some(retry_after)) = &err {
            delay = delay.max((*retry_after).min(ctx.settings.backoff_max));
        }
        if ctx.deadline.is_some_and(|d| Instant::now() + delay >= d) {
            return Err(err);
        }

        tracing::warn!(
            blog = %blog,
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::stub::StubFetcher;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn ctx(retry_count: u32) -> MonitorContext {
        let settings = MonitorSettings {
            retry_count,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(350),
            run_deadline: None,
            ..MonitorSettings::default()
        };
        MonitorContext::new(Arc::new(StubFetcher::new()), settings)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let settings = ctx(3).settings;
        assert_eq!(compute_backoff(&settings, 0), Duration::from_millis(100));
        assert_eq!(compute_backoff(&settings, 1), Duration::from_millis(200));
        assert_eq!(compute_backoff(&settings, 2), Duration::from_millis(350));
        assert_eq!(compute_backoff(&settings, 40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_half_base() {
        let settings = ctx(3).settings;
        for _ in 0..50 {
            let d = jittered(&settings, 0);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_up_to_limit() {
        let ctx = ctx(3);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&ctx, "b", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MonitorError::HttpStatus(503)) }
        })
        .await;
        assert_eq!(result, Err(MonitorError::HttpStatus(503)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_error() {
        let ctx = ctx(3);
        let calls = AtomicU32::new(0);
        let result = with_retry(&ctx, "b", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(MonitorError::Network("reset".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let ctx = ctx(5);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&ctx, "b", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MonitorError::HttpStatus(404)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_past_deadline_makes_no_attempt() {
        let ctx = ctx(3).with_deadline(Some(Instant::now()));
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&ctx, "b", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert_eq!(result, Err(MonitorError::Deadline));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
