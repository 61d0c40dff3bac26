use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use url::Url;

/// Enforces a minimum spacing between requests to the same host.
///
/// Shared by every worker of a run. Each caller reserves the next free slot
/// for its host under the lock, then sleeps outside it, so waiting on one
/// host never blocks requests to another.
pub struct HostLimiter {
    min_interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl HostLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// A limiter that never delays.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until a request to `url`'s host is allowed.
    pub async fn wait(&self, url: &Url) {
        if self.min_interval.is_zero() {
            return;
        }
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

        let slot = {
            let mut slots = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = slots
                .get(&host)
                .copied()
                .filter(|at| *at > now)
                .unwrap_or(now);
            slots.insert(host.clone(), slot + self.min_interval);
            slot
        };

        if slot > Instant::now() {
            tracing::trace!(host = %host, "Waiting for host slot");
            tokio::time::sleep_until(slot).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_host_requests_are_spaced() {
        let limiter = HostLimiter::new(Duration::from_secs(1));
        let start = Instant::now();

        limiter.wait(&url("https://example.com/a")).await;
        limiter.wait(&url("https://example.com/b")).await;
        limiter.wait(&url("https://EXAMPLE.com/c")).await;

        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_hosts_do_not_wait() {
        let limiter = HostLimiter::new(Duration::from_secs(5));
        let start = Instant::now();

        limiter.wait(&url("https://one.example/")).await;
        limiter.wait(&url("https://two.example/")).await;

        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_get_distinct_slots() {
        let limiter = std::sync::Arc::new(HostLimiter::new(Duration::from_millis(500)));
        let start = Instant::now();

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let limiter = limiter.clone();
                tokio::spawn(async move {
                    limiter.wait(&url(&format!("https://example.com/{i}"))).await;
                    Instant::now()
                })
            })
            .collect();

        let mut finished = Vec::new();
        for task in tasks {
            finished.push(task.await.unwrap());
        }
        finished.sort();
        assert!(finished[3] - start >= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_unlimited_returns_immediately() {
        let limiter = HostLimiter::unlimited();
        limiter.wait(&url("https://example.com/")).await;
        assert!(limiter.min_interval().is_zero());
    }
}
