use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window request counter keyed by client identity.
///
/// Buckets whose timestamps have all left the window are dropped at most once per
/// window, so the map tracks only clients seen recently.
#[derive(Debug, Clone)]
pub struct ApiRateLimiter {
    window: Duration,
    max_requests: u32,
    buckets: Arc<DashMap<String, Vec<Instant>>>,
    last_prune: Arc<Mutex<Instant>>,
}

impl ApiRateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            buckets: Arc::new(DashMap::new()),
            last_prune: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record a request for `key` on `route` if the window has room.
    /// Returns whether it was allowed and how many requests remain.
    pub fn allow(&self, key: &str, route: &str) -> (bool, u32) {
        let now = Instant::now();
        // Must run before the entry guard below is taken.
        self.prune_if_due(now);

        let bucket_key = format!("{key}:{route}");
        let window = self.window;

        // The entry guard holds the shard lock, so check-and-push is atomic per key.
        let mut entry = self.buckets.entry(bucket_key).or_default();
        entry.retain(|instant| now.duration_since(*instant) < window);

        let remaining = self.max_requests.saturating_sub(entry.len() as u32);
        if remaining == 0 {
            return (false, 0);
        }

        entry.push(now);
        // after push, one fewer slot remains
        (true, remaining.saturating_sub(1))
    }

    /// Drop every bucket with no request inside the window. Returns how many went.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.buckets.len();
        self.buckets.retain(|_, instants| {
            instants.retain(|instant| now.duration_since(*instant) < window);
            !instants.is_empty()
        });
        before.saturating_sub(self.buckets.len())
    }

    /// Number of client/route pairs currently tracked.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn prune_if_due(&self, now: Instant) {
        // A contended lock means another caller is already pruning.
        let Ok(mut last_prune) = self.last_prune.try_lock() else {
            return;
        };
        if now.duration_since(*last_prune) < self.window {
            return;
        }
        *last_prune = now;
        drop(last_prune);
        self.prune();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_limit_per_key() {
        let limiter = ApiRateLimiter::new(Duration::from_secs(60), 2);

        assert_eq!(limiter.allow("10.0.0.1", "/compile"), (true, 1));
        assert_eq!(limiter.allow("10.0.0.1", "/compile"), (true, 0));
        assert_eq!(limiter.allow("10.0.0.1", "/compile"), (false, 0));
        assert_eq!(limiter.allow("10.0.0.2", "/compile"), (true, 1));
    }

    #[test]
    fn window_expiry_frees_slots() {
        let limiter = ApiRateLimiter::new(Duration::from_millis(50), 1);

        assert!(limiter.allow("client", "/compile").0);
        assert!(!limiter.allow("client", "/compile").0);
        std::thread::sleep(Duration::from_millis(80));
        assert!(limiter.allow("client", "/compile").0);
    }

    #[test]
    fn concurrent_callers_never_exceed_limit() {
        let limiter = ApiRateLimiter::new(Duration::from_secs(60), 10);
        let allowed = std::sync::atomic::AtomicU32::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..5 {
                        if limiter.allow("same", "/compile").0 {
                            allowed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(allowed.into_inner(), 10);
    }

    #[test]
    fn idle_clients_are_forgotten_after_the_window() {
        let limiter = ApiRateLimiter::new(Duration::from_millis(500), 5);
        for client in 0..10_000 {
            limiter.allow(&format!("10.1.{}.{}", client / 256, client % 256), "/compile");
        }
        assert_eq!(limiter.tracked(), 10_000);

        std::thread::sleep(Duration::from_millis(600));
        assert!(limiter.allow("10.9.9.9", "/compile").0);

        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn prune_keeps_active_buckets() {
        let limiter = ApiRateLimiter::new(Duration::from_secs(60), 5);
        limiter.allow("active", "/compile");

        assert_eq!(limiter.prune(), 0);
        assert_eq!(limiter.tracked(), 1);
    }
}
