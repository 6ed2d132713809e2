use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::time::{Duration, Instant};

// Sliding window limiter - at most `max_requests` admitted per trailing `window`, per key
pub struct SlidingWindowLimiter<K: Eq + Hash> {
    requests: DashMap<K, VecDeque<Instant>>, // key -> admitted timestamps, oldest first
    max_requests: usize,
    window: Duration,
}

impl<K: Eq + Hash + Clone> SlidingWindowLimiter<K> {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            requests: DashMap::new(),
            max_requests,
            window,
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn allow_now(&self, key: &K) -> bool {
        self.allow(key, Instant::now())
    }

    // Admits `now` for `key` if fewer than `max_requests` timestamps remain
    // in the window. A rejected attempt is not recorded.
    pub fn allow(&self, key: &K, now: Instant) -> bool {
        // entry() holds the shard write lock until `stamps` is dropped,
        // so purge + count + push is atomic per key
        let mut stamps = self.requests.entry(key.clone()).or_default();
        purge(&mut stamps, now, self.window);

        if stamps.len() < self.max_requests {
            stamps.push_back(now);
            return true;
        }
        false
    }

    // Gives back a slot admitted at `at`. Used when a later gate rejects the
    // request that took it.
    pub fn refund(&self, key: &K, at: Instant) -> bool {
        match self.requests.get_mut(key) {
            Some(mut stamps) => match stamps.iter().rposition(|&t| t == at) {
                Some(idx) => {
                    stamps.remove(idx);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    // Number of admitted requests still inside the window for `key`.
    pub fn in_window(&self, key: &K, now: Instant) -> usize {
        self.requests
            .get(key)
            .map(|stamps| stamps.iter().filter(|&&t| is_live(t, now, self.window)).count())
            .unwrap_or(0)
    }

    pub fn tracked_keys(&self) -> usize {
        self.requests.len()
    }

    // Drop keys with no activity for `idle_windows` whole windows
    pub fn evict_idle(&self, now: Instant, idle_windows: u32) -> usize {
        let idle = self.window.saturating_mul(idle_windows);
        let before = self.requests.len();
        self.requests.retain(|_, stamps| match stamps.back() {
            Some(&newest) => now.saturating_duration_since(newest) < idle,
            None => false,
        });
        before - self.requests.len()
    }
}

fn is_live(stamp: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(stamp) < window
}

fn purge(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = stamps.front() {
        if is_live(oldest, now, window) {
            break;
        }
        stamps.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn admits_up_to_max_then_rejects() {
        let limiter = SlidingWindowLimiter::new(5, HOUR);
        let start = Instant::now();

        for i in 0..5 {
            assert!(limiter.allow(&-100_i64, start + Duration::from_secs(i)));
        }
        assert!(!limiter.allow(&-100_i64, start + Duration::from_secs(10)));
    }

    #[test]
    fn window_slides_past_oldest_timestamp() {
        let limiter = SlidingWindowLimiter::new(2, HOUR);
        let start = Instant::now();

        assert!(limiter.allow(&1_i64, start));
        assert!(limiter.allow(&1_i64, start + Duration::from_secs(600)));
        assert!(!limiter.allow(&1_i64, start + Duration::from_secs(1200)));

        // first stamp ages out, second one is still live
        let later = start + HOUR + Duration::from_secs(1);
        assert!(limiter.allow(&1_i64, later));
        assert!(!limiter.allow(&1_i64, later));
        assert_eq!(limiter.in_window(&1_i64, later), 2);
    }

    #[test]
    fn rejected_attempts_are_not_recorded() {
        let limiter = SlidingWindowLimiter::new(1, HOUR);
        let start = Instant::now();

        assert!(limiter.allow(&7_i64, start));
        for i in 1..20 {
            assert!(!limiter.allow(&7_i64, start + Duration::from_secs(i)));
        }
        assert_eq!(limiter.in_window(&7_i64, start + Duration::from_secs(20)), 1);

        // only the single admitted stamp has to age out
        assert!(limiter.allow(&7_i64, start + HOUR));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, HOUR);
        let now = Instant::now();

        assert!(limiter.allow(&1_i64, now));
        assert!(limiter.allow(&2_i64, now));
        assert!(!limiter.allow(&1_i64, now));
        assert!(!limiter.allow(&2_i64, now));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn refund_frees_the_slot() {
        let limiter = SlidingWindowLimiter::new(1, HOUR);
        let now = Instant::now();

        assert!(limiter.allow(&3_i64, now));
        assert!(limiter.refund(&3_i64, now));
        assert!(!limiter.refund(&3_i64, now));
        assert!(limiter.allow(&3_i64, now + Duration::from_secs(1)));
    }

    #[test]
    fn evicts_idle_keys_only() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();

        limiter.allow(&1_i64, start);
        limiter.allow(&2_i64, start + Duration::from_secs(290));

        let evicted = limiter.evict_idle(start + Duration::from_secs(300), 3);
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.in_window(&2_i64, start + Duration::from_secs(300)), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_max() {
        let limiter = Arc::new(SlidingWindowLimiter::new(5, HOUR));
        let now = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.allow(&-42_i64, now) }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 5);
    }
}
