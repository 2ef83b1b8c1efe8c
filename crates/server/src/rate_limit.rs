use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Sliding-window counter per source key, shared by the login and
/// Wake-on-LAN rate limiters (§4.5). Bounded to prevent memory exhaustion
/// from enumeration attacks; performs TTL cleanup every `ttl_cleanup_interval`
/// calls to `check()`.
pub struct RateLimiter {
    attempts: Mutex<HashMap<String, Vec<Instant>>>,
    max_attempts: usize,
    window: Duration,
    max_keys: usize,
    call_count: AtomicU64,
    ttl_cleanup_interval: u64,
}

impl RateLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            max_attempts,
            window,
            max_keys: 10_000,
            call_count: AtomicU64::new(0),
            ttl_cleanup_interval: 100,
        }
    }

    /// Check whether an attempt from `key` is allowed. Returns `true` if
    /// allowed (and records the attempt), `false` if the window is exhausted.
    pub fn check(&self, key: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let count = self.call_count.fetch_add(1, Ordering::Relaxed);
        if count.is_multiple_of(self.ttl_cleanup_interval) || attempts.len() > self.max_keys / 2 {
            attempts.retain(|_, timestamps| {
                timestamps.retain(|t| now.duration_since(*t) < self.window);
                !timestamps.is_empty()
            });
        }

        if attempts.len() >= self.max_keys && !attempts.contains_key(key) {
            return false;
        }

        let entry = attempts.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max_attempts {
            return false;
        }

        entry.push(now);
        true
    }

    /// Clear recorded attempts for a key (e.g. after a successful login).
    pub fn clear(&self, key: &str) {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.remove(key);
    }

    /// Seconds until the oldest attempt for `key` falls out of the window.
    pub fn retry_after_secs(&self, key: &str) -> u64 {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let Some(timestamps) = attempts.get(key) else {
            return 0;
        };
        let Some(oldest) = timestamps.iter().min() else {
            return 0;
        };
        self.window
            .saturating_sub(oldest.elapsed())
            .as_secs()
            .max(1)
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_attempts() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(limiter.check("1.2.3.4"));
        assert!(!limiter.check("1.2.3.4"));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(limiter.check("b"));
        assert!(!limiter.check("a"));
    }

    #[test]
    fn clear_resets_a_key() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        limiter.clear("a");
        assert!(limiter.check("a"));
    }

    #[test]
    fn window_expiry_allows_retry() {
        let limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check("a"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check("a"));
    }

    #[test]
    fn retry_after_is_positive_once_limited() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.check("a");
        limiter.check("a");
        assert!(limiter.retry_after_secs("a") > 0);
    }

    #[test]
    fn ttl_cleanup_prunes_stale_keys() {
        let limiter = RateLimiter::new(5, Duration::from_millis(5));
        for i in 0..150 {
            limiter.check(&format!("key-{i}"));
        }
        std::thread::sleep(Duration::from_millis(20));
        // Trigger cleanup via the periodic-call path.
        for i in 150..260 {
            limiter.check(&format!("key-{i}"));
        }
        assert!(limiter.key_count() < 260);
    }
}
