// Colony Memory — Per-caller Rate Limiter
// Sliding window: each caller keeps the instants of its accepted requests
// inside the window. A request is admitted while fewer than `max_requests`
// remain; otherwise the caller is told how long until the oldest expires.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    callers: RwLock<HashMap<String, VecDeque<Instant>>>,
    last_cleanup: RwLock<Instant>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        RateLimiter {
            max_requests: max_requests.max(1),
            window,
            callers: RwLock::new(HashMap::new()),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Admit and record one request, or return the retry-after delay.
    pub fn check(&self, caller_id: &str) -> Result<(), Duration> {
        self.maybe_cleanup();
        let now = Instant::now();
        let mut callers = self.callers.write();
        let hits = callers.entry(caller_id.to_string()).or_default();
        while hits.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            hits.pop_front();
        }
        if hits.len() >= self.max_requests as usize {
            let oldest = hits.front().copied().unwrap_or(now);
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return Err(retry_after.max(Duration::from_millis(1)));
        }
        hits.push_back(now);
        Ok(())
    }

    /// Requests left for a caller in the current window.
    pub fn remaining(&self, caller_id: &str) -> u32 {
        let now = Instant::now();
        let used = self
            .callers
            .read()
            .get(caller_id)
            .map(|hits| hits.iter().filter(|t| now.duration_since(**t) < self.window).count())
            .unwrap_or(0);
        self.max_requests.saturating_sub(used as u32)
    }

    pub fn tracked_callers(&self) -> usize {
        self.callers.read().len()
    }

    /// Drop callers with no requests in the window, at most once per window.
    fn maybe_cleanup(&self) {
        {
            let last = self.last_cleanup.read();
            if last.elapsed() < self.window {
                return;
            }
        }
        *self.last_cleanup.write() = Instant::now();
        let now = Instant::now();
        self.callers
            .write()
            .retain(|_, hits| hits.back().is_some_and(|t| now.duration_since(*t) < self.window));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_threshold() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(limiter.check("a").is_ok());
        }
        let retry = limiter.check("a").unwrap_err();
        assert!(retry > Duration::from_secs(50));
        assert_eq!(limiter.remaining("a"), 0);
    }

    #[test]
    fn callers_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        assert!(limiter.check("b").is_ok());
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        std::thread::sleep(Duration::from_millis(70));
        assert!(limiter.check("a").is_ok());
    }

    #[test]
    fn rejected_requests_do_not_consume_quota() {
        let limiter = RateLimiter::new(1, Duration::from_millis(50));
        assert!(limiter.check("a").is_ok());
        for _ in 0..10 {
            assert!(limiter.check("a").is_err());
        }
        std::thread::sleep(Duration::from_millis(70));
        assert!(limiter.check("a").is_ok());
    }

    #[test]
    fn idle_callers_are_cleaned_up() {
        let limiter = RateLimiter::new(5, Duration::from_millis(20));
        limiter.check("a").unwrap();
        limiter.check("b").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        limiter.check("c").unwrap();
        assert_eq!(limiter.tracked_callers(), 1);
    }
}
