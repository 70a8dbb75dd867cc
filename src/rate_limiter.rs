use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MAX_TRACKED_TIMESTAMPS_PER_USER: usize = 100;

/// Per-user sliding-window message counter. Timestamps older than `max_age` are
/// dropped on every access; a coarse mutex over the whole map is sufficient at
/// the expected throughput (a few hundred events/s).
pub struct RateLimiter {
    max_age: Duration,
    user_timestamps: Mutex<HashMap<String, VecDeque<Instant>>>,
}

#[derive(Debug, Serialize)]
pub struct RateLimiterStats {
    pub tracked_users: usize,
    pub total_timestamps: usize,
    pub max_age_secs: u64,
}

impl RateLimiter {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            user_timestamps: Mutex::new(HashMap::new()),
        }
    }

    fn cleanup_locked(map: &mut HashMap<String, VecDeque<Instant>>, max_age: Duration, now: Instant) {
        map.retain(|_, timestamps| {
            while let Some(front) = timestamps.front() {
                if now.duration_since(*front) > max_age {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }
            !timestamps.is_empty()
        });
    }

    /// Records a message timestamp for the user. Not itself a spam check.
    pub fn add(&self, user: &str) {
        let now = Instant::now();
        let user_lower = user.to_lowercase();
        let mut map = self.user_timestamps.lock().unwrap();
        Self::cleanup_locked(&mut map, self.max_age, now);

        let deque = map.entry(user_lower).or_default();
        if deque.len() >= MAX_TRACKED_TIMESTAMPS_PER_USER {
            deque.pop_front();
        }
        deque.push_back(now);
    }

    /// True when the user has sent `max_messages` or more within `window` seconds.
    pub fn is_spam(&self, user: &str, max_messages: usize, window: Duration) -> bool {
        let now = Instant::now();
        let user_lower = user.to_lowercase();
        let mut map = self.user_timestamps.lock().unwrap();
        Self::cleanup_locked(&mut map, self.max_age, now);

        let Some(timestamps) = map.get(&user_lower) else {
            return false;
        };

        let recent_count = timestamps
            .iter()
            .filter(|ts| now.duration_since(**ts) <= window)
            .count();
        recent_count >= max_messages
    }

    pub fn stats(&self) -> RateLimiterStats {
        let map = self.user_timestamps.lock().unwrap();
        RateLimiterStats {
            tracked_users: map.len(),
            total_timestamps: map.values().map(|v| v.len()).sum(),
            max_age_secs: self.max_age.as_secs(),
        }
    }

    #[cfg(test)]
    pub fn clear(&self) {
        self.user_timestamps.lock().unwrap().clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_spam_below_threshold() {
        let limiter = RateLimiter::default();
        for _ in 0..4 {
            limiter.add("alice");
        }
        assert!(!limiter.is_spam("alice", 5, Duration::from_secs(10)));
    }

    #[test]
    fn spam_at_threshold() {
        let limiter = RateLimiter::default();
        for _ in 0..5 {
            limiter.add("bob");
        }
        assert!(limiter.is_spam("bob", 5, Duration::from_secs(10)));
    }

    #[test]
    fn username_is_case_insensitive() {
        let limiter = RateLimiter::default();
        for _ in 0..5 {
            limiter.add("Carol");
        }
        assert!(limiter.is_spam("carol", 5, Duration::from_secs(10)));
    }

    #[test]
    fn unseen_user_is_never_spam() {
        let limiter = RateLimiter::default();
        assert!(!limiter.is_spam("nobody", 1, Duration::from_secs(10)));
    }

    #[test]
    fn stats_report_tracked_users() {
        let limiter = RateLimiter::default();
        limiter.add("dave");
        limiter.add("erin");
        let stats = limiter.stats();
        assert_eq!(stats.tracked_users, 2);
        assert_eq!(stats.total_timestamps, 2);
    }
}
