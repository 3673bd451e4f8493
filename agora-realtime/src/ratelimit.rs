//! Client-side send throttling.
//!
//! A sliding window per user: a send is allowed if fewer than
//! `max_messages` sends were allowed in the last `window`. Uses the tokio
//! clock so paused-time tests can advance it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::protocol::UserId;

pub struct RateLimiter {
    window: Duration,
    max_messages: usize,
    buckets: Mutex<HashMap<UserId, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: config.window,
            max_messages: config.max_messages,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record a send for `user` if the window allows it.
    ///
    /// A refused call leaves the window untouched.
    pub fn can_send_message(&self, user: UserId) -> bool {
        self.can_send_message_at(user, Instant::now())
    }

    pub fn can_send_message_at(&self, user: UserId, now: Instant) -> bool {
        let mut buckets = self.buckets.lock();
        // Forget users whose window has emptied.
        buckets.retain(|_, sent| {
            self.expire(sent, now);
            !sent.is_empty()
        });
        let sent = buckets.entry(user).or_default();
        if sent.len() >= self.max_messages {
            return false;
        }
        sent.push_back(now);
        true
    }

    /// Time until `user` may send again; zero when under the cap.
    pub fn remaining_time(&self, user: UserId) -> Duration {
        self.remaining_time_at(user, Instant::now())
    }

    pub fn remaining_time_at(&self, user: UserId, now: Instant) -> Duration {
        let mut buckets = self.buckets.lock();
        let Some(sent) = buckets.get_mut(&user) else {
            return Duration::ZERO;
        };
        self.expire(sent, now);
        if sent.is_empty() {
            buckets.remove(&user);
            return Duration::ZERO;
        }
        if sent.len() < self.max_messages {
            return Duration::ZERO;
        }
        sent.front()
            .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    /// Forget everything recorded for `user`.
    pub fn reset(&self, user: UserId) {
        self.buckets.lock().remove(&user);
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.buckets.lock().len()
    }

    fn expire(&self, sent: &mut VecDeque<Instant>, now: Instant) {
        while sent
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            sent.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(max_messages: usize) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            window: Duration::from_secs(60),
            max_messages,
        })
    }

    #[test]
    fn remaining_time_counts_down_from_oldest() {
        let limiter = limiter(2);
        let start = Instant::now();
        assert!(limiter.can_send_message_at(1, start));
        assert!(limiter.can_send_message_at(1, start + Duration::from_secs(10)));
        assert!(!limiter.can_send_message_at(1, start + Duration::from_secs(20)));

        assert_eq!(
            limiter.remaining_time_at(1, start + Duration::from_secs(20)),
            Duration::from_secs(40)
        );
        // The oldest send has left the window.
        assert_eq!(limiter.remaining_time_at(1, start + Duration::from_secs(60)), Duration::ZERO);
        assert!(limiter.can_send_message_at(1, start + Duration::from_secs(60)));
    }

    #[test]
    fn users_are_independent() {
        let limiter = limiter(1);
        let now = Instant::now();
        assert!(limiter.can_send_message_at(1, now));
        assert!(!limiter.can_send_message_at(1, now));
        assert!(limiter.can_send_message_at(2, now));
        assert_eq!(limiter.remaining_time_at(3, now), Duration::ZERO);

        limiter.reset(1);
        assert!(limiter.can_send_message_at(1, now));
    }

    #[test]
    fn idle_users_are_forgotten() {
        let limiter = limiter(3);
        let start = Instant::now();
        for user in 1..=100 {
            assert!(limiter.can_send_message_at(user, start));
        }
        assert_eq!(limiter.tracked_users(), 100);

        let later = start + Duration::from_secs(61);
        assert!(limiter.can_send_message_at(500, later));
        assert_eq!(limiter.tracked_users(), 1);

        assert_eq!(limiter.remaining_time_at(500, later + Duration::from_secs(60)), Duration::ZERO);
        assert_eq!(limiter.tracked_users(), 0);
    }

    proptest! {
        #[test]
        fn allows_exactly_cap_within_window(cap in 1usize..40, extra in 1usize..20) {
            let limiter = limiter(cap);
            let start = Instant::now();
            let allowed = (0..cap + extra)
                .filter(|i| limiter.can_send_message_at(7, start + Duration::from_millis(*i as u64)))
                .count();
            prop_assert_eq!(allowed, cap);
            prop_assert!(limiter.can_send_message_at(7, start + Duration::from_secs(61)));
        }
    }
}
