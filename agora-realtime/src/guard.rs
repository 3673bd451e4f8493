//! The send path's local gate: validation, then rate limiting.

use crate::config::RealtimeConfig;
use crate::error::SendRejection;
use crate::protocol::UserId;
use crate::ratelimit::RateLimiter;
use crate::validation::validate_message_content;

pub struct OutboundGuard {
    limiter: RateLimiter,
    max_message_length: usize,
}

impl OutboundGuard {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self {
            limiter: RateLimiter::new(&config.rate_limit),
            max_message_length: config.max_message_length,
        }
    }

    /// Returns the content to send, or why it must not be sent.
    ///
    /// Invalid content does not use up the sender's rate budget.
    pub fn check(&self, user: UserId, content: &str) -> Result<String, SendRejection> {
        let content = validate_message_content(content, self.max_message_length)?;
        if !self.limiter.can_send_message(user) {
            let retry_after = self.limiter.remaining_time(user);
            tracing::debug!(user, retry_after_ms = retry_after.as_millis() as u64, "send rate limited");
            return Err(SendRejection::RateLimited { retry_after });
        }
        Ok(content)
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}
