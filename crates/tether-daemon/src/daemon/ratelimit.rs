//! Per-requester relay rate limiting — a sliding window per key.
//!
//! Keys are requester identities: the literal `"local"` for control-
//! socket clients, the remote address for peer TCP links. 30 relays per
//! rolling 60 s window; exceeding fails the relay but never the
//! connection.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const RELAY_LIMIT: usize = 30;
pub const RELAY_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or reject one relay for `key` at time `now`.
    pub fn check_at(&mut self, key: &str, now: Instant) -> bool {
        let bucket = self.buckets.entry(key.to_owned()).or_default();
        while let Some(&front) = bucket.front() {
            if now.duration_since(front) >= RELAY_WINDOW {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() >= RELAY_LIMIT {
            return false;
        }
        bucket.push_back(now);
        true
    }

    pub fn check(&mut self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }
}
