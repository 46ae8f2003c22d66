//! Per-client request rate limiting for the IPC surface

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::ClientId;

/// Token-bucket rate limiter keyed by client
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_interval: Duration,
    buckets: HashMap<ClientId, Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

impl RateLimiter {
    /// Allow up to `max_requests` per `interval` for each client.
    pub fn new(max_requests: u32, interval: Duration) -> Self {
        Self {
            capacity: max_requests,
            refill_interval: interval,
            buckets: HashMap::new(),
        }
    }

    /// Returns `true` if the request is allowed, consuming a token.
    pub fn check(&mut self, client_id: &ClientId) -> bool {
        self.check_at(client_id, Instant::now())
    }

    fn check_at(&mut self, client_id: &ClientId, now: Instant) -> bool {
        let capacity = self.capacity;
        let bucket = self.buckets.entry(client_id.clone()).or_insert(Bucket {
            tokens: capacity,
            last_refill: now,
        });

        if now.duration_since(bucket.last_refill) >= self.refill_interval {
            bucket.tokens = capacity;
            bucket.last_refill = now;
        }

        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    pub fn remove_client(&mut self, client_id: &ClientId) {
        self.buckets.remove(client_id);
    }

    /// Drop buckets that have not been touched for `stale_after`.
    pub fn cleanup(&mut self, stale_after: Duration) {
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < stale_after);
    }
}
