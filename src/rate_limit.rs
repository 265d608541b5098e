// tee-signer: Per-client rate limiting

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;

/// Identity used when a client presents no usable CN.
pub const UNKNOWN_CLIENT: &str = "unknown";

struct TokenBucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Token-bucket rate limiter keyed by mTLS client CN.
///
/// Buckets are created lazily on first sight of a CN and retained for the
/// process lifetime; the map is bounded by the number of distinct client
/// identities the CA has issued. The registry map and the individual
/// buckets are locked separately so one client's refill never serializes
/// another client's admission check.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            rate,
            burst: f64::from(burst.max(1)),
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one request for `client_cn`, consuming a token.
    ///
    /// Returns false when the bucket is empty. An empty CN shares the
    /// `"unknown"` bucket.
    pub fn allow(&self, client_cn: &str) -> bool {
        let key = if client_cn.is_empty() {
            UNKNOWN_CLIENT
        } else {
            client_cn
        };

        let bucket = {
            let mut buckets = self.buckets.lock();
            Arc::clone(buckets.entry(key.to_string()).or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket {
                    tokens: self.burst,
                    last_refill: self.clock.now(),
                }))
            }))
        };

        let now = self.clock.now();
        let mut bucket = bucket.lock();

        // clamp time going backwards to zero elapsed
        let elapsed_ms = (now - bucket.last_refill).num_milliseconds().max(0);
        let refill = (elapsed_ms as f64 / 1000.0) * self.rate;
        bucket.tokens = (bucket.tokens + refill).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Number of distinct client buckets currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().len()
    }
}
