//! Per-client token-bucket rate limiting
//!
//! Each client accumulates tokens up to a burst ceiling at a configured
//! refill rate; an admission spends tokens. Refill is computed lazily from
//! elapsed time on every check, with no background timer. Buckets idle
//! longer than the cleanup interval are swept inline on the next `admit`
//! from any client, which bounds memory without a dedicated task.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::SharedClock;

/// Limiter configuration
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Burst ceiling (maximum token balance)
    pub capacity: f64,
    /// Tokens restored per second
    pub refill_rate: f64,
    /// Buckets idle longer than this are swept
    pub cleanup_interval: Duration,
}

impl RateLimitConfig {
    /// Build a config from a requests-per-minute budget and burst size
    pub fn per_minute(requests_per_minute: f64, burst: f64) -> Self {
        Self {
            capacity: burst,
            refill_rate: requests_per_minute / 60.0,
            cleanup_interval: Duration::from_secs(300),
        }
    }

    /// Override the idle-bucket sweep interval
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// One client's token balance
struct TokenBucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// Request admitted; tokens were spent
    Allowed,
    /// Request denied; retry once enough tokens have accrued
    Denied { retry_after: Duration },
}

impl Admission {
    /// Whether the request was admitted
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    /// Caller-facing retry hint, rounded up to whole seconds
    ///
    /// Zero for admitted requests.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Admission::Allowed => 0,
            Admission::Denied { retry_after } => {
                // Shave float noise from the deficit/rate division so an
                // exact N-second wait does not round up to N+1
                (retry_after.as_secs_f64() - 1e-9).ceil().max(0.0) as u64
            }
        }
    }
}

/// Per-client token/capacity snapshot for `stats()`
#[derive(Debug, Clone, Serialize)]
pub struct ClientBucketSnapshot {
    pub tokens: f64,
    pub capacity: f64,
}

/// Snapshot of limiter state
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub capacity: f64,
    pub refill_rate_per_sec: f64,
    pub active_clients: usize,
    pub clients: HashMap<String, ClientBucketSnapshot>,
}

struct LimiterInner {
    buckets: HashMap<String, TokenBucket>,
    last_sweep: DateTime<Utc>,
}

/// Token-bucket admission control for one traffic class
///
/// A single mutex guards the bucket table. Refill math is deterministic
/// given `(now, last_refill, tokens)`, so reading the clock outside the lock
/// is safe as long as the bucket mutation happens under it.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    /// Create a limiter for one traffic class
    pub fn new(config: RateLimitConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            inner: Mutex::new(LimiterInner {
                buckets: HashMap::new(),
                last_sweep: now,
            }),
        }
    }

    /// Admission check at unit cost
    pub fn admit(&self, client_id: &str) -> Admission {
        self.admit_with_cost(client_id, 1.0)
    }

    /// Admission check at an explicit token cost
    pub fn admit_with_cost(&self, client_id: &str, cost: f64) -> Admission {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();

        self.sweep_idle(&mut inner, now);

        let capacity = self.config.capacity;
        let rate = self.config.refill_rate;

        let bucket = inner
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: capacity,
                last_refill: now,
            });

        // Lazy refill from elapsed time
        let elapsed = (now - bucket.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            trace!(client = client_id, remaining = bucket.tokens, "admitted");
            Admission::Allowed
        } else {
            let deficit = cost - bucket.tokens;
            let retry_after = if rate > 0.0 {
                Duration::from_secs_f64(deficit / rate)
            } else {
                Duration::MAX
            };
            trace!(
                client = client_id,
                retry_after_secs = retry_after.as_secs_f64(),
                "rate limited"
            );
            Admission::Denied { retry_after }
        }
    }

    /// Drop buckets whose last refill is older than the cleanup interval
    ///
    /// Runs at most once per interval, inline on `admit`.
    fn sweep_idle(&self, inner: &mut LimiterInner, now: DateTime<Utc>) {
        let interval = match chrono::Duration::from_std(self.config.cleanup_interval) {
            Ok(d) => d,
            Err(_) => return,
        };
        if now - inner.last_sweep < interval {
            return;
        }

        let before = inner.buckets.len();
        inner
            .buckets
            .retain(|_, bucket| now - bucket.last_refill < interval);
        inner.last_sweep = now;

        let removed = before - inner.buckets.len();
        if removed > 0 {
            debug!(removed, remaining = inner.buckets.len(), "swept idle client buckets");
        }
    }

    /// Refill one client's bucket to full capacity immediately
    pub fn reset(&self, client_id: &str) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().unwrap();
        if let Some(bucket) = inner.buckets.get_mut(client_id) {
            bucket.tokens = self.config.capacity;
            bucket.last_refill = now;
        }
    }

    /// Forget every client
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.buckets.len();
        inner.buckets.clear();
        debug!(removed, "rate limiter reset");
    }

    /// Snapshot of limits and per-client balances
    pub fn stats(&self) -> RateLimiterStats {
        let inner = self.inner.lock().unwrap();
        RateLimiterStats {
            capacity: self.config.capacity,
            refill_rate_per_sec: self.config.refill_rate,
            active_clients: inner.buckets.len(),
            clients: inner
                .buckets
                .iter()
                .map(|(id, b)| {
                    (
                        id.clone(),
                        ClientBucketSnapshot {
                            tokens: b.tokens,
                            capacity: self.config.capacity,
                        },
                    )
                })
                .collect(),
        }
    }
}
