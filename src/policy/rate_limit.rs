//! Keyed token-bucket rate limiting.
//!
//! Each key (a client IP) owns a bucket that starts full. Every full interval
//! that elapses adds `tokens_per_interval` tokens, capped at `max_tokens`, and
//! every accepted attempt spends one token. Buckets idle long enough to have
//! refilled completely carry no information and are evicted.

use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shortest period of the eviction ticker.
const MIN_EVICTION_PERIOD: Duration = Duration::from_millis(10);

/// Bucket parameters shared by every key of one limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub tokens_per_interval: u32,
    pub interval: Duration,
    pub max_tokens: u32,
}

impl RateLimitConfig {
    pub fn new(tokens_per_interval: u32, interval: Duration, max_tokens: u32) -> Self {
        Self {
            tokens_per_interval,
            interval,
            max_tokens,
        }
    }

    /// Idle time after which any bucket is back at `max_tokens`.
    pub fn idle_ttl(&self) -> Duration {
        let periods = self.max_tokens.div_ceil(self.tokens_per_interval.max(1));
        self.interval.saturating_mul(periods.max(1))
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn full(cfg: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: cfg.max_tokens,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, cfg: &RateLimitConfig, now: Instant) {
        let interval = cfg.interval.as_nanos();
        if interval == 0 {
            self.tokens = cfg.max_tokens;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();
        let periods = elapsed / interval;
        if periods == 0 {
            return;
        }
        let added = periods.saturating_mul(u128::from(cfg.tokens_per_interval));
        let tokens = (u128::from(self.tokens) + added).min(u128::from(cfg.max_tokens));
        self.tokens = tokens as u32;
        // keep the partial period so refills stay aligned
        let remainder = (elapsed % interval) as u64;
        self.last_refill = now - Duration::from_nanos(remainder);
    }
}

/// Token buckets keyed by IP, sharded so unrelated clients do not contend.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<IpAddr, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Spend one token for `key`; `false` when the bucket is empty.
    pub fn check(&self, key: IpAddr) -> bool {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: IpAddr, now: Instant) -> bool {
        let mut bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| Bucket::full(&self.config, now));
        bucket.refill(&self.config, now);
        bucket.last_seen = now;
        if bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    /// Drop buckets idle for at least [`RateLimitConfig::idle_ttl`].
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = self.config.idle_ttl();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_seen) < ttl);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Evict idle buckets periodically until `shutdown` fires.
    pub async fn run_eviction(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.idle_ttl().max(MIN_EVICTION_PERIOD));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.evict_idle(Instant::now());
                    if removed > 0 {
                        debug!("evicted {removed} idle rate limit buckets, {} left", self.len());
                    }
                }
            }
        }
    }
}
