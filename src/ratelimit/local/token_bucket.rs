//! In-process token bucket.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{elapsed_secs, Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::backend::{Limiter, ResourceLimiter};
use crate::ratelimit::params::{check_positive, check_rate};
use crate::ratelimit::registry::Registry;
use crate::ratelimit::resource::{AllowOptions, Entry, Resource};

/// Default parameters for new token buckets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    /// Tokens added per second
    pub rate: f64,
    /// Bucket capacity
    pub burst: u64,
}

impl TokenBucketConfig {
    pub fn new(rate: f64, burst: u64) -> Self {
        Self { rate, burst }
    }

    pub fn validate(&self) -> Result<()> {
        check_rate(self.rate)?;
        check_positive("burst", self.burst)
    }
}

/// State of a single token bucket.
///
/// Tokens accrue continuously at `rate` per second up to `capacity`. A new
/// bucket starts full.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u64,
    rate: f64,
    tokens: f64,
    last_refill: Option<DateTime<Utc>>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.burst,
            rate: config.rate,
            tokens: config.burst as f64,
            last_refill: None,
        }
    }

    /// Take `n` tokens if available.
    pub fn allow(&mut self, now: DateTime<Utc>, n: u64) -> bool {
        self.refill(now);

        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Change the refill rate. Tokens accrued so far are credited at the old
    /// rate first.
    pub fn set_rate(&mut self, now: DateTime<Utc>, rate: f64) {
        self.refill(now);
        self.rate = rate;
    }

    /// Change the capacity, dropping tokens above it.
    pub fn set_burst(&mut self, burst: u64) {
        self.capacity = burst;
        self.tokens = self.tokens.min(burst as f64);
    }

    /// Tokens currently in the bucket (as of the last call).
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let last = match self.last_refill {
            Some(last) => last,
            None => {
                self.last_refill = Some(now);
                return;
            }
        };

        if now <= last {
            return;
        }

        let refilled = self.tokens + elapsed_secs(last, now) * self.rate;
        self.tokens = refilled.min(self.capacity as f64);
        self.last_refill = Some(now);
    }
}

/// Token bucket limiter keeping one bucket per key in memory.
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    buckets: Registry<Mutex<TokenBucket>>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter whose new buckets use `config`.
    pub fn new(config: TokenBucketConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            buckets: Registry::new(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Take `n` tokens from the bucket for `key`.
    pub fn allow_n(&self, key: &str, n: u64) -> bool {
        let bucket = self.bucket(key);
        let now = self.clock.now();
        let allowed = bucket.lock().allow(now, n);

        trace!(key = %key, n = n, allowed = allowed, "Token bucket check");
        allowed
    }

    /// Change the refill rate for `key`.
    pub fn set_limit(&self, key: &str, rate: f64) -> Result<()> {
        check_rate(rate)?;
        let now = self.clock.now();
        self.bucket(key).lock().set_rate(now, rate);
        Ok(())
    }

    /// Change the capacity for `key`.
    pub fn set_burst(&self, key: &str, burst: u64) -> Result<()> {
        check_positive("burst", burst)?;
        self.bucket(key).lock().set_burst(burst);
        Ok(())
    }

    /// Tokens left for `key`, if it has a bucket.
    pub fn available(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.lock().tokens())
    }

    /// Number of keys with a bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<TokenBucket>> {
        self.buckets.get_or_insert_with(key, || {
            debug!(
                key = %key,
                rate = self.config.rate,
                burst = self.config.burst,
                "Creating token bucket"
            );
            Mutex::new(TokenBucket::new(self.config))
        })
    }

    fn resource_bucket(&self, resource: &Resource) -> Result<Arc<Mutex<TokenBucket>>> {
        self.buckets.get_or_try_insert_with(&resource.name, || {
            let config = TokenBucketConfig::new(resource.limit as f64, resource.burst);
            config.validate()?;
            debug!(
                resource = %resource.name,
                rate = config.rate,
                burst = config.burst,
                "Creating token bucket for resource"
            );
            Ok(Mutex::new(TokenBucket::new(config)))
        })
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    async fn allow(&self, key: &str, options: AllowOptions) -> Result<bool> {
        Ok(self.allow_n(key, options.weight()))
    }
}

#[async_trait]
impl ResourceLimiter for TokenBucketLimiter {
    async fn check_n(&self, resource: &Resource, count: u64) -> Entry {
        let result = self.resource_bucket(resource).map(|bucket| {
            let now = self.clock.now();
            bucket.lock().allow(now, count.max(1))
        });
        Entry::from_result(result)
    }

    fn set_limit(&self, resource: &Resource) -> Result<()> {
        let rate = resource.limit as f64;
        check_rate(rate)?;
        let now = self.clock.now();
        self.resource_bucket(resource)?.lock().set_rate(now, rate);
        Ok(())
    }

    fn set_burst(&self, resource: &Resource) -> Result<()> {
        check_positive("burst", resource.burst)?;
        self.resource_bucket(resource)?
            .lock()
            .set_burst(resource.burst);
        Ok(())
    }

    fn set_window(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }
}
