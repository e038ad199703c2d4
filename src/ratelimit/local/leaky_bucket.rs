//! In-process leaky bucket.

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

/// Default parameters for new leaky buckets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyBucketConfig {
    /// Units drained per second
    pub rate: f64,
    /// Bucket volume
    pub volume: u64,
}

impl LeakyBucketConfig {
    pub fn new(rate: f64, volume: u64) -> Self {
        Self { rate, volume }
    }

    pub fn validate(&self) -> Result<()> {
        check_rate(self.rate)?;
        check_positive("volume", self.volume)
    }
}

/// State of a single leaky bucket.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    volume: u64,
    rate: f64,
    level: f64,
    last_drain: Option<DateTime<Utc>>,
}

impl LeakyBucket {
    pub fn new(config: LeakyBucketConfig) -> Self {
        Self {
            volume: config.volume,
            rate: config.rate,
            level: 0.0,
            last_drain: None,
        }
    }

    /// Pour `n` units in after draining up to `now`.
    ///
    /// On overflow the level is capped at the volume and the request is
    /// rejected. The drain timestamp moves on every call.
    pub fn allow(&mut self, now: DateTime<Utc>, n: u64) -> bool {
        self.drain(now);

        let level = self.level + n as f64;
        if level > self.volume as f64 {
            self.level = self.volume as f64;
            return false;
        }

        self.level = level;
        true
    }

    /// Change the drain rate; the level is drained at the old rate up to `now`.
    pub fn set_rate(&mut self, now: DateTime<Utc>, rate: f64) {
        self.drain(now);
        self.rate = rate;
    }

    /// Change the volume, spilling anything above it.
    pub fn set_volume(&mut self, volume: u64) {
        self.volume = volume;
        self.level = self.level.min(volume as f64);
    }

    /// Current fill level (as of the last call).
    pub fn level(&self) -> f64 {
        self.level
    }

    pub fn volume(&self) -> u64 {
        self.volume
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn drain(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last_drain {
            let leaked = elapsed_secs(last, now) * self.rate;
            self.level = (self.level - leaked).max(0.0);
        }
        self.last_drain = Some(now);
    }
}

/// Leaky bucket limiter keeping one bucket per key in memory.
pub struct LeakyBucketLimiter {
    config: LeakyBucketConfig,
    buckets: Registry<Mutex<LeakyBucket>>,
    clock: Arc<dyn Clock>,
}

impl LeakyBucketLimiter {
    /// Create a limiter whose new buckets use `config`.
    pub fn new(config: LeakyBucketConfig) -> Result<Self> {
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

    /// Pour `n` units into the bucket for `key`.
    pub fn allow_n(&self, key: &str, n: u64) -> bool {
        let bucket = self.bucket(key);
        let now = self.clock.now();
        let allowed = bucket.lock().allow(now, n);

        if allowed {
            trace!(key = %key, n = n, "Leaky bucket accepted");
        } else {
            debug!(key = %key, n = n, "Leaky bucket overflow");
        }
        allowed
    }

    /// Change the drain rate for `key`.
    pub fn set_limit(&self, key: &str, rate: f64) -> Result<()> {
        check_rate(rate)?;
        let now = self.clock.now();
        self.bucket(key).lock().set_rate(now, rate);
        Ok(())
    }

    /// Change the volume for `key`.
    pub fn set_burst(&self, key: &str, volume: u64) -> Result<()> {
        check_positive("volume", volume)?;
        self.bucket(key).lock().set_volume(volume);
        Ok(())
    }

    /// Fill level for `key`, if it has a bucket.
    pub fn level(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.lock().level())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<LeakyBucket>> {
        self.buckets.get_or_insert_with(key, || {
            debug!(
                key = %key,
                rate = self.config.rate,
                volume = self.config.volume,
                "Creating leaky bucket"
            );
            Mutex::new(LeakyBucket::new(self.config))
        })
    }

    fn resource_bucket(&self, resource: &Resource) -> Result<Arc<Mutex<LeakyBucket>>> {
        self.buckets.get_or_try_insert_with(&resource.name, || {
            let config = LeakyBucketConfig::new(resource.limit as f64, resource.burst);
            config.validate()?;
            debug!(
                resource = %resource.name,
                rate = config.rate,
                volume = config.volume,
                "Creating leaky bucket for resource"
            );
            Ok(Mutex::new(LeakyBucket::new(config)))
        })
    }
}

#[async_trait]
impl Limiter for LeakyBucketLimiter {
    async fn allow(&self, key: &str, options: AllowOptions) -> Result<bool> {
        Ok(self.allow_n(key, options.weight()))
    }
}

#[async_trait]
impl ResourceLimiter for LeakyBucketLimiter {
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
        check_positive("volume", resource.burst)?;
        self.resource_bucket(resource)?
            .lock()
            .set_volume(resource.burst);
        Ok(())
    }

    fn set_window(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }
}
