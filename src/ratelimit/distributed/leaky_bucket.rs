//! Leaky bucket shared through the store.
//!
//! The bucket itself lives in a store hash `{volume, rate, last_time, count}`
//! updated by one script per call. Only the per-key parameters are held in
//! process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::scripts::LEAKY_BUCKET;
use super::store::{admission, with_timeout, ScriptExecutor};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::backend::{Limiter, ResourceLimiter};
use crate::ratelimit::local::LeakyBucketConfig;
use crate::ratelimit::params::{check_positive, check_rate};
use crate::ratelimit::registry::Registry;
use crate::ratelimit::resource::{AllowOptions, Entry, Resource};

/// Default parameters for new distributed leaky buckets.
pub type DistributedLeakyBucketConfig = LeakyBucketConfig;

/// Leaky bucket whose level is kept in the shared store.
pub struct DistributedLeakyBucket {
    config: DistributedLeakyBucketConfig,
    executor: Arc<dyn ScriptExecutor>,
    buckets: Registry<RwLock<DistributedLeakyBucketConfig>>,
    clock: Arc<dyn Clock>,
    command_timeout: Option<Duration>,
}

impl DistributedLeakyBucket {
    pub fn new(
        config: DistributedLeakyBucketConfig,
        executor: Arc<dyn ScriptExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            executor,
            buckets: Registry::new(),
            clock: Arc::new(SystemClock),
            command_timeout: None,
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fail store calls that take longer than `timeout`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Pour `n` units into the bucket stored under `key`.
    pub async fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        let params = *self.params(key).read();
        self.pour(key, params, n).await
    }

    /// Change the drain rate used for `key`.
    pub fn set_limit(&self, key: &str, rate: f64) -> Result<()> {
        check_rate(rate)?;
        self.params(key).write().rate = rate;
        Ok(())
    }

    /// Change the volume used for `key`.
    pub fn set_burst(&self, key: &str, volume: u64) -> Result<()> {
        check_positive("volume", volume)?;
        self.params(key).write().volume = volume;
        Ok(())
    }

    async fn pour(&self, key: &str, params: LeakyBucketConfig, n: u64) -> Result<bool> {
        let now = self.clock.now().timestamp();
        let args = [
            params.volume.to_string(),
            params.rate.to_string(),
            n.to_string(),
            now.to_string(),
        ];

        let reply = with_timeout(
            self.command_timeout,
            self.executor.eval(&LEAKY_BUCKET, &[key], &args),
        )
        .await?;
        let allowed = admission(reply)?;

        trace!(key = %key, n = n, allowed = allowed, "Distributed leaky bucket check");
        Ok(allowed)
    }

    fn params(&self, key: &str) -> Arc<RwLock<LeakyBucketConfig>> {
        self.buckets.get_or_insert_with(key, || {
            debug!(
                key = %key,
                rate = self.config.rate,
                volume = self.config.volume,
                "Registering distributed leaky bucket"
            );
            RwLock::new(self.config)
        })
    }

    fn resource_params(&self, resource: &Resource) -> Result<Arc<RwLock<LeakyBucketConfig>>> {
        self.buckets.get_or_try_insert_with(&resource.name, || {
            let config = LeakyBucketConfig::new(resource.limit as f64, resource.burst);
            config.validate()?;
            Ok(RwLock::new(config))
        })
    }
}

#[async_trait]
impl Limiter for DistributedLeakyBucket {
    async fn allow(&self, key: &str, options: AllowOptions) -> Result<bool> {
        self.allow_n(key, options.weight()).await
    }
}

#[async_trait]
impl ResourceLimiter for DistributedLeakyBucket {
    async fn check_n(&self, resource: &Resource, count: u64) -> Entry {
        let params = match self.resource_params(resource) {
            Ok(params) => *params.read(),
            Err(err) => return Entry::from_result(Err(err)),
        };
        Entry::from_result(self.pour(&resource.name, params, count.max(1)).await)
    }

    fn set_limit(&self, resource: &Resource) -> Result<()> {
        let rate = resource.limit as f64;
        check_rate(rate)?;
        self.resource_params(resource)?.write().rate = rate;
        Ok(())
    }

    fn set_burst(&self, resource: &Resource) -> Result<()> {
        check_positive("volume", resource.burst)?;
        self.resource_params(resource)?.write().volume = resource.burst;
        Ok(())
    }

    fn set_window(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }
}
