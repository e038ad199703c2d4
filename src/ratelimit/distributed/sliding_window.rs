//! Sliding window shared through the store.
//!
//! Unlike the in-process approximate window this counts every member in
//! `[now - window, now]`, but it only trims stale members when a request is
//! accepted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::scripts::SLIDING_WINDOW;
use super::sliding_log::DEFAULT_KEY_TTL_GRACE;
use super::store::{admission, refresh_ttl_detached, with_timeout, MemberIds, ScriptExecutor};
use crate::clock::{window_delta, Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::backend::{Limiter, ResourceLimiter};
use crate::ratelimit::local::SlidingWindowConfig;
use crate::ratelimit::params::check_positive;
use crate::ratelimit::registry::Registry;
use crate::ratelimit::resource::{AllowOptions, Entry, Resource};

/// Default parameters for new distributed sliding windows.
pub type DistributedSlidingWindowConfig = SlidingWindowConfig;

/// Sliding window whose members live in the shared store.
pub struct DistributedSlidingWindow {
    config: DistributedSlidingWindowConfig,
    executor: Arc<dyn ScriptExecutor>,
    windows: Registry<RwLock<SlidingWindowConfig>>,
    members: MemberIds,
    clock: Arc<dyn Clock>,
    command_timeout: Option<Duration>,
    key_ttl_grace: Duration,
}

impl DistributedSlidingWindow {
    pub fn new(
        config: DistributedSlidingWindowConfig,
        executor: Arc<dyn ScriptExecutor>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            executor,
            windows: Registry::new(),
            members: MemberIds::new(),
            clock: Arc::new(SystemClock),
            command_timeout: None,
            key_ttl_grace: DEFAULT_KEY_TTL_GRACE,
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

    /// Extra key lifetime beyond the window.
    pub fn with_key_ttl_grace(mut self, grace: Duration) -> Self {
        self.key_ttl_grace = grace;
        self
    }

    /// Check one request for `key` against an explicit window and limit,
    /// bypassing the per-key parameters.
    pub async fn should_allow(&self, key: &str, window: Duration, limit: u64) -> Result<bool> {
        let params = SlidingWindowConfig::new(limit, window);
        params.validate()?;
        self.admit(key, params).await
    }

    /// Check one request for `key` with its configured parameters.
    pub async fn allow_one(&self, key: &str) -> Result<bool> {
        let params = *self.params(key).read();
        self.admit(key, params).await
    }

    /// Change the limit for `key`.
    pub fn set_limit(&self, key: &str, limit: u64) -> Result<()> {
        check_positive("limit", limit)?;
        self.params(key).write().limit = limit;
        Ok(())
    }

    /// Change the window length for `key`.
    pub fn set_window(&self, key: &str, window: Duration) -> Result<()> {
        window_delta(window)?;
        self.params(key).write().window = window;
        Ok(())
    }

    async fn admit(&self, key: &str, params: SlidingWindowConfig) -> Result<bool> {
        let now = self.clock.now();
        let boundary = now - window_delta(params.window)?;

        let args = [
            boundary.timestamp_micros().to_string(),
            now.timestamp_micros().to_string(),
            params.limit.to_string(),
            self.members.next(now.timestamp_micros()),
        ];
        let result = with_timeout(
            self.command_timeout,
            self.executor.eval(&SLIDING_WINDOW, &[key], &args),
        )
        .await;

        refresh_ttl_detached(
            self.executor.clone(),
            key.to_string(),
            params.window + self.key_ttl_grace,
        );

        let allowed = admission(result?)?;
        trace!(key = %key, allowed = allowed, "Distributed sliding window check");
        Ok(allowed)
    }

    fn params(&self, key: &str) -> Arc<RwLock<SlidingWindowConfig>> {
        self.windows.get_or_insert_with(key, || {
            debug!(
                key = %key,
                limit = self.config.limit,
                window = ?self.config.window,
                "Registering distributed sliding window"
            );
            RwLock::new(self.config)
        })
    }

    fn resource_params(&self, resource: &Resource) -> Result<Arc<RwLock<SlidingWindowConfig>>> {
        self.windows.get_or_try_insert_with(&resource.name, || {
            let config = SlidingWindowConfig::new(resource.limit, resource.window);
            config.validate()?;
            Ok(RwLock::new(config))
        })
    }
}

#[async_trait]
impl Limiter for DistributedSlidingWindow {
    /// Every call occupies one slot regardless of `options.weight()`.
    async fn allow(&self, key: &str, _options: AllowOptions) -> Result<bool> {
        self.allow_one(key).await
    }
}

#[async_trait]
impl ResourceLimiter for DistributedSlidingWindow {
    async fn check_n(&self, resource: &Resource, _count: u64) -> Entry {
        let params = match self.resource_params(resource) {
            Ok(params) => *params.read(),
            Err(err) => return Entry::from_result(Err(err)),
        };
        Entry::from_result(self.admit(&resource.name, params).await)
    }

    fn set_limit(&self, resource: &Resource) -> Result<()> {
        check_positive("limit", resource.limit)?;
        self.resource_params(resource)?.write().limit = resource.limit;
        Ok(())
    }

    fn set_burst(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }

    fn set_window(&self, resource: &Resource) -> Result<()> {
        window_delta(resource.window)?;
        self.resource_params(resource)?.write().window = resource.window;
        Ok(())
    }
}
