//! Exact sliding log shared through the store.
//!
//! Accepted requests are members of a sorted set scored by their
//! microsecond timestamp. Eviction, counting and insertion run as one
//! script; the key TTL is refreshed afterwards on a detached task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::scripts::SLIDING_LOG;
use super::store::{admission, refresh_ttl_detached, with_timeout, MemberIds, ScriptExecutor};
use crate::clock::{window_delta, Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::backend::{Limiter, ResourceLimiter};
use crate::ratelimit::params::{check_positive, check_window};
use crate::ratelimit::registry::Registry;
use crate::ratelimit::resource::{AllowOptions, Entry, FixedWindow, Resource};

/// Extra lifetime given to a log key beyond the window it covers.
pub const DEFAULT_KEY_TTL_GRACE: Duration = Duration::from_secs(60);

/// Default parameters for new distributed sliding logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedSlidingLogConfig {
    pub limit: u64,
    pub window: Duration,
    pub fixed_window: Option<FixedWindow>,
    /// Added to the window when refreshing the key TTL
    pub key_ttl_grace: Duration,
}

impl DistributedSlidingLogConfig {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            fixed_window: None,
            key_ttl_grace: DEFAULT_KEY_TTL_GRACE,
        }
    }

    pub fn with_fixed_window(mut self, window: FixedWindow) -> Self {
        self.fixed_window = Some(window);
        self
    }

    pub fn with_key_ttl_grace(mut self, grace: Duration) -> Self {
        self.key_ttl_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_positive("limit", self.limit)?;
        check_window(self.window)
    }
}

#[derive(Debug, Clone, Copy)]
struct LogParams {
    limit: u64,
    window: TimeDelta,
    fixed_window: Option<FixedWindow>,
}

impl LogParams {
    fn new(limit: u64, window: Duration, fixed_window: Option<FixedWindow>) -> Result<Self> {
        check_positive("limit", limit)?;
        Ok(Self {
            limit,
            window: window_delta(window)?,
            fixed_window,
        })
    }
}

fn micros(at: DateTime<Utc>) -> String {
    at.timestamp_micros().to_string()
}

/// Sliding log whose entries live in the shared store.
pub struct DistributedSlidingLog {
    config: DistributedSlidingLogConfig,
    executor: Arc<dyn ScriptExecutor>,
    logs: Registry<RwLock<LogParams>>,
    members: MemberIds,
    clock: Arc<dyn Clock>,
    command_timeout: Option<Duration>,
}

impl DistributedSlidingLog {
    pub fn new(config: DistributedSlidingLogConfig, executor: Arc<dyn ScriptExecutor>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            executor,
            logs: Registry::new(),
            members: MemberIds::new(),
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

    /// Check `options.weight()` requests for `key`.
    pub async fn allow_with(&self, key: &str, options: &AllowOptions) -> Result<bool> {
        let params = *self.params(key)?.read();
        self.record(key, params, options).await
    }

    /// Change the limit for `key`.
    pub fn set_limit(&self, key: &str, limit: u64) -> Result<()> {
        check_positive("limit", limit)?;
        self.params(key)?.write().limit = limit;
        Ok(())
    }

    /// Change the trailing window for `key`.
    pub fn set_window(&self, key: &str, window: Duration) -> Result<()> {
        let window = window_delta(window)?;
        self.params(key)?.write().window = window;
        Ok(())
    }

    /// Set the default fixed window for `key`.
    pub fn set_fixed_window(&self, key: &str, window: FixedWindow) -> Result<()> {
        self.params(key)?.write().fixed_window = Some(window);
        Ok(())
    }

    async fn record(&self, key: &str, params: LogParams, options: &AllowOptions) -> Result<bool> {
        let now = self.clock.now();
        let (left, right) = options.window_bounds(now, params.window, params.fixed_window)?;
        let n = options.weight();

        let args = [
            micros(left),
            micros(right),
            micros(now),
            params.limit.to_string(),
            n.to_string(),
            self.members.next(now.timestamp_micros()),
        ];
        let result = with_timeout(
            self.command_timeout,
            self.executor.eval(&SLIDING_LOG, &[key], &args),
        )
        .await;

        self.refresh_ttl(key, now, right, options.is_fixed_window(), params.window);

        let allowed = admission(result?)?;
        trace!(
            key = %key,
            n = n,
            fixed = options.is_fixed_window(),
            allowed = allowed,
            "Distributed sliding log check"
        );
        Ok(allowed)
    }

    /// Keep the key alive for as long as its entries can still be counted.
    fn refresh_ttl(
        &self,
        key: &str,
        now: DateTime<Utc>,
        right: DateTime<Utc>,
        fixed: bool,
        window: TimeDelta,
    ) {
        let span = if fixed { right - now } else { window };
        let ttl = span.to_std().unwrap_or_default() + self.config.key_ttl_grace;
        refresh_ttl_detached(self.executor.clone(), key.to_string(), ttl);
    }

    fn params(&self, key: &str) -> Result<Arc<RwLock<LogParams>>> {
        self.logs.get_or_try_insert_with(key, || {
            debug!(
                key = %key,
                limit = self.config.limit,
                window = ?self.config.window,
                "Registering distributed sliding log"
            );
            LogParams::new(self.config.limit, self.config.window, self.config.fixed_window)
                .map(RwLock::new)
        })
    }

    fn resource_params(&self, resource: &Resource) -> Result<Arc<RwLock<LogParams>>> {
        self.logs.get_or_try_insert_with(&resource.name, || {
            LogParams::new(resource.limit, resource.window, self.config.fixed_window)
                .map(RwLock::new)
        })
    }
}

#[async_trait]
impl Limiter for DistributedSlidingLog {
    async fn allow(&self, key: &str, options: AllowOptions) -> Result<bool> {
        self.allow_with(key, &options).await
    }
}

#[async_trait]
impl ResourceLimiter for DistributedSlidingLog {
    async fn check_n(&self, resource: &Resource, count: u64) -> Entry {
        let params = match self.resource_params(resource) {
            Ok(params) => *params.read(),
            Err(err) => return Entry::from_result(Err(err)),
        };
        let options = AllowOptions::new().count(count);
        Entry::from_result(self.record(&resource.name, params, &options).await)
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
        let window = window_delta(resource.window)?;
        self.resource_params(resource)?.write().window = window;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::LimiterError;
    use crate::ratelimit::distributed::MemoryStore;
    use rand::Rng;
    use std::collections::VecDeque;

    fn log(limit: u64, window: Duration) -> (DistributedSlidingLog, Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = DistributedSlidingLog::new(
            DistributedSlidingLogConfig::new(limit, window),
            store.clone(),
        )
        .unwrap()
        .with_clock(clock.clone());
        (limiter, store, clock)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_allow() {
        let (limiter, store, clock) = log(1, Duration::from_secs(3));
        let options = AllowOptions::new();

        assert!(limiter.allow_with("key", &options).await.unwrap());
        assert!(!limiter.allow_with("key", &options).await.unwrap());

        clock.advance(Duration::from_secs(4));
        assert!(limiter.allow_with("key", &options).await.unwrap());
        assert!(!limiter.allow_with("key", &options).await.unwrap());
        assert_eq!(store.zcard("key"), 1);
    }

    #[tokio::test]
    async fn test_set_limit_and_window() {
        let (limiter, _store, clock) = log(1, Duration::from_secs(3));
        let options = AllowOptions::new();

        assert!(limiter.allow_with("key", &options).await.unwrap());
        limiter.set_limit("key", 2).unwrap();
        clock.advance(Duration::from_millis(1));
        assert!(limiter.allow_with("key", &options).await.unwrap());
        clock.advance(Duration::from_millis(1));
        assert!(!limiter.allow_with("key", &options).await.unwrap());

        limiter.set_window("key", Duration::from_secs(1)).unwrap();
        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow_with("key", &options).await.unwrap());
    }

    #[tokio::test]
    async fn test_weighted_members_all_count() {
        let (limiter, store, clock) = log(5, Duration::from_secs(1));

        assert!(limiter.allow_with("key", &AllowOptions::new().count(3)).await.unwrap());
        assert_eq!(store.zcard("key"), 3);

        clock.advance(Duration::from_millis(1));
        assert!(limiter.allow_with("key", &AllowOptions::new().count(3)).await.unwrap());
        assert_eq!(store.zcard("key"), 6);

        clock.advance(Duration::from_millis(1));
        assert!(!limiter.allow_with("key", &AllowOptions::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_instant_calls_are_counted() {
        let (limiter, store, _clock) = log(2, Duration::from_secs(10));
        let options = AllowOptions::new();

        let mut accepted = 0;
        for _ in 0..10 {
            if limiter.allow_with("key", &options).await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 2);
        assert_eq!(store.zcard("key"), 2);

        // Two limiters sharing the store stand in for two processes.
        let other = DistributedSlidingLog::new(
            DistributedSlidingLogConfig::new(3, Duration::from_secs(10)),
            store.clone(),
        )
        .unwrap()
        .with_clock(limiter.clock.clone());
        assert!(other.allow_with("key", &options).await.unwrap());
        assert!(!other.allow_with("key", &options).await.unwrap());
        assert_eq!(store.zcard("key"), 3);
    }

    #[tokio::test]
    async fn test_never_exceeds_limit_in_any_window() {
        let limit = 5;
        let window = Duration::from_millis(1000);
        let (limiter, store, clock) = log(limit, window);
        let window = TimeDelta::from_std(window).unwrap();
        let options = AllowOptions::new();
        let mut rng = rand::thread_rng();
        let mut accepted: VecDeque<DateTime<Utc>> = VecDeque::new();

        for _ in 0..2000 {
            let step = if rng.gen_bool(0.25) { 0 } else { rng.gen_range(1..120) };
            clock.advance(Duration::from_millis(step));
            let now = clock.now();
            if limiter.allow_with("key", &options).await.unwrap() {
                accepted.push_back(now);
            }

            while let Some(&oldest) = accepted.front() {
                if oldest < now - window {
                    accepted.pop_front();
                } else {
                    break;
                }
            }
            assert!(accepted.len() as u64 <= limit);
            assert_eq!(store.zcard("key"), accepted.len());
        }
    }

    #[tokio::test]
    async fn test_fixed_window() {
        let (limiter, _store, clock) = log(2, Duration::from_secs(1));
        let start = clock.now();
        let window = FixedWindow::new(start, start + TimeDelta::seconds(10)).unwrap();

        assert!(matches!(
            limiter.allow_with("key", &AllowOptions::new().fixed_window()).await,
            Err(LimiterError::MissingFixedWindow)
        ));

        limiter.set_fixed_window("key", window).unwrap();
        let fixed = AllowOptions::new().fixed_window();
        assert!(limiter.allow_with("key", &fixed).await.unwrap());
        clock.advance(Duration::from_secs(5));
        assert!(limiter.allow_with("key", &fixed).await.unwrap());
        clock.advance(Duration::from_secs(4));
        assert!(!limiter.allow_with("key", &fixed).await.unwrap());

        clock.advance(Duration::from_secs(2));
        assert!(matches!(
            limiter.allow_with("key", &fixed).await,
            Err(LimiterError::OutsideWindow { .. })
        ));
    }

    #[tokio::test]
    async fn test_ttl_refresh() {
        let (limiter, store, clock) = log(1, Duration::from_secs(3));

        assert!(limiter.allow_with("key", &AllowOptions::new()).await.unwrap());
        settle().await;
        assert_eq!(store.ttl("key"), Some(Duration::from_secs(63)));

        let start = clock.now();
        let window = FixedWindow::new(start, start + TimeDelta::seconds(30)).unwrap();
        assert!(limiter
            .allow_with("fixed", &AllowOptions::new().within(window))
            .await
            .unwrap());
        settle().await;
        assert_eq!(store.ttl("fixed"), Some(Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn test_store_errors_are_returned() {
        let (limiter, store, _clock) = log(1, Duration::from_secs(1));
        store.set_unavailable(true);

        let result = limiter.allow("key", AllowOptions::new()).await;
        assert!(matches!(result, Err(LimiterError::Store(_))));

        store.set_unavailable(false);
        assert!(limiter.allow("key", AllowOptions::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_resource_check() {
        let (limiter, store, clock) = log(100, Duration::from_secs(60));
        let resource = Resource::new("export")
            .with_limit(1)
            .with_window(Duration::from_secs(2));

        assert!(limiter.check(&resource).await.allow());
        assert!(!limiter.check(&resource).await.allow());

        ResourceLimiter::set_limit(&limiter, &resource.clone().with_limit(2)).unwrap();
        clock.advance(Duration::from_millis(1));
        assert!(limiter.check(&resource).await.allow());
        assert_eq!(store.zcard("export"), 2);

        let broken = Resource::new("broken").with_limit(1).with_window(Duration::ZERO);
        assert!(limiter.check(&broken).await.error().is_some());
    }
}
