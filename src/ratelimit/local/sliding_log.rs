//! In-process exact sliding log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{window_delta, Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::backend::{Limiter, ResourceLimiter};
use crate::ratelimit::params::{check_positive, check_window};
use crate::ratelimit::registry::Registry;
use crate::ratelimit::resource::{AllowOptions, Entry, FixedWindow, Resource};

/// Default parameters for new sliding logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingLogConfig {
    /// Requests accepted per window
    pub limit: u64,
    /// Trailing window length
    pub window: Duration,
    /// Boundaries used when a call asks for fixed mode without its own
    pub fixed_window: Option<FixedWindow>,
}

impl SlidingLogConfig {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            fixed_window: None,
        }
    }

    pub fn with_fixed_window(mut self, window: FixedWindow) -> Self {
        self.fixed_window = Some(window);
        self
    }

    pub fn validate(&self) -> Result<()> {
        check_positive("limit", self.limit)?;
        check_window(self.window)
    }
}

/// State of a single sliding log: a multiset of accepted timestamps.
#[derive(Debug, Clone)]
pub struct SlidingLog {
    limit: u64,
    window: TimeDelta,
    fixed_window: Option<FixedWindow>,
    accepted: BTreeMap<DateTime<Utc>, u64>,
}

impl SlidingLog {
    pub fn new(config: SlidingLogConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            limit: config.limit,
            window: window_delta(config.window)?,
            fixed_window: config.fixed_window,
            accepted: BTreeMap::new(),
        })
    }

    /// Resolve the `[left, right]` boundaries for a call at `now`.
    pub fn bounds(
        &self,
        now: DateTime<Utc>,
        options: &AllowOptions,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        options.window_bounds(now, self.window, self.fixed_window)
    }

    /// Record `n` requests at `now` unless the window is already full.
    pub fn allow(&mut self, now: DateTime<Utc>, n: u64, options: &AllowOptions) -> Result<bool> {
        let (left, right) = self.bounds(now, options)?;

        self.accepted = self.accepted.split_off(&left);

        let count: u64 = self.accepted.range(left..=right).map(|(_, hits)| hits).sum();
        if count >= self.limit {
            return Ok(false);
        }

        *self.accepted.entry(now).or_insert(0) += n;
        Ok(true)
    }

    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
    }

    pub fn set_window(&mut self, window: TimeDelta) {
        self.window = window;
    }

    pub fn set_fixed_window(&mut self, window: FixedWindow) {
        self.fixed_window = Some(window);
    }

    /// Number of recorded requests.
    pub fn len(&self) -> u64 {
        self.accepted.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }
}

/// Exact sliding log limiter keeping one log per key in memory.
pub struct SlidingLogLimiter {
    config: SlidingLogConfig,
    logs: Registry<Mutex<SlidingLog>>,
    clock: Arc<dyn Clock>,
}

impl SlidingLogLimiter {
    /// Create a limiter whose new logs use `config`.
    pub fn new(config: SlidingLogConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            logs: Registry::new(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check `options.weight()` requests for `key`.
    pub fn allow_with(&self, key: &str, options: &AllowOptions) -> Result<bool> {
        let log = self.log(key)?;
        let now = self.clock.now();
        let allowed = log.lock().allow(now, options.weight(), options)?;

        trace!(
            key = %key,
            n = options.weight(),
            fixed = options.is_fixed_window(),
            allowed = allowed,
            "Sliding log check"
        );
        Ok(allowed)
    }

    /// Change the limit for `key`.
    pub fn set_limit(&self, key: &str, limit: u64) -> Result<()> {
        check_positive("limit", limit)?;
        self.log(key)?.lock().set_limit(limit);
        Ok(())
    }

    /// Change the trailing window for `key`.
    pub fn set_window(&self, key: &str, window: Duration) -> Result<()> {
        let window = window_delta(window)?;
        self.log(key)?.lock().set_window(window);
        Ok(())
    }

    /// Set the default fixed window for `key`.
    pub fn set_fixed_window(&self, key: &str, window: FixedWindow) -> Result<()> {
        self.log(key)?.lock().set_fixed_window(window);
        Ok(())
    }

    /// Number of recorded requests for `key`.
    pub fn recorded(&self, key: &str) -> Option<u64> {
        self.logs.get(key).map(|log| log.lock().len())
    }

    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    fn log(&self, key: &str) -> Result<Arc<Mutex<SlidingLog>>> {
        self.logs.get_or_try_insert_with(key, || {
            debug!(
                key = %key,
                limit = self.config.limit,
                window = ?self.config.window,
                "Creating sliding log"
            );
            SlidingLog::new(self.config).map(Mutex::new)
        })
    }

    fn resource_log(&self, resource: &Resource) -> Result<Arc<Mutex<SlidingLog>>> {
        self.logs.get_or_try_insert_with(&resource.name, || {
            debug!(
                resource = %resource.name,
                limit = resource.limit,
                window = ?resource.window,
                "Creating sliding log for resource"
            );
            let mut config = SlidingLogConfig::new(resource.limit, resource.window);
            config.fixed_window = self.config.fixed_window;
            SlidingLog::new(config).map(Mutex::new)
        })
    }
}

#[async_trait]
impl Limiter for SlidingLogLimiter {
    async fn allow(&self, key: &str, options: AllowOptions) -> Result<bool> {
        self.allow_with(key, &options)
    }
}

#[async_trait]
impl ResourceLimiter for SlidingLogLimiter {
    async fn check_n(&self, resource: &Resource, count: u64) -> Entry {
        let options = AllowOptions::new().count(count);
        let result = self.resource_log(resource).and_then(|log| {
            let now = self.clock.now();
            log.lock().allow(now, options.weight(), &options)
        });
        Entry::from_result(result)
    }

    fn set_limit(&self, resource: &Resource) -> Result<()> {
        check_positive("limit", resource.limit)?;
        self.resource_log(resource)?.lock().set_limit(resource.limit);
        Ok(())
    }

    fn set_burst(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }

    fn set_window(&self, resource: &Resource) -> Result<()> {
        let window = window_delta(resource.window)?;
        self.resource_log(resource)?.lock().set_window(window);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::LimiterError;
    use rand::Rng;
    use std::collections::VecDeque;

    fn limiter(limit: u64, window: Duration) -> (SlidingLogLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let limiter = SlidingLogLimiter::new(SlidingLogConfig::new(limit, window))
            .unwrap()
            .with_clock(clock.clone());
        (limiter, clock)
    }

    fn allow(limiter: &SlidingLogLimiter, key: &str) -> bool {
        limiter.allow_with(key, &AllowOptions::new()).unwrap()
    }

    #[test]
    fn test_trailing_window() {
        let (limiter, clock) = limiter(1, Duration::from_secs(3));

        assert!(allow(&limiter, "key"));
        assert!(!allow(&limiter, "key"));

        clock.advance(Duration::from_secs(4));
        assert!(allow(&limiter, "key"));
        assert!(!allow(&limiter, "key"));
    }

    #[test]
    fn test_set_limit() {
        let (limiter, clock) = limiter(1, Duration::from_secs(3));

        assert!(allow(&limiter, "key"));
        assert!(!allow(&limiter, "key"));

        clock.advance(Duration::from_secs(1));
        limiter.set_limit("key", 2).unwrap();
        assert!(allow(&limiter, "key"));
        assert!(!allow(&limiter, "key"));
    }

    #[test]
    fn test_set_window_evicts_on_next_call() {
        let (limiter, clock) = limiter(1, Duration::from_secs(3));

        assert!(allow(&limiter, "key"));
        clock.advance(Duration::from_secs(2));
        assert!(!allow(&limiter, "key"));
        assert_eq!(limiter.recorded("key"), Some(1));

        limiter.set_window("key", Duration::from_secs(1)).unwrap();
        assert!(allow(&limiter, "key"));
        assert_eq!(limiter.recorded("key"), Some(1));
    }

    #[test]
    fn test_weighted_requests() {
        let (limiter, clock) = limiter(3, Duration::from_secs(10));

        assert!(limiter.allow_with("key", &AllowOptions::new().count(3)).unwrap());
        assert_eq!(limiter.recorded("key"), Some(3));
        assert!(!allow(&limiter, "key"));

        clock.advance(Duration::from_secs(11));
        assert!(allow(&limiter, "key"));
        assert_eq!(limiter.recorded("key"), Some(1));
    }

    #[test]
    fn test_fixed_window() {
        let (limiter, clock) = limiter(2, Duration::from_secs(1));
        let start = clock.now();
        let window = FixedWindow::new(start, start + TimeDelta::seconds(60)).unwrap();
        let options = AllowOptions::new().within(window);

        assert!(limiter.allow_with("key", &options).unwrap());
        clock.advance(Duration::from_secs(30));
        assert!(limiter.allow_with("key", &options).unwrap());
        // A trailing window would have forgotten the first request by now.
        assert!(!limiter.allow_with("key", &options).unwrap());

        clock.advance(Duration::from_secs(31));
        assert!(matches!(
            limiter.allow_with("key", &options),
            Err(LimiterError::OutsideWindow { .. })
        ));
    }

    #[test]
    fn test_fixed_window_defaults() {
        let (limiter, clock) = limiter(1, Duration::from_secs(1));
        let start = clock.now();

        assert!(matches!(
            limiter.allow_with("key", &AllowOptions::new().fixed_window()),
            Err(LimiterError::MissingFixedWindow)
        ));

        let window = FixedWindow::new(start, start + TimeDelta::seconds(10)).unwrap();
        limiter.set_fixed_window("key", window).unwrap();
        assert!(limiter.allow_with("key", &AllowOptions::new().fixed_window()).unwrap());
        assert!(!limiter.allow_with("key", &AllowOptions::new().fixed_window()).unwrap());
    }

    #[test]
    fn test_rejection_does_not_record() {
        let (limiter, _clock) = limiter(2, Duration::from_secs(5));

        assert!(allow(&limiter, "key"));
        assert!(allow(&limiter, "key"));
        assert!(!allow(&limiter, "key"));
        assert!(!allow(&limiter, "key"));
        assert_eq!(limiter.recorded("key"), Some(2));
    }

    #[test]
    fn test_never_exceeds_limit_in_any_window() {
        let limit = 5;
        let window = Duration::from_millis(1000);
        let (limiter, clock) = limiter(limit, window);
        let window = TimeDelta::from_std(window).unwrap();
        let mut rng = rand::thread_rng();
        let mut accepted: VecDeque<DateTime<Utc>> = VecDeque::new();

        for _ in 0..5000 {
            clock.advance(Duration::from_millis(rng.gen_range(0..120)));
            let now = clock.now();
            if allow(&limiter, "key") {
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
        }
    }

    #[tokio::test]
    async fn test_resource_check() {
        let (limiter, clock) = limiter(100, Duration::from_secs(60));
        let resource = Resource::new("export")
            .with_limit(1)
            .with_window(Duration::from_secs(3));

        assert!(limiter.check(&resource).await.allow());
        assert!(!limiter.check(&resource).await.allow());

        ResourceLimiter::set_limit(&limiter, &resource.clone().with_limit(2)).unwrap();
        assert!(limiter.check(&resource).await.allow());
        assert!(!limiter.check(&resource).await.allow());

        clock.advance(Duration::from_secs(4));
        assert!(limiter.check_n(&resource, 2).await.allow());
        assert!(!limiter.check(&resource).await.allow());
    }
}
