//! In-process approximate sliding window.
//!
//! Each key keeps a FIFO of accepted timestamps, at most `limit` long. When
//! the queue is full only the oldest entry is examined, and at most one
//! stale entry is evicted per call. This is cheaper than the sliding log but
//! not an exact count of requests inside the trailing window.

use std::collections::VecDeque;
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
use crate::ratelimit::resource::{AllowOptions, Entry, Resource};

/// Default parameters for new sliding windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    /// Requests accepted per window
    pub limit: u64,
    /// Trailing window length
    pub window: Duration,
}

impl SlidingWindowConfig {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }

    pub fn validate(&self) -> Result<()> {
        check_positive("limit", self.limit)?;
        check_window(self.window)
    }
}

/// State of a single sliding window.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    limit: u64,
    window: TimeDelta,
    accepted: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    pub fn new(config: SlidingWindowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            limit: config.limit,
            window: window_delta(config.window)?,
            accepted: VecDeque::new(),
        })
    }

    /// Admit one request at `now`.
    pub fn allow(&mut self, now: DateTime<Utc>) -> bool {
        if (self.accepted.len() as u64) < self.limit {
            self.accepted.push_back(now);
            return true;
        }

        match self.accepted.front() {
            Some(&oldest) if now - oldest < self.window => false,
            _ => {
                self.accepted.pop_front();
                self.accepted.push_back(now);
                true
            }
        }
    }

    /// Change the limit. A smaller limit drops the oldest entries so the
    /// queue never holds more than `limit` timestamps.
    pub fn set_limit(&mut self, limit: u64) {
        self.limit = limit;
        let excess = self.accepted.len().saturating_sub(limit as usize);
        self.accepted.drain(..excess);
    }

    pub fn set_window(&mut self, window: TimeDelta) {
        self.window = window;
    }

    /// Number of timestamps held.
    pub fn len(&self) -> usize {
        self.accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty()
    }
}

/// Approximate sliding window limiter keeping one queue per key in memory.
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    windows: Registry<Mutex<SlidingWindow>>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter whose new windows use `config`.
    pub fn new(config: SlidingWindowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            windows: Registry::new(),
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Admit one request for `key`.
    pub fn allow_one(&self, key: &str) -> Result<bool> {
        let window = self.window(key)?;
        let now = self.clock.now();
        let allowed = window.lock().allow(now);

        trace!(key = %key, allowed = allowed, "Sliding window check");
        Ok(allowed)
    }

    /// Change the limit for `key`.
    pub fn set_limit(&self, key: &str, limit: u64) -> Result<()> {
        check_positive("limit", limit)?;
        self.window(key)?.lock().set_limit(limit);
        Ok(())
    }

    /// Change the window length for `key`.
    pub fn set_window(&self, key: &str, window: Duration) -> Result<()> {
        let window = window_delta(window)?;
        self.window(key)?.lock().set_window(window);
        Ok(())
    }

    /// Number of timestamps held for `key`.
    pub fn queued(&self, key: &str) -> Option<usize> {
        self.windows.get(key).map(|window| window.lock().len())
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn window(&self, key: &str) -> Result<Arc<Mutex<SlidingWindow>>> {
        self.windows.get_or_try_insert_with(key, || {
            debug!(
                key = %key,
                limit = self.config.limit,
                window = ?self.config.window,
                "Creating sliding window"
            );
            SlidingWindow::new(self.config).map(Mutex::new)
        })
    }

    fn resource_window(&self, resource: &Resource) -> Result<Arc<Mutex<SlidingWindow>>> {
        self.windows.get_or_try_insert_with(&resource.name, || {
            debug!(
                resource = %resource.name,
                limit = resource.limit,
                window = ?resource.window,
                "Creating sliding window for resource"
            );
            SlidingWindow::new(SlidingWindowConfig::new(resource.limit, resource.window))
                .map(Mutex::new)
        })
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    /// Every call occupies one slot regardless of `options.weight()`.
    async fn allow(&self, key: &str, _options: AllowOptions) -> Result<bool> {
        self.allow_one(key)
    }
}

#[async_trait]
impl ResourceLimiter for SlidingWindowLimiter {
    async fn check_n(&self, resource: &Resource, _count: u64) -> Entry {
        let result = self.resource_window(resource).map(|window| {
            let now = self.clock.now();
            window.lock().allow(now)
        });
        Entry::from_result(result)
    }

    fn set_limit(&self, resource: &Resource) -> Result<()> {
        check_positive("limit", resource.limit)?;
        self.resource_window(resource)?
            .lock()
            .set_limit(resource.limit);
        Ok(())
    }

    fn set_burst(&self, _resource: &Resource) -> Result<()> {
        Ok(())
    }

    fn set_window(&self, resource: &Resource) -> Result<()> {
        let window = window_delta(resource.window)?;
        self.resource_window(resource)?.lock().set_window(window);
        Ok(())
    }
}
