//! Value types passed to and returned from limiters.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::{LimiterError, Result};

/// A named rate policy.
///
/// `name` partitions limiter state; the meaning of the numeric fields depends
/// on the algorithm:
///
/// | algorithm      | `limit`            | `burst`  | `window`        |
/// |----------------|--------------------|----------|-----------------|
/// | token bucket   | refill per second  | capacity | unused          |
/// | leaky bucket   | drain per second   | volume   | unused          |
/// | sliding window | requests in window | unused   | trailing length |
/// | sliding log    | requests in window | unused   | trailing length |
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    /// Unique policy key
    pub name: String,
    /// Rate or count limit
    pub limit: u64,
    /// Bucket capacity
    pub burst: u64,
    /// Window length
    pub window: Duration,
}

impl Resource {
    /// Create a resource with zeroed parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            limit: 0,
            burst: 0,
            window: Duration::ZERO,
        }
    }

    /// Set the limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    /// Set the burst.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// Set the window.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// The outcome of one [`ResourceLimiter::check`](super::ResourceLimiter::check).
#[derive(Debug)]
pub struct Entry {
    allowed: bool,
    error: Option<LimiterError>,
}

impl Entry {
    pub(crate) fn from_result(result: Result<bool>) -> Self {
        match result {
            Ok(allowed) => Self {
                allowed,
                error: None,
            },
            Err(err) => Self {
                allowed: false,
                error: Some(err),
            },
        }
    }

    /// Whether the request may proceed.
    pub fn allow(&self) -> bool {
        self.allowed
    }

    /// Release whatever the check acquired.
    ///
    /// None of the rate algorithms hold a slot across the request, so this
    /// does nothing; it exists for concurrency-style limiters.
    pub fn finish(&self) {}

    /// The error that prevented the check, if any.
    pub fn error(&self) -> Option<&LimiterError> {
        self.error.as_ref()
    }
}

/// Explicit window boundaries for the sliding log's fixed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    left: DateTime<Utc>,
    right: DateTime<Utc>,
}

impl FixedWindow {
    /// Create a window; `left` must be strictly before `right`.
    pub fn new(left: DateTime<Utc>, right: DateTime<Utc>) -> Result<Self> {
        if left >= right {
            return Err(LimiterError::Config(format!(
                "fixed window left boundary {} must precede right boundary {}",
                left, right
            )));
        }
        Ok(Self { left, right })
    }

    /// Left (oldest) boundary.
    pub fn left(&self) -> DateTime<Utc> {
        self.left
    }

    /// Right (newest) boundary.
    pub fn right(&self) -> DateTime<Utc> {
        self.right
    }

    /// Check that `now` lies inside `[left, right]`.
    pub fn ensure_contains(&self, now: DateTime<Utc>) -> Result<()> {
        if now < self.left || now > self.right {
            return Err(LimiterError::OutsideWindow {
                now,
                left: self.left,
                right: self.right,
            });
        }
        Ok(())
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct AllowOptions {
    count: u64,
    fixed_window: bool,
    bounds: Option<FixedWindow>,
}

impl AllowOptions {
    /// Default options: weight 1, trailing window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Weight of the request.
    pub fn count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    /// Use the key's configured fixed window (sliding log only).
    pub fn fixed_window(mut self) -> Self {
        self.fixed_window = true;
        self
    }

    /// Use an explicit fixed window (sliding log only).
    pub fn within(mut self, window: FixedWindow) -> Self {
        self.fixed_window = true;
        self.bounds = Some(window);
        self
    }

    /// Request weight; zero counts as one.
    pub fn weight(&self) -> u64 {
        self.count.max(1)
    }

    /// Whether fixed-window mode was requested.
    pub fn is_fixed_window(&self) -> bool {
        self.fixed_window
    }

    /// Explicit bounds passed with the call.
    pub fn bounds(&self) -> Option<FixedWindow> {
        self.bounds
    }

    /// Resolve the `[left, right]` boundaries for a call at `now`.
    ///
    /// Trailing mode spans `trailing` back from `now`. Fixed mode uses the
    /// call's own bounds, then `default_fixed`, and requires `now` to lie
    /// inside them.
    pub(crate) fn window_bounds(
        &self,
        now: DateTime<Utc>,
        trailing: TimeDelta,
        default_fixed: Option<FixedWindow>,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.fixed_window {
            return Ok((now - trailing, now));
        }

        let fixed = self
            .bounds
            .or(default_fixed)
            .ok_or(LimiterError::MissingFixedWindow)?;
        fixed.ensure_contains(now)?;
        Ok((fixed.left(), fixed.right()))
    }
}
