//! Limiter traits shared by every algorithm and backend.

use async_trait::async_trait;

use super::resource::{AllowOptions, Entry, Resource};
use crate::error::Result;

/// Key-oriented admission check.
///
/// This trait abstracts over the local and distributed limiters so callers
/// do not need to know which algorithm protects a key.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Check whether a request of `options.weight()` units may pass for `key`.
    ///
    /// `Ok(false)` is an ordinary rejection; `Err` means the check itself
    /// could not be performed.
    async fn allow(&self, key: &str, options: AllowOptions) -> Result<bool>;
}

/// Declarative admission check driven by a [`Resource`].
///
/// State for `resource.name` is created from the resource's `limit`, `burst`
/// and `window` on first use and reused afterwards. The setters mutate that
/// state in place; setters an algorithm has no use for are no-ops.
#[async_trait]
pub trait ResourceLimiter: Send + Sync {
    /// Check a single unit against the resource.
    async fn check(&self, resource: &Resource) -> Entry {
        self.check_n(resource, 1).await
    }

    /// Check `count` units against the resource.
    async fn check_n(&self, resource: &Resource, count: u64) -> Entry;

    /// Apply `resource.limit` to the live state.
    fn set_limit(&self, resource: &Resource) -> Result<()>;

    /// Apply `resource.burst` to the live state.
    fn set_burst(&self, resource: &Resource) -> Result<()>;

    /// Apply `resource.window` to the live state.
    fn set_window(&self, resource: &Resource) -> Result<()>;
}
