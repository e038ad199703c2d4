//! In-process limiters.
//!
//! Each limiter keeps a registry of per-key state guarded by its own mutex,
//! so keys never contend with each other and no call performs I/O.

mod leaky_bucket;
mod sliding_log;
mod sliding_window;
mod token_bucket;

pub use leaky_bucket::{LeakyBucket, LeakyBucketConfig, LeakyBucketLimiter};
pub use sliding_log::{SlidingLog, SlidingLogConfig, SlidingLogLimiter};
pub use sliding_window::{SlidingWindow, SlidingWindowConfig, SlidingWindowLimiter};
pub use token_bucket::{TokenBucket, TokenBucketConfig, TokenBucketLimiter};
