//! Limiters whose state lives in a shared, script-capable store.
//!
//! Every admission decision is a single script execution, so concurrent
//! callers in different processes are serialized by the store rather than
//! by client-side locks. Store failures are returned as errors and never
//! turned into an accept or a reject.

mod leaky_bucket;
mod memory;
pub mod scripts;
mod sliding_log;
mod sliding_window;
mod store;

pub use leaky_bucket::{DistributedLeakyBucket, DistributedLeakyBucketConfig};
pub use memory::MemoryStore;
pub use sliding_log::{DistributedSlidingLog, DistributedSlidingLogConfig, DEFAULT_KEY_TTL_GRACE};
pub use sliding_window::{DistributedSlidingWindow, DistributedSlidingWindowConfig};
#[cfg(feature = "redis")]
pub use store::RedisExecutor;
pub use store::{ScriptExecutor, StoreScript};
