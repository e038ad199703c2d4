//! The shared-store seam used by the distributed limiters.
//!
//! Limiters never talk to a connection directly. They hand a [`StoreScript`]
//! and its arguments to a [`ScriptExecutor`], which runs the script as one
//! atomic step on the store and returns its integer reply.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{LimiterError, Result};

/// A Lua script executed atomically by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreScript {
    name: &'static str,
    source: &'static str,
}

impl StoreScript {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    /// Stable identifier for the script.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lua source.
    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// The single capability the distributed limiters need from a store.
///
/// Implementations own connection management; they are expected to neither
/// retry nor fall back.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run `script` with `KEYS = keys` and `ARGV = args`, returning its
    /// integer reply.
    async fn eval(&self, script: &StoreScript, keys: &[&str], args: &[String]) -> Result<i64>;

    /// Set the time-to-live of `key`.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// Await `fut`, failing with [`LimiterError::Timeout`] after `limit`.
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| LimiterError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Interpret an admission script reply.
pub(crate) fn admission(reply: i64) -> Result<bool> {
    match reply {
        1 => Ok(true),
        0 => Ok(false),
        other => Err(LimiterError::UnexpectedReply(other)),
    }
}

/// Sorted-set member names for accepted requests.
///
/// Members are `<micros>-<origin>-<seq>`: the score stays the timestamp while
/// the random origin and per-limiter sequence keep calls that land on the
/// same microsecond, in this process or another, from sharing a member.
#[derive(Debug)]
pub(crate) struct MemberIds {
    origin: u64,
    seq: AtomicU64,
}

impl MemberIds {
    pub(crate) fn new() -> Self {
        Self {
            origin: rand::random(),
            seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn next(&self, micros: i64) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:016x}-{}", micros, self.origin, seq)
    }
}

/// Refresh the TTL of `key` on a detached task.
///
/// The task owns its own handles, so dropping or cancelling the caller does
/// not abort it.
pub(crate) fn refresh_ttl_detached(executor: Arc<dyn ScriptExecutor>, key: String, ttl: Duration) {
    let refresh = async move {
        if let Err(err) = executor.expire(&key, ttl).await {
            warn!(key = %key, error = %err, "Failed to refresh limiter key TTL");
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(refresh);
        }
        Err(_) => {
            debug!("No tokio runtime available, skipping limiter key TTL refresh");
        }
    }
}

#[cfg(feature = "redis")]
pub use self::redis_executor::RedisExecutor;

#[cfg(feature = "redis")]
mod redis_executor {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use dashmap::DashMap;
    use redis::aio::ConnectionManager;
    use redis::{Client, Script};
    use tracing::info;

    use super::{ScriptExecutor, StoreScript};
    use crate::error::Result;

    /// [`ScriptExecutor`] over a Redis connection manager.
    ///
    /// Scripts are sent with `EVALSHA`, falling back to `EVAL` when the
    /// server does not have them cached yet.
    #[derive(Clone)]
    pub struct RedisExecutor {
        conn: ConnectionManager,
        scripts: Arc<DashMap<&'static str, Script>>,
    }

    impl RedisExecutor {
        /// Wrap an already connected manager.
        pub fn new(conn: ConnectionManager) -> Self {
            Self {
                conn,
                scripts: Arc::new(DashMap::new()),
            }
        }

        /// Open a connection manager for `url`.
        pub async fn connect(url: &str) -> Result<Self> {
            let client = Client::open(url)?;
            let conn = ConnectionManager::new(client).await?;
            info!(url = %url, "Connected to Redis");
            Ok(Self::new(conn))
        }

        fn script(&self, script: &StoreScript) -> Script {
            self.scripts
                .entry(script.name())
                .or_insert_with(|| Script::new(script.source()))
                .value()
                .clone()
        }
    }

    #[async_trait]
    impl ScriptExecutor for RedisExecutor {
        async fn eval(&self, script: &StoreScript, keys: &[&str], args: &[String]) -> Result<i64> {
            let script = self.script(script);
            let mut invocation = script.prepare_invoke();
            for key in keys {
                invocation.key(*key);
            }
            for arg in args {
                invocation.arg(arg.as_str());
            }

            let mut conn = self.conn.clone();
            let reply: i64 = invocation.invoke_async(&mut conn).await?;
            Ok(reply)
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
            let mut conn = self.conn.clone();
            let millis = ttl.as_millis().min(i64::MAX as u128) as i64;
            let _: i64 = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(millis)
                .query_async(&mut conn)
                .await?;
            Ok(())
        }
    }

    // These run the Lua against a live server: `REDIS_URL=redis://127.0.0.1/
    // cargo test -- --ignored`.
    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::clock::ManualClock;
        use crate::ratelimit::distributed::scripts::{LEAKY_BUCKET, SLIDING_LOG, SLIDING_WINDOW};
        use crate::ratelimit::distributed::{DistributedSlidingLog, DistributedSlidingLogConfig};
        use crate::ratelimit::AllowOptions;

        async fn executor() -> RedisExecutor {
            let url = std::env::var("REDIS_URL").expect("REDIS_URL must point at a Redis server");
            RedisExecutor::connect(&url).await.unwrap()
        }

        fn test_key(name: &str) -> String {
            format!("airlimit-test:{}:{:08x}", name, rand::random::<u32>())
        }

        fn strings(values: &[&str]) -> Vec<String> {
            values.iter().map(|value| value.to_string()).collect()
        }

        async fn hget(executor: &RedisExecutor, key: &str, field: &str) -> String {
            let mut conn = executor.conn.clone();
            redis::cmd("HGET").arg(key).arg(field).query_async(&mut conn).await.unwrap()
        }

        async fn query_i64(executor: &RedisExecutor, command: &str, args: &[&str]) -> i64 {
            let mut conn = executor.conn.clone();
            let mut cmd = redis::cmd(command);
            for arg in args {
                cmd.arg(*arg);
            }
            cmd.query_async(&mut conn).await.unwrap()
        }

        async fn delete(executor: &RedisExecutor, key: &str) {
            query_i64(executor, "DEL", &[key]).await;
        }

        #[tokio::test]
        #[ignore]
        async fn test_leaky_bucket_script() {
            let executor = executor().await;
            let key = test_key("leaky");
            let t0 = chrono::Utc::now().timestamp();
            let t1 = t0 + 10;

            let first = strings(&["3000", "1", "1", t0.to_string().as_str()]);
            assert_eq!(executor.eval(&LEAKY_BUCKET, &[&key], &first).await.unwrap(), 1);
            assert_eq!(hget(&executor, &key, "count").await, "1");
            assert_eq!(hget(&executor, &key, "volume").await, "3000");
            assert_eq!(hget(&executor, &key, "rate").await, "1");
            assert_eq!(hget(&executor, &key, "last_time").await, t0.to_string());

            let second = strings(&["3000", "1", "100", t1.to_string().as_str()]);
            assert_eq!(executor.eval(&LEAKY_BUCKET, &[&key], &second).await.unwrap(), 1);
            assert_eq!(hget(&executor, &key, "count").await, "91");
            assert_eq!(hget(&executor, &key, "last_time").await, t1.to_string());

            let ttl = query_i64(&executor, "TTL", &[&key]).await;
            assert!((5990..=6000).contains(&ttl), "ttl {}", ttl);

            let overflow = strings(&["3000", "1", "5000", t1.to_string().as_str()]);
            assert_eq!(executor.eval(&LEAKY_BUCKET, &[&key], &overflow).await.unwrap(), 0);
            assert_eq!(hget(&executor, &key, "count").await, "3000");

            delete(&executor, &key).await;
        }

        #[tokio::test]
        #[ignore]
        async fn test_sliding_log_script() {
            let executor = executor().await;
            let key = test_key("log");

            assert_eq!(executor.eval(&SLIDING_LOG, &[&key], &strings(&["0", "100", "100", "2", "1", "a"])).await.unwrap(), 1);
            assert_eq!(executor.eval(&SLIDING_LOG, &[&key], &strings(&["0", "100", "100", "2", "1", "b"])).await.unwrap(), 1);
            assert_eq!(executor.eval(&SLIDING_LOG, &[&key], &strings(&["0", "101", "101", "2", "1", "c"])).await.unwrap(), 0);
            assert_eq!(query_i64(&executor, "ZCARD", &[&key]).await, 2);

            // Moving the left bound past both entries evicts them before counting.
            assert_eq!(executor.eval(&SLIDING_LOG, &[&key], &strings(&["101", "201", "201", "2", "3", "d"])).await.unwrap(), 1);
            assert_eq!(query_i64(&executor, "ZCARD", &[&key]).await, 3);
            assert_eq!(query_i64(&executor, "ZCOUNT", &[&key, "201", "201"]).await, 3);

            executor.expire(&key, Duration::from_secs(63)).await.unwrap();
            let ttl = query_i64(&executor, "PTTL", &[&key]).await;
            assert!((62_000..=63_000).contains(&ttl), "pttl {}", ttl);

            delete(&executor, &key).await;
        }

        #[tokio::test]
        #[ignore]
        async fn test_sliding_window_script() {
            let executor = executor().await;
            let key = test_key("window");

            assert_eq!(executor.eval(&SLIDING_WINDOW, &[&key], &strings(&["0", "100", "2", "a"])).await.unwrap(), 1);
            assert_eq!(executor.eval(&SLIDING_WINDOW, &[&key], &strings(&["0", "100", "2", "b"])).await.unwrap(), 1);
            assert_eq!(executor.eval(&SLIDING_WINDOW, &[&key], &strings(&["0", "100", "2", "c"])).await.unwrap(), 0);

            // Accepting trims members older than the boundary.
            assert_eq!(executor.eval(&SLIDING_WINDOW, &[&key], &strings(&["101", "300", "2", "d"])).await.unwrap(), 1);
            assert_eq!(query_i64(&executor, "ZCARD", &[&key]).await, 1);

            delete(&executor, &key).await;
        }

        #[tokio::test]
        #[ignore]
        async fn test_sliding_log_limiter_same_instant() {
            let executor: Arc<dyn ScriptExecutor> = Arc::new(executor().await);
            let key = test_key("limiter");
            let clock = Arc::new(ManualClock::default());
            let limiter = DistributedSlidingLog::new(
                DistributedSlidingLogConfig::new(2, Duration::from_secs(10)),
                executor.clone(),
            )
            .unwrap()
            .with_clock(clock);

            let mut accepted = 0;
            for _ in 0..10 {
                if limiter.allow_with(&key, &AllowOptions::new()).await.unwrap() {
                    accepted += 1;
                }
            }
            assert_eq!(accepted, 2);

            tokio::time::sleep(Duration::from_millis(50)).await;
            executor.expire(&key, Duration::from_millis(1)).await.unwrap();
        }
    }
}
