//! In-process store that runs the limiter scripts natively.
//!
//! Behaves like a single Redis node for the three scripts in
//! [`scripts`](super::scripts): one mutex serializes every script, hashes
//! and sorted sets are kept per key, and expiry is checked lazily against
//! the injected clock. Useful for tests and single-node deployments.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, MutexGuard};

use super::scripts::{LEAKY_BUCKET, SLIDING_LOG, SLIDING_WINDOW};
use super::store::{ScriptExecutor, StoreScript};
use crate::clock::{Clock, SystemClock};
use crate::error::{LimiterError, Result};

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug)]
enum Value {
    Hash(HashMap<String, String>),
    SortedSet(SortedSet),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

/// Members ordered by integer score.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn add(&mut self, score: i64, member: String) {
        if let Some(previous) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(previous, member.clone()));
        }
        self.ordered.insert((score, member));
    }

    /// Drop every member scored strictly below `bound`.
    fn remove_below(&mut self, bound: i64) {
        let kept = self.ordered.split_off(&(bound, String::new()));
        for (_, member) in std::mem::replace(&mut self.ordered, kept) {
            self.scores.remove(&member);
        }
    }

    /// Members scored in `[min, max]`.
    fn count(&self, min: i64, max: i64) -> i64 {
        if min > max {
            return 0;
        }
        self.ordered
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .count() as i64
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }

    fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

/// A [`ScriptExecutor`] backed by process memory.
#[derive(Debug)]
pub struct MemoryStore {
    keys: Mutex<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose key expiry follows `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every command fail, as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// `HGET key field`.
    pub fn hget(&self, key: &str, field: &str) -> Option<String> {
        match self.live_keys().get(key).map(|slot| &slot.value) {
            Some(Value::Hash(hash)) => hash.get(field).cloned(),
            _ => None,
        }
    }

    /// `ZCARD key`.
    pub fn zcard(&self, key: &str) -> usize {
        match self.live_keys().get(key).map(|slot| &slot.value) {
            Some(Value::SortedSet(set)) => set.len(),
            _ => 0,
        }
    }

    /// Remaining time to live, `None` when the key is missing or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let keys = self.live_keys();
        let expires_at = keys.get(key)?.expires_at?;
        (expires_at - now).to_std().ok()
    }

    /// `EXISTS key`.
    pub fn exists(&self, key: &str) -> bool {
        self.live_keys().get(key).is_some()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LimiterError::Store("connection refused".to_string()));
        }
        Ok(())
    }

    /// Lock the keyspace after dropping everything that has expired.
    fn live_keys(&self) -> Keyspace<'_> {
        let now = self.clock.now();
        let mut keys = self.keys.lock();
        keys.retain(|_, slot| slot.expires_at.map_or(true, |at| at > now));
        Keyspace { keys }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct Keyspace<'a> {
    keys: MutexGuard<'a, HashMap<String, Slot>>,
}

impl Keyspace<'_> {
    fn get(&self, key: &str) -> Option<&Slot> {
        self.keys.get(key)
    }

    fn clear_if_empty(&mut self, key: &str) {
        let empty = match self.keys.get(key).map(|slot| &slot.value) {
            Some(Value::Hash(hash)) => hash.is_empty(),
            Some(Value::SortedSet(set)) => set.is_empty(),
            None => false,
        };
        if empty {
            self.keys.remove(key);
        }
    }

    /// The hash at `key` and its expiry, created empty if absent.
    fn hash(
        &mut self,
        key: &str,
    ) -> Result<(&mut HashMap<String, String>, &mut Option<DateTime<Utc>>)> {
        let slot = self.keys.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Hash(hash) => Ok((hash, &mut slot.expires_at)),
            Value::SortedSet(_) => Err(LimiterError::Store(WRONG_TYPE.to_string())),
        }
    }

    fn sorted_set(&mut self, key: &str) -> Result<&mut SortedSet> {
        let slot = self.keys.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::SortedSet(SortedSet::default()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::SortedSet(set) => Ok(set),
            Value::Hash(_) => Err(LimiterError::Store(WRONG_TYPE.to_string())),
        }
    }
}

fn arg<T: FromStr>(args: &[String], index: usize) -> Result<T> {
    args.get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| {
            LimiterError::Store(format!("ERR invalid or missing argument ARGV[{}]", index + 1))
        })
}

fn field(hash: &HashMap<String, String>, name: &str) -> Result<f64> {
    hash.get(name)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| LimiterError::Store(format!("ERR hash field {} is not a number", name)))
}

fn leaky_bucket(
    keys: &mut Keyspace<'_>,
    key: &str,
    args: &[String],
    now: DateTime<Utc>,
) -> Result<i64> {
    let volume: f64 = arg(args, 0)?;
    let rate: f64 = arg(args, 1)?;
    let requested: f64 = arg(args, 2)?;
    let current_time: f64 = arg(args, 3)?;
    let ttl = ((volume / rate) * 2.0).floor().max(60.0);

    let (hash, expires_at) = keys.hash(key)?;

    if hash.is_empty() {
        hash.insert("last_time".to_string(), args[3].clone());
        hash.insert("count".to_string(), "0".to_string());
    }

    let last_time = field(hash, "last_time")?;
    let count = field(hash, "count")?;
    let remain = (count + requested - (current_time - last_time) * rate).max(0.0);

    hash.insert("volume".to_string(), args[0].clone());
    hash.insert("rate".to_string(), args[1].clone());
    hash.insert("last_time".to_string(), args[3].clone());
    *expires_at = TimeDelta::try_seconds(ttl as i64).and_then(|ttl| now.checked_add_signed(ttl));

    if remain > volume {
        hash.insert("count".to_string(), args[0].clone());
        return Ok(0);
    }

    hash.insert("count".to_string(), remain.to_string());
    Ok(1)
}

fn sliding_log(keys: &mut Keyspace<'_>, key: &str, args: &[String]) -> Result<i64> {
    let left: i64 = arg(args, 0)?;
    let right: i64 = arg(args, 1)?;
    let now: i64 = arg(args, 2)?;
    let limit: i64 = arg(args, 3)?;
    let requested: i64 = arg(args, 4)?;
    let member: String = arg(args, 5)?;

    let set = keys.sorted_set(key)?;
    set.remove_below(left);

    let admitted = if set.count(left, right) >= limit {
        0
    } else {
        for i in 1..requested {
            set.add(now, format!("{}:{}", member, i));
        }
        set.add(now, member);
        1
    };

    keys.clear_if_empty(key);
    Ok(admitted)
}

fn sliding_window(keys: &mut Keyspace<'_>, key: &str, args: &[String]) -> Result<i64> {
    let boundary: i64 = arg(args, 0)?;
    let now: i64 = arg(args, 1)?;
    let limit: i64 = arg(args, 2)?;
    let member: String = arg(args, 3)?;

    let set = keys.sorted_set(key)?;
    let admitted = if set.count(boundary, now) >= limit {
        0
    } else {
        set.add(now, member);
        set.remove_below(boundary);
        1
    };

    keys.clear_if_empty(key);
    Ok(admitted)
}

#[async_trait]
impl ScriptExecutor for MemoryStore {
    async fn eval(&self, script: &StoreScript, keys: &[&str], args: &[String]) -> Result<i64> {
        self.ensure_available()?;
        let key = keys
            .first()
            .ok_or_else(|| LimiterError::Store("ERR script expects one key".to_string()))?;

        let now = self.clock.now();
        let mut keyspace = self.live_keys();

        if *script == LEAKY_BUCKET {
            leaky_bucket(&mut keyspace, key, args, now)
        } else if *script == SLIDING_LOG {
            sliding_log(&mut keyspace, key, args)
        } else if *script == SLIDING_WINDOW {
            sliding_window(&mut keyspace, key, args)
        } else {
            Err(LimiterError::Store(format!(
                "NOSCRIPT no script named {}",
                script.name()
            )))
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut keyspace = self.live_keys();
        if let Some(slot) = keyspace.keys.get_mut(key) {
            slot.expires_at = TimeDelta::from_std(ttl)
                .ok()
                .and_then(|ttl| now.checked_add_signed(ttl));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tokio_test::{assert_err, assert_ok};

    fn args(values: &[i64], member: &str) -> Vec<String> {
        let mut args: Vec<String> = values.iter().map(|value| value.to_string()).collect();
        args.push(member.to_string());
        args
    }

    #[test]
    fn test_sorted_set_ranges() {
        let mut set = SortedSet::default();
        set.add(10, "a".to_string());
        set.add(20, "b".to_string());
        set.add(30, "c".to_string());
        assert_eq!(set.count(10, 20), 2);
        assert_eq!(set.count(21, 29), 0);

        set.add(40, "a".to_string());
        assert_eq!(set.len(), 3);
        assert_eq!(set.count(0, 15), 0);

        set.remove_below(30);
        assert_eq!(set.len(), 2);
        assert_eq!(set.count(30, 40), 2);
    }

    #[tokio::test]
    async fn test_sliding_log_script() {
        let store = MemoryStore::new();

        assert_eq!(store.eval(&SLIDING_LOG, &["log"], &args(&[0, 100, 100, 2, 1], "a")).await.unwrap(), 1);
        assert_eq!(store.eval(&SLIDING_LOG, &["log"], &args(&[0, 101, 101, 2, 1], "b")).await.unwrap(), 1);
        assert_eq!(store.eval(&SLIDING_LOG, &["log"], &args(&[0, 102, 102, 2, 1], "c")).await.unwrap(), 0);
        assert_eq!(store.zcard("log"), 2);

        // Sliding past the first entry evicts it.
        assert_eq!(store.eval(&SLIDING_LOG, &["log"], &args(&[101, 201, 201, 2, 3], "d")).await.unwrap(), 1);
        assert_eq!(store.zcard("log"), 4);
    }

    #[tokio::test]
    async fn test_same_score_members_count_separately() {
        let store = MemoryStore::new();

        assert_eq!(store.eval(&SLIDING_LOG, &["log"], &args(&[0, 100, 100, 3, 2], "a")).await.unwrap(), 1);
        assert_eq!(store.eval(&SLIDING_LOG, &["log"], &args(&[0, 100, 100, 3, 1], "b")).await.unwrap(), 1);
        assert_eq!(store.eval(&SLIDING_LOG, &["log"], &args(&[0, 100, 100, 3, 1], "c")).await.unwrap(), 0);
        assert_eq!(store.zcard("log"), 3);

        assert_eq!(store.eval(&SLIDING_WINDOW, &["window"], &args(&[0, 100, 2], "a")).await.unwrap(), 1);
        assert_eq!(store.eval(&SLIDING_WINDOW, &["window"], &args(&[0, 100, 2], "b")).await.unwrap(), 1);
        assert_eq!(store.eval(&SLIDING_WINDOW, &["window"], &args(&[0, 100, 2], "c")).await.unwrap(), 0);
        assert_eq!(store.zcard("window"), 2);
    }

    #[tokio::test]
    async fn test_unknown_script_and_wrong_type() {
        let store = MemoryStore::new();
        let unknown = StoreScript::new("unknown", "return 1");
        assert!(matches!(
            store.eval(&unknown, &["key"], &[]).await,
            Err(LimiterError::Store(_))
        ));

        store.eval(&SLIDING_WINDOW, &["key"], &args(&[0, 10, 1], "m")).await.unwrap();
        let bucket = vec!["10".to_string(), "1".to_string(), "1".to_string(), "5".to_string()];
        assert!(matches!(
            store.eval(&LEAKY_BUCKET, &["key"], &bucket).await,
            Err(LimiterError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_expiry_follows_clock() {
        let clock = Arc::new(ManualClock::default());
        let store = MemoryStore::with_clock(clock.clone());

        store.eval(&SLIDING_WINDOW, &["key"], &args(&[0, 10, 1], "m")).await.unwrap();
        assert!(store.exists("key"));
        assert_eq!(store.ttl("key"), None);

        store.expire("key", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.ttl("key"), Some(Duration::from_secs(5)));

        clock.advance(Duration::from_secs(5));
        assert!(!store.exists("key"));
        assert_eq!(store.zcard("key"), 0);

        // Expiring a missing key is a no-op.
        store.expire("key", Duration::from_secs(5)).await.unwrap();
        assert!(!store.exists("key"));
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert_err!(store.eval(&SLIDING_WINDOW, &["key"], &args(&[0, 10, 1], "m")).await);
        assert_err!(store.expire("key", Duration::from_secs(1)).await);

        store.set_unavailable(false);
        assert_ok!(store.eval(&SLIDING_WINDOW, &["key"], &args(&[0, 10, 1], "m")).await);
    }
}
