//! Named policies built from configuration.
//!
//! A [`PolicySet`] owns one limiter per configured policy and answers checks
//! by policy name. Reconfiguration goes through the resource setters, so
//! existing state survives a reload.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use super::backend::ResourceLimiter;
use super::distributed::{
    DistributedLeakyBucket, DistributedSlidingLog, DistributedSlidingLogConfig,
    DistributedSlidingWindow, ScriptExecutor,
};
use super::local::{
    LeakyBucketConfig, LeakyBucketLimiter, SlidingLogConfig, SlidingLogLimiter,
    SlidingWindowConfig, SlidingWindowLimiter, TokenBucketConfig, TokenBucketLimiter,
};
use super::resource::{Entry, Resource};
use crate::clock::{Clock, SystemClock};
use crate::config::{Algorithm, Backend, LimiterConfig, PolicyConfig, StoreConfig};
use crate::error::{LimiterError, Result};

struct Policy {
    config: RwLock<PolicyConfig>,
    limiter: Arc<dyn ResourceLimiter>,
}

/// Limiters for a set of named policies.
pub struct PolicySet {
    policies: HashMap<String, Policy>,
}

impl PolicySet {
    /// Build every policy in `config`. Distributed policies run against
    /// `store`, which must be present if any policy needs it.
    pub fn new(config: &LimiterConfig, store: Option<Arc<dyn ScriptExecutor>>) -> Result<Self> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new) with an explicit time source.
    pub fn with_clock(
        config: &LimiterConfig,
        store: Option<Arc<dyn ScriptExecutor>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut policies = HashMap::with_capacity(config.policies.len());
        for policy in &config.policies {
            let limiter = build_limiter(policy, &config.store, store.as_ref(), &clock)?;
            debug!(
                policy = %policy.name,
                algorithm = ?policy.algorithm,
                backend = ?policy.backend,
                "Built policy limiter"
            );
            policies.insert(
                policy.name.clone(),
                Policy {
                    config: RwLock::new(policy.clone()),
                    limiter,
                },
            );
        }

        info!(policies = policies.len(), "Policy set ready");
        Ok(Self { policies })
    }

    /// Check `count` units against the named policy.
    pub async fn check(&self, name: &str, count: u64) -> Entry {
        let Some(policy) = self.policies.get(name) else {
            return Entry::from_result(Err(unknown_policy(name)));
        };
        let resource = policy.config.read().resource();
        policy.limiter.check_n(&resource, count).await
    }

    /// Apply new limits to an existing policy without resetting its state.
    ///
    /// The algorithm and backend of a policy cannot change. The update is
    /// checked in full before any limiter setter runs, so a rejected update
    /// leaves the policy untouched.
    pub fn reconfigure(&self, update: PolicyConfig) -> Result<()> {
        update.validate()?;
        validate_params(&update)?;
        let policy = self
            .policies
            .get(&update.name)
            .ok_or_else(|| unknown_policy(&update.name))?;

        {
            let current = policy.config.read();
            if current.algorithm != update.algorithm || current.backend != update.backend {
                return Err(LimiterError::Config(format!(
                    "policy {}: algorithm and backend cannot change on reload",
                    update.name
                )));
            }
        }

        let resource: Resource = update.resource();
        policy.limiter.set_limit(&resource)?;
        policy.limiter.set_burst(&resource)?;
        policy.limiter.set_window(&resource)?;

        info!(
            policy = %update.name,
            limit = update.limit,
            burst = update.burst,
            window_ms = update.window_ms,
            "Policy reconfigured"
        );
        *policy.config.write() = update;
        Ok(())
    }

    /// Current configuration of a policy.
    pub fn policy(&self, name: &str) -> Option<PolicyConfig> {
        self.policies.get(name).map(|policy| policy.config.read().clone())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

fn unknown_policy(name: &str) -> LimiterError {
    LimiterError::Config(format!("unknown policy {}", name))
}

/// Check the parameters the policy's algorithm actually reads.
fn validate_params(policy: &PolicyConfig) -> Result<()> {
    let rate = policy.limit as f64;
    match policy.algorithm {
        Algorithm::TokenBucket => TokenBucketConfig::new(rate, policy.burst).validate(),
        Algorithm::LeakyBucket => LeakyBucketConfig::new(rate, policy.burst).validate(),
        Algorithm::SlidingWindow => {
            SlidingWindowConfig::new(policy.limit, policy.window()).validate()
        }
        Algorithm::SlidingLog => SlidingLogConfig::new(policy.limit, policy.window()).validate(),
    }
}

fn build_limiter(
    policy: &PolicyConfig,
    store_config: &StoreConfig,
    store: Option<&Arc<dyn ScriptExecutor>>,
    clock: &Arc<dyn Clock>,
) -> Result<Arc<dyn ResourceLimiter>> {
    let rate = policy.limit as f64;
    let window = policy.window();

    let limiter: Arc<dyn ResourceLimiter> = match policy.backend {
        Backend::Local => match policy.algorithm {
            Algorithm::TokenBucket => Arc::new(
                TokenBucketLimiter::new(TokenBucketConfig::new(rate, policy.burst))?
                    .with_clock(clock.clone()),
            ),
            Algorithm::LeakyBucket => Arc::new(
                LeakyBucketLimiter::new(LeakyBucketConfig::new(rate, policy.burst))?
                    .with_clock(clock.clone()),
            ),
            Algorithm::SlidingWindow => Arc::new(
                SlidingWindowLimiter::new(SlidingWindowConfig::new(policy.limit, window))?
                    .with_clock(clock.clone()),
            ),
            Algorithm::SlidingLog => Arc::new(
                SlidingLogLimiter::new(SlidingLogConfig::new(policy.limit, window))?
                    .with_clock(clock.clone()),
            ),
        },
        Backend::Distributed => {
            let store = store.cloned().ok_or_else(|| {
                LimiterError::Config(format!(
                    "policy {} is distributed but no store is available",
                    policy.name
                ))
            })?;
            let timeout = store_config.command_timeout();

            match policy.algorithm {
                Algorithm::TokenBucket => {
                    return Err(LimiterError::Config(format!(
                        "policy {}: token bucket has no distributed backend",
                        policy.name
                    )))
                }
                Algorithm::LeakyBucket => {
                    let mut limiter = DistributedLeakyBucket::new(
                        LeakyBucketConfig::new(rate, policy.burst),
                        store,
                    )?
                    .with_clock(clock.clone());
                    if let Some(timeout) = timeout {
                        limiter = limiter.with_command_timeout(timeout);
                    }
                    Arc::new(limiter)
                }
                Algorithm::SlidingWindow => {
                    let mut limiter = DistributedSlidingWindow::new(
                        SlidingWindowConfig::new(policy.limit, window),
                        store,
                    )?
                    .with_clock(clock.clone())
                    .with_key_ttl_grace(store_config.key_ttl_grace());
                    if let Some(timeout) = timeout {
                        limiter = limiter.with_command_timeout(timeout);
                    }
                    Arc::new(limiter)
                }
                Algorithm::SlidingLog => {
                    let config = DistributedSlidingLogConfig::new(policy.limit, window)
                        .with_key_ttl_grace(store_config.key_ttl_grace());
                    let mut limiter =
                        DistributedSlidingLog::new(config, store)?.with_clock(clock.clone());
                    if let Some(timeout) = timeout {
                        limiter = limiter.with_command_timeout(timeout);
                    }
                    Arc::new(limiter)
                }
            }
        }
    };

    Ok(limiter)
}
