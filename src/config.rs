//! Configuration management for airlimit.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LimiterError, Result};
use crate::ratelimit::Resource;

/// Top-level configuration: store settings plus named policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Shared store settings for distributed policies
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit policies
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL; distributed policies run against an in-process store when unset
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Per-command timeout in milliseconds
    #[serde(default)]
    pub command_timeout_ms: Option<u64>,

    /// Extra lifetime of sliding log/window keys beyond their window
    #[serde(default = "default_key_ttl_grace")]
    pub key_ttl_grace_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            command_timeout_ms: None,
            key_ttl_grace_secs: default_key_ttl_grace(),
        }
    }
}

fn default_key_ttl_grace() -> u64 {
    60
}

impl StoreConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn key_ttl_grace(&self) -> Duration {
        Duration::from_secs(self.key_ttl_grace_secs)
    }
}

/// Rate limiting algorithm of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    LeakyBucket,
    SlidingWindow,
    SlidingLog,
}

/// Where a policy keeps its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Local,
    Distributed,
}

/// A named rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Policy name, also the limiter key
    pub name: String,
    pub algorithm: Algorithm,
    #[serde(default)]
    pub backend: Backend,
    /// Rate per second for buckets, requests per window otherwise
    pub limit: u64,
    /// Capacity for buckets
    #[serde(default)]
    pub burst: u64,
    /// Window length in milliseconds for windows and logs
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_window_ms() -> u64 {
    1000
}

impl PolicyConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The resource checked for this policy.
    pub fn resource(&self) -> Resource {
        Resource::new(self.name.clone())
            .with_limit(self.limit)
            .with_burst(self.burst)
            .with_window(self.window())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LimiterError::Config("policy name must not be empty".to_string()));
        }
        if self.algorithm == Algorithm::TokenBucket && self.backend == Backend::Distributed {
            return Err(LimiterError::Config(format!(
                "policy {}: token bucket has no distributed backend",
                self.name
            )));
        }
        Ok(())
    }
}

impl LimiterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimiterConfig = serde_yaml::from_str(yaml)
            .map_err(|e| LimiterError::Config(format!("Failed to parse limiter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every policy and reject duplicate names.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for policy in &self.policies {
            policy.validate()?;
            if !names.insert(policy.name.as_str()) {
                return Err(LimiterError::Config(format!(
                    "duplicate policy name {}",
                    policy.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a policy by name.
    pub fn policy(&self, name: &str) -> Option<&PolicyConfig> {
        self.policies.iter().find(|policy| policy.name == name)
    }

    /// Whether any policy needs the shared store.
    pub fn needs_store(&self) -> bool {
        self.policies
            .iter()
            .any(|policy| policy.backend == Backend::Distributed)
    }
}
