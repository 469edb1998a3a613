//! Configuration surface consumed by [`crate::sharded::ShardedPool`].
//!
//! Everything is (de)serializable so a whole deployment can be described by a single JSON file:
//! the ordered shard list, pool tuning (applied to every shard pool) and ring tuning.
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default number of virtual nodes contributed by a shard of weight 1
pub const DEFAULT_REPLICATION_FACTOR: u32 = 160;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub shards: Vec<ShardInfo>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub ring: RingConfig,
}

impl Config {
    pub fn new(shards: Vec<ShardInfo>) -> Self {
        Self {
            shards,
            pool: PoolConfig::default(),
            ring: RingConfig::default(),
        }
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_ring(mut self, ring: RingConfig) -> Self {
        self.ring = ring;
        self
    }

    /// Reads and parses a JSON config file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let stringified = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&stringified)?)
    }

    /// Rejects configurations that can't produce a working [`crate::sharded::ShardedPool`].
    ///
    /// Shard level checks (empty list, weights, names) are performed by [`crate::ring::Ring::new`].
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_total == 0 {
            return Err(Error::Configuration {
                reason: "pool.max_total must be greater than 0".to_string(),
            });
        }

        if self.pool.max_total > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(Error::Configuration {
                reason: format!(
                    "pool.max_total ({}) can't be greater than {}",
                    self.pool.max_total,
                    tokio::sync::Semaphore::MAX_PERMITS
                ),
            });
        }

        if self.pool.min_idle > self.pool.max_total {
            return Err(Error::Configuration {
                reason: format!(
                    "pool.min_idle ({}) can't be greater than pool.max_total ({})",
                    self.pool.min_idle, self.pool.max_total
                ),
            });
        }

        Ok(())
    }
}

/// Identity of one backend node. Identity is positional: the index of a [`ShardInfo`]
/// in [`Config::shards`] is the shard index used everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ShardInfo {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Optional shard name. When set, virtual nodes are derived from it instead of
    /// the shard position, which keeps the ring stable if shards are reordered.
    /// Names must be unique across shards, duplicates are rejected with
    /// [`Error::Configuration`] when the ring is built.
    #[serde(default)]
    pub name: Option<String>,
}

fn default_weight() -> u32 {
    1
}

impl ShardInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            weight: default_weight(),
            name: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct PoolConfig {
    /// Maximum outstanding connections (idle + borrowed) per shard
    pub max_total: usize,
    /// Maximum idle connections kept per shard. Extra connections are destroyed on return.
    pub max_idle: usize,
    /// Idle connections created upfront by [`crate::sharded::ShardedPool::prepare`]
    pub min_idle: usize,
    /// Upper bound for a blocked borrow. `None` waits forever.
    pub max_wait_millis: Option<u64>,
    pub block_when_exhausted: bool,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    /// Bound for the liveness probe used by validation
    pub validation_timeout_millis: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: 8,
            max_idle: 8,
            min_idle: 0,
            max_wait_millis: None,
            block_when_exhausted: true,
            test_on_borrow: false,
            test_on_return: false,
            validation_timeout_millis: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct RingConfig {
    /// Virtual nodes per unit of weight
    pub replication_factor: u32,
    /// Route keys like `user:{42}:name` by the text between braces
    pub hash_tags: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            hash_tags: false,
        }
    }
}
