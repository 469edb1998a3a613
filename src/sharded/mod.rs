//! Entry point of the crate: a pool of connections spread over N shards.
//!
//! A [`ShardedPool`] owns the [`Ring`] and one [`ShardPool`] per shard, both built from the same
//! ordered shard list so that the shard index means the same thing everywhere. Callers
//! [`ShardedPool::acquire`] a [`ShardedHandle`], run commands through it (routed by key) and give
//! it back with [`ShardedPool::release`].
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use futures::future::join_all;
use tracing::{event, instrument, Level};

use crate::{
    config::Config,
    connection::Factory,
    error::{Error, Result},
    pool::{PoolStats, ShardPool},
    ring::Ring,
};

pub mod handle;
pub mod pipeline;

pub use handle::ShardedHandle;
pub use pipeline::Pipeline;

#[derive(Debug)]
struct Inner {
    ring: Ring,
    pools: Vec<Arc<ShardPool>>,
    closed: AtomicBool,
}

/// Cheap to clone. Every clone shares the same ring and shard pools.
#[derive(Clone, Debug)]
pub struct ShardedPool {
    inner: Arc<Inner>,
}

impl ShardedPool {
    pub fn new(config: Config, factory: Arc<dyn Factory>) -> Result<Self> {
        config.validate()?;
        let ring = Ring::new(config.shards.clone(), &config.ring)?;

        let pools: Vec<Arc<ShardPool>> = config
            .shards
            .into_iter()
            .enumerate()
            .map(|(index, shard)| {
                Arc::new(ShardPool::new(
                    index,
                    shard,
                    config.pool.clone(),
                    factory.clone(),
                ))
            })
            .collect();

        event!(
            Level::INFO,
            "sharded pool created with {} shards and {} connections per shard",
            pools.len(),
            config.pool.max_total
        );

        Ok(Self {
            inner: Arc::new(Inner {
                ring,
                pools,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Same as [`ShardedPool::new`] with a [`Config`] read from a JSON file
    pub fn from_config_path(path: impl AsRef<Path>, factory: Arc<dyn Factory>) -> Result<Self> {
        Self::new(Config::from_path(path)?, factory)
    }

    /// Creates a new session. Doesn't borrow anything: connections are borrowed lazily
    /// the first time a shard is needed.
    pub fn acquire(&self) -> Result<ShardedHandle> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        Ok(ShardedHandle::new(self.clone()))
    }

    /// Gives back every connection borrowed by the handle and discards its pipeline state
    pub async fn release(&self, mut handle: ShardedHandle) {
        handle.close().await;
    }

    /// Closes every shard pool. Blocked borrowers are woken up with [`Error::PoolClosed`].
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        join_all(self.inner.pools.iter().map(|pool| pool.close())).await;
        event!(Level::INFO, "sharded pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Creates `min_idle` connections on every shard. Returns the first error, if any,
    /// after every shard was attempted.
    pub async fn prepare(&self) -> Result<()> {
        let results = join_all(self.inner.pools.iter().map(|pool| pool.prepare())).await;
        results.into_iter().collect()
    }

    /// One [`PoolStats`] per shard, in shard order
    pub fn stats(&self) -> Vec<PoolStats> {
        self.inner.pools.iter().map(|pool| pool.stats()).collect()
    }

    pub fn ring(&self) -> &Ring {
        &self.inner.ring
    }

    pub(crate) fn shard_pool(&self, shard: usize) -> &Arc<ShardPool> {
        &self.inner.pools[shard]
    }
}
