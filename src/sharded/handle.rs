//! A [`ShardedHandle`] is a session over a [`ShardedPool`].
//!
//! It borrows at most one connection per shard, lazily, and keeps it for the whole session.
//! Commands are routed by key through the ring. A connection that breaks is invalidated and
//! dropped from the session right away, so the next command for the same shard borrows a new one.
use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::{event, instrument, Level};

use crate::{
    cmd::{Command, Reply},
    config::ShardInfo,
    connection::error::Error as ConnectionError,
    error::{Error, Result},
    pool::PooledConnection,
};

use super::{
    pipeline::{Pipeline, PipelineBatch},
    ShardedPool,
};

#[derive(Debug)]
pub struct ShardedHandle {
    sharded: ShardedPool,
    /// Connections borrowed by this session, by shard index
    connections: BTreeMap<usize, PooledConnection>,
    pub(crate) pipeline: Option<PipelineBatch>,
    closed: bool,
}

impl ShardedHandle {
    pub(crate) fn new(sharded: ShardedPool) -> Self {
        Self {
            sharded,
            connections: BTreeMap::new(),
            pipeline: None,
            closed: false,
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed || self.sharded.is_closed() {
            return Err(Error::PoolClosed);
        }

        Ok(())
    }

    /// Index of the shard that owns `key`
    pub fn shard_index_for(&self, key: &[u8]) -> usize {
        self.sharded.ring().resolve(key)
    }

    /// The [`ShardInfo`] of the shard that owns `key`
    pub fn shard_for(&self, key: &[u8]) -> &ShardInfo {
        self.sharded.ring().shard_for(key)
    }

    /// Shard that must execute `command`. Commands without a key can't be routed.
    pub(crate) fn route(&self, command: &Command) -> Result<usize> {
        match command.key() {
            Some(key) => Ok(self.shard_index_for(key)),
            None => Err(Error::Logic {
                reason: format!(
                    "{} has no key to route by. Use `all_shards` to reach every shard",
                    command.name()
                ),
            }),
        }
    }

    /// Removes the session connection for `shard` (borrowing one if needed).
    /// Connections that are known to be broken are replaced.
    pub(crate) async fn take_connection(&mut self, shard: usize) -> Result<PooledConnection> {
        let pool = self.sharded.shard_pool(shard).clone();
        if let Some(connection) = self.connections.remove(&shard) {
            if connection.is_reusable() {
                return Ok(connection);
            }

            event!(
                Level::DEBUG,
                "replacing broken session connection {} to shard {}",
                connection.id(),
                shard
            );
            pool.invalidate(connection).await;
        }

        pool.borrow().await
    }

    pub(crate) fn put_connection(&mut self, connection: PooledConnection) {
        self.connections.insert(connection.shard(), connection);
    }

    /// Routes `command` by its key and executes it on the owning shard.
    ///
    /// A transport failure invalidates the connection and returns [`Error::ShardUnavailable`].
    /// An error reply from the node returns [`Error::Server`] and keeps the connection.
    /// Nothing is retried.
    #[instrument(level = "debug", skip(self, command), fields(command = command.name()))]
    pub async fn execute(&mut self, command: Command) -> Result<Reply> {
        self.ensure_open()?;
        let shard = self.route(&command)?;
        let mut connection = self.take_connection(shard).await?;

        match connection.execute(&command).await {
            Ok(reply) => {
                self.put_connection(connection);
                Ok(reply)
            }
            Err(err) if err.is_transport() => Err(discard(connection, err).await),
            Err(err) => {
                self.put_connection(connection);
                Err(err.into())
            }
        }
    }

    pub async fn get(&mut self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        self.execute(Command::get(key)).await?.into_bulk()
    }

    pub async fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.execute(Command::set(key, value)).await?.into_status()?;
        Ok(())
    }

    pub async fn incr(&mut self, key: impl Into<Bytes>) -> Result<i64> {
        self.execute(Command::incr(key)).await?.into_integer()
    }

    /// Returns true if the key existed
    pub async fn del(&mut self, key: impl Into<Bytes>) -> Result<bool> {
        Ok(self.execute(Command::del(key)).await?.into_integer()? > 0)
    }

    pub async fn exists(&mut self, key: impl Into<Bytes>) -> Result<bool> {
        Ok(self.execute(Command::exists(key)).await?.into_integer()? > 0)
    }

    /// Every shard connection of this session, in shard order, borrowing the missing ones.
    ///
    /// This bypasses routing: it's how keyless commands (`PING`, `DBSIZE`, `FLUSHALL`) reach the
    /// nodes. Connections left with unread replies are not recycled.
    pub async fn all_shards(&mut self) -> Result<Vec<&mut PooledConnection>> {
        self.ensure_open()?;
        for shard in 0..self.sharded.ring().len() {
            let connection = self.take_connection(shard).await?;
            self.put_connection(connection);
        }

        Ok(self.connections.values_mut().collect())
    }

    /// A pipeline over this session. Commands are buffered until [`Pipeline::sync`].
    pub fn pipelined(&mut self) -> Pipeline<'_> {
        Pipeline::new(self)
    }

    /// Discards the commands buffered by [`ShardedHandle::pipelined`] without sending them.
    /// Session connections are kept.
    pub fn reset_state(&mut self) {
        if let Some(batch) = self.pipeline.take() {
            event!(
                Level::DEBUG,
                "discarding pipeline with {} pending commands",
                batch.len()
            );
        }
    }

    /// Gives every session connection back to its pool. Calling it more than once is a noop.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }

        self.closed = true;
        self.reset_state();
        let connections = std::mem::take(&mut self.connections);
        for (_, connection) in connections {
            let pool = connection.pool().clone();
            pool.return_connection(connection).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Invalidates the connection that produced `err` and builds the error to surface
pub(crate) async fn discard(connection: PooledConnection, err: ConnectionError) -> Error {
    let pool = connection.pool().clone();
    event!(
        Level::WARN,
        "connection {} to shard {} broken: {}",
        connection.id(),
        connection.shard(),
        err
    );
    pool.invalidate(connection).await;
    pool.unavailable(err)
}
