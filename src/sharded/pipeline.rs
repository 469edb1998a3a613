//! Pipelining across shards.
//!
//! A [`Pipeline`] buffers commands in the [`PipelineBatch`] of its [`ShardedHandle`]. Each command
//! is appended to the queue of the shard that owns its key and a placeholder `(shard, position)`
//! is recorded in submission order. [`Pipeline::sync`] writes every shard queue in one batch,
//! concurrently, reads exactly as many replies back and uses the placeholders to put the results
//! back in submission order.
//!
//! The batch is a small state machine:
//! ```text
//!  Accumulating --begin_flush--> Flushing --assemble--> Consumed
//! ```
//! [`ShardedHandle::reset_state`] drops the batch in any state.
use std::collections::BTreeMap;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{event, instrument, Level};

use crate::{
    cmd::{Command, Reply},
    connection::{error::Error as ConnectionError, Connection},
    error::{Error, Result},
    pool::PooledConnection,
};

use super::ShardedHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Accumulating,
    Flushing,
    Consumed,
}

#[derive(Debug)]
pub struct PipelineBatch {
    state: BatchState,
    per_shard: BTreeMap<usize, Vec<Command>>,
    /// `(shard, position in the shard queue)` of every command, in submission order
    order: Vec<(usize, usize)>,
}

impl Default for PipelineBatch {
    fn default() -> Self {
        Self {
            state: BatchState::Accumulating,
            per_shard: BTreeMap::new(),
            order: Vec::new(),
        }
    }
}

impl PipelineBatch {
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Number of commands enqueued
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn illegal_transition(&self, operation: &str) -> Error {
        Error::Logic {
            reason: format!("can't {} a pipeline batch in state {:?}", operation, self.state),
        }
    }

    pub fn enqueue(&mut self, shard: usize, command: Command) -> Result<()> {
        if self.state != BatchState::Accumulating {
            return Err(self.illegal_transition("enqueue on"));
        }

        let queue = self.per_shard.entry(shard).or_default();
        self.order.push((shard, queue.len()));
        queue.push(command);
        Ok(())
    }

    /// Moves to [`BatchState::Flushing`] and hands out the per shard queues
    pub fn begin_flush(&mut self) -> Result<BTreeMap<usize, Vec<Command>>> {
        if self.state != BatchState::Accumulating {
            return Err(self.illegal_transition("flush"));
        }

        self.state = BatchState::Flushing;
        Ok(std::mem::take(&mut self.per_shard))
    }

    /// Moves to [`BatchState::Consumed`] and reorders the per shard outcomes in submission order.
    /// Every shard that had commands must have exactly one outcome per command.
    pub fn assemble(
        &mut self,
        outcomes: BTreeMap<usize, Vec<Result<Reply>>>,
    ) -> Result<Vec<Result<Reply>>> {
        if self.state != BatchState::Flushing {
            return Err(self.illegal_transition("assemble"));
        }
        self.state = BatchState::Consumed;

        let mut outcomes: BTreeMap<usize, std::vec::IntoIter<Result<Reply>>> = outcomes
            .into_iter()
            .map(|(shard, results)| (shard, results.into_iter()))
            .collect();

        let mut results = Vec::with_capacity(self.order.len());
        for (shard, position) in self.order.iter() {
            // positions are handed out in increasing order per shard, so the next outcome of
            // the shard is the one for this placeholder
            let result = outcomes
                .get_mut(shard)
                .and_then(|shard_outcomes| shard_outcomes.next())
                .ok_or_else(|| Error::Logic {
                    reason: format!(
                        "missing outcome for command {} of shard {}",
                        position, shard
                    ),
                })?;
            results.push(result);
        }

        Ok(results)
    }
}

/// Pipelined view over a [`ShardedHandle`]. Obtained through [`ShardedHandle::pipelined`].
pub struct Pipeline<'a> {
    handle: &'a mut ShardedHandle,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(handle: &'a mut ShardedHandle) -> Self {
        Self { handle }
    }

    /// Buffers `command` for the shard that owns its key. Starts a new batch if needed.
    pub fn enqueue(&mut self, command: Command) -> Result<()> {
        self.handle.ensure_open()?;
        let shard = self.handle.route(&command)?;
        self.handle
            .pipeline
            .get_or_insert_with(PipelineBatch::default)
            .enqueue(shard, command)
    }

    pub fn get(&mut self, key: impl Into<Bytes>) -> Result<()> {
        self.enqueue(Command::get(key))
    }

    pub fn set(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        self.enqueue(Command::set(key, value))
    }

    pub fn incr(&mut self, key: impl Into<Bytes>) -> Result<()> {
        self.enqueue(Command::incr(key))
    }

    pub fn del(&mut self, key: impl Into<Bytes>) -> Result<()> {
        self.enqueue(Command::del(key))
    }

    pub fn exists(&mut self, key: impl Into<Bytes>) -> Result<()> {
        self.enqueue(Command::exists(key))
    }

    /// Commands buffered since the last sync or reset
    pub fn len(&self) -> usize {
        self.handle.pipeline.as_ref().map_or(0, |batch| batch.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends every buffered command and returns one result per command, in submission order.
    ///
    /// Shards are flushed concurrently. If a shard can't be reached, or its connection breaks
    /// halfway, the commands of that shard without a reply fail with [`Error::ShardUnavailable`]
    /// while the other shards' results are returned intact. Error replies from a node only fail
    /// their own command. The outer `Result` fails for handle level problems only.
    #[instrument(level = "debug", skip(self), fields(commands = self.len()))]
    pub async fn sync(&mut self) -> Result<Vec<Result<Reply>>> {
        self.handle.ensure_open()?;
        let mut batch = match self.handle.pipeline.take() {
            Some(batch) => batch,
            None => return Ok(Vec::new()),
        };
        let per_shard = batch.begin_flush()?;

        let mut outcomes = BTreeMap::new();
        let mut flushes = Vec::with_capacity(per_shard.len());
        for (shard, commands) in per_shard {
            match self.handle.take_connection(shard).await {
                Ok(connection) => flushes.push(flush_shard(connection, commands)),
                Err(err) => {
                    event!(
                        Level::WARN,
                        "unable to borrow a connection for shard {}: {}",
                        shard,
                        err
                    );
                    outcomes.insert(shard, commands.iter().map(|_| Err(err.clone())).collect());
                }
            }
        }

        for flushed in join_all(flushes).await {
            let FlushedShard {
                connection,
                expected,
                mut results,
                broken,
            } = flushed;
            let shard = connection.shard();

            match broken {
                Some(err) => {
                    let unavailable = super::handle::discard(connection, err).await;
                    results.resize_with(expected, || Err(unavailable.clone()));
                }
                None => self.handle.put_connection(connection),
            }
            outcomes.insert(shard, results);
        }

        batch.assemble(outcomes)
    }
}

struct FlushedShard {
    connection: PooledConnection,
    /// Number of commands sent to the shard
    expected: usize,
    results: Vec<Result<Reply>>,
    /// Set when the connection broke. `results` only holds the replies read before that.
    broken: Option<ConnectionError>,
}

/// One batch write followed by one reply read per command
async fn flush_shard(mut connection: PooledConnection, commands: Vec<Command>) -> FlushedShard {
    let expected = commands.len();
    let mut results = Vec::with_capacity(expected);

    if let Err(err) = connection.write_commands(&commands).await {
        return FlushedShard {
            connection,
            expected,
            results,
            broken: Some(err),
        };
    }

    for _ in 0..expected {
        match connection.read_reply().await {
            Ok(reply) => results.push(Ok(reply)),
            Err(err) if err.is_transport() => {
                return FlushedShard {
                    connection,
                    expected,
                    results,
                    broken: Some(err),
                }
            }
            Err(err) => results.push(Err(err.into())),
        }
    }

    FlushedShard {
        connection,
        expected,
        results,
        broken: None,
    }
}
