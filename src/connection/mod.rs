//! Module that contains the single node [`Connection`] capability consumed by the pools.
//!
//! shardpool doesn't own a wire protocol. Whoever embeds it provides a [`Factory`] that knows
//! how to build connections for a [`ShardInfo`]; the pools take care of connecting,
//! authenticating, validating and recycling them.
use async_trait::async_trait;

use crate::cmd::{Command, Reply};
use crate::config::ShardInfo;

pub mod error;
pub mod mock;

use error::Result;

/// Trait that defines what a single node connection needs to implement
///
/// Requests and replies are strictly ordered: the n-th call to [`Connection::read_reply`]
/// returns the reply to the n-th command written since the connection was established.
/// Error replies from the node must be returned as [`error::Error::Server`] so the stream
/// stays usable; every other error variant means the connection can't be trusted anymore.
#[async_trait]
pub trait Connection: Send {
    /// Establishes the underlying channel with the node
    async fn connect(&mut self) -> Result<()>;
    /// Authenticates an already connected channel
    async fn authenticate(&mut self, password: &str) -> Result<()>;
    /// Writes all commands as a single batch, without waiting for replies
    async fn write_commands(&mut self, commands: &[Command]) -> Result<()>;
    /// Reads the next pending reply
    async fn read_reply(&mut self) -> Result<Reply>;
    /// Lightweight round-trip used as liveness probe
    async fn ping(&mut self) -> Result<()>;
    /// Closes the underlying channel. Calling it on a disconnected connection is a noop.
    async fn disconnect(&mut self) -> Result<()>;
    /// Local view of the channel state. Doesn't perform any IO.
    fn is_connected(&self) -> bool;

    /// Synchronous request/reply for a single command
    async fn send_command(&mut self, command: &Command) -> Result<Reply> {
        self.write_commands(std::slice::from_ref(command)).await?;
        self.read_reply().await
    }
}

/// Factory is the abstraction that allows different [`Connection`] implementations to be used by the pools
#[async_trait]
pub trait Factory: Send + Sync {
    /// Builds a connection for the given shard. The returned connection is not connected yet.
    async fn get(&self, shard: &ShardInfo) -> Result<Box<dyn Connection>>;
}
