//! This module defines the caller visible errors returned by shardpool.
//!
//! Connection level faults are modeled by [`crate::connection::error::Error`] and are
//! mostly recovered inside the pools. What reaches a caller is one of the variants below.

use std::fmt::Display;

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// Error enum with all possible variants
#[derive(Debug, Clone, Serialize)]
pub enum Error {
    /// Invalid shard list or tuning. Fatal at construction time.
    Configuration { reason: String },
    /// No connection could be handed out for `shard` within the exhaustion policy.
    /// `waited_ms` is `None` when the pool fails fast instead of blocking.
    PoolExhausted { shard: usize, waited_ms: Option<u64> },
    /// The pool (or the handle) was closed
    PoolClosed,
    /// A connection failed validation and no valid replacement could be produced
    ConnectionInvalid { shard: usize, reason: String },
    /// The node behind `shard` could not serve the operation
    ShardUnavailable {
        shard: usize,
        addr: String,
        reason: String,
    },
    /// The node answered with an error reply
    Server { reason: String },
    /// The reply type doesn't match what the command returns
    UnexpectedReply { reason: String },
    /// The caller did something wrong (eg: routing a command that has no key)
    Logic { reason: String },
    /// A connection error that doesn't fit the other variants
    Connection(crate::connection::error::Error),
    /// Generic IO error (automatically converted from [`std::io::Error`])
    Io { reason: String },
    /// The configuration file couldn't be parsed
    InvalidConfig { reason: String },
}

impl Error {
    /// Returns true if this is an instance of a [`Error::ShardUnavailable`] variant
    pub fn is_shard_unavailable(&self) -> bool {
        matches!(self, Error::ShardUnavailable { .. })
    }

    /// Returns true if this is an instance of a [`Error::PoolExhausted`] variant
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig {
            reason: err.to_string(),
        }
    }
}

impl From<crate::connection::error::Error> for Error {
    fn from(err: crate::connection::error::Error) -> Self {
        match err {
            crate::connection::error::Error::Server { reason } => Self::Server { reason },
            _ => Self::Connection(err),
        }
    }
}
