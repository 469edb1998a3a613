//! The decoded reply of a single [`super::Command`].
//!
//! Error replies never show up here: a [`crate::connection::Connection`] turns them into
//! [`crate::connection::error::Error::Server`] so that they travel through the `Err` side.
use bytes::Bytes;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple status reply, eg: `OK` or `PONG`
    Status(String),
    Integer(i64),
    /// `None` means the key doesn't exist
    Bulk(Option<Bytes>),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn into_status(self) -> Result<String> {
        match self {
            Reply::Status(status) => Ok(status),
            other => Err(unexpected("status", &other)),
        }
    }

    pub fn into_integer(self) -> Result<i64> {
        match self {
            Reply::Integer(value) => Ok(value),
            other => Err(unexpected("integer", &other)),
        }
    }

    pub fn into_bulk(self) -> Result<Option<Bytes>> {
        match self {
            Reply::Bulk(value) => Ok(value),
            other => Err(unexpected("bulk", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &Reply) -> Error {
    Error::UnexpectedReply {
        reason: format!("expected {} reply, got {:?}", expected, got),
    }
}
