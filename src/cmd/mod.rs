//! Module that contains all commands that can be routed by shardpool.
//!
//! # Design principals
//! Commands have 2 responsibilities:
//!  1. Carry their arguments to a [`crate::connection::Connection`] (which owns the wire encoding)
//!  2. Expose the primary key used to pick the owning shard
//!
//! Everything else should be delegated to the [`crate::sharded`] layer or the connection itself.
pub mod reply;

use bytes::Bytes;
use strum_macros::IntoStaticStr;

pub use reply::Reply;

/// Command definition - this enum contains all commands understood by shardpool.
///
/// Keyed commands are routed through the [`crate::ring::Ring`]. Keyless commands
/// (`PING`, `DBSIZE`, `FLUSHALL`) only make sense against a specific node and have to be
/// issued through [`crate::sharded::ShardedHandle::all_shards`].
#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Command {
    Get { key: Bytes },
    Set { key: Bytes, value: Bytes },
    Incr { key: Bytes },
    Del { key: Bytes },
    Exists { key: Bytes },
    Ping,
    DbSize,
    FlushAll,
}

impl Command {
    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::Get { key: key.into() }
    }

    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn incr(key: impl Into<Bytes>) -> Self {
        Self::Incr { key: key.into() }
    }

    pub fn del(key: impl Into<Bytes>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn exists(key: impl Into<Bytes>) -> Self {
        Self::Exists { key: key.into() }
    }

    /// The primary key argument of this command, used as the routing key
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Command::Get { key }
            | Command::Set { key, .. }
            | Command::Incr { key }
            | Command::Del { key }
            | Command::Exists { key } => Some(key),
            Command::Ping | Command::DbSize | Command::FlushAll => None,
        }
    }

    /// Upper case command name, eg: `INCR`
    pub fn name(&self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::Command;
    use bytes::Bytes;

    #[test]
    fn keyed_commands_expose_their_key() {
        let key = Bytes::from("foo");
        let commands = vec![
            Command::get(key.clone()),
            Command::set(key.clone(), "bar"),
            Command::incr(key.clone()),
            Command::del(key.clone()),
            Command::exists(key.clone()),
        ];

        for command in commands {
            assert_eq!(command.key(), Some(&key));
        }
    }

    #[test]
    fn keyless_commands() {
        assert!(Command::Ping.key().is_none());
        assert!(Command::DbSize.key().is_none());
        assert!(Command::FlushAll.key().is_none());
    }

    #[test]
    fn command_names() {
        assert_eq!(Command::incr("x").name(), "INCR");
        assert_eq!(Command::DbSize.name(), "DBSIZE");
        assert_eq!(Command::FlushAll.name(), "FLUSHALL");
    }
}
