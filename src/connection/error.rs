use serde::{Deserialize, Serialize};

/// Concrete type for a [`crate::connection::Connection`] error
pub type Result<T> = std::result::Result<T, Error>;

/// Enum that represents a [`crate::connection::Connection`] error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// Variant returned when a connection was unable to reach its node
    UnableToConnect { reason: String },
    /// The node refused the provided credentials
    AuthenticationFailed { reason: String },
    /// A command was issued on a connection that isn't connected
    NotConnected,
    /// Generic IO error (automatically converted from [`std::io::Error`])
    Io { reason: String },
    /// The byte stream doesn't make sense anymore (eg: reading a reply that was never requested)
    Protocol { reason: String },
    /// Error reply sent by the node for a single command. The connection remains usable.
    Server { reason: String },
    /// Tells the user of the Connection that it did something wrong (like calling connect twice)
    Logic { reason: String },
}

impl Error {
    /// Transport errors mean the connection is broken and must not be reused
    pub fn is_transport(&self) -> bool {
        !matches!(self, Error::Server { .. } | Error::Logic { .. })
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            reason: value.to_string(),
        }
    }
}
