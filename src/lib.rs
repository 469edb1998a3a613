pub mod cmd;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod ring;
pub mod sharded;
pub mod telemetry;
pub mod test_utils;

pub use sharded::{ShardedHandle, ShardedPool};

#[cfg(test)]
extern crate quickcheck;
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;
