//! Subscriber setup for binaries embedding shardpool. The library itself only emits events.
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry};

pub const SERVICE_NAME: &str = "shardpool";

/// Filter taken from `RUST_LOG`, `info` when unset
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber: bunyan formatted JSON lines when `json` is set,
/// human readable lines otherwise. Must be called once.
pub fn initialize_subscriber(json: bool) {
    if json {
        Registry::default()
            .with(env_filter())
            .with(JsonStorageLayer)
            .with(BunyanFormattingLayer::new(
                SERVICE_NAME.to_string(),
                std::io::stdout,
            ))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .init();
    }
}
