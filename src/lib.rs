#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod codec;
mod config;
mod error;
mod executor;
mod fingerprint;
mod future;
mod graph;
mod hash;
mod plugin;
mod rule;
mod session;
mod task;
mod value;

pub use crate::cache::Cache;
pub use crate::config::Config;
pub use crate::error::{CodecError, Error, StoreError, ValueError};
pub use crate::fingerprint::fingerprint;
pub use crate::future::State;
pub use crate::graph::Fut;
pub use crate::hash::{Hash, ParseHashError};
pub use crate::plugin::{Event, Plugin, TaskView};
pub use crate::rule::Rule;
pub use crate::session::{IntoDemand, Session, SessionBuilder, TaskCtx};
pub use crate::value::{ToValue, Value};

/// Route `tracing` output to stderr, honouring `RUST_LOG`.
///
/// Entirely optional; embedders with their own subscriber should skip this.
pub fn init_logging() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .with(filter)
        .try_init()
}
