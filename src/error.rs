use std::sync::Arc;

use thiserror::Error;

use crate::hash::Hash;
use crate::plugin::Event;

/// Errors raised while canonicalising or substituting values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValueError {
    #[error("value cannot be canonicalised: {0}")]
    Unsupported(String),

    #[error("embedded future {} is not resolvable here", .0.tag())]
    UnresolvedRef(Hash),
}

/// Errors from the versioned binary encoding of cache blobs.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode cache blob: {0}")]
    Encode(String),

    #[error("failed to decode cache blob: {0}")]
    Decode(String),

    #[error("unsupported cache blob format version {0}")]
    Version(u64),
}

/// Errors from the durable store underneath the persistent cache.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Every failure the session can surface to a caller of [`run`].
///
/// Errors are stored on futures and fanned out to every waiter, hence the
/// `Arc`-wrapped sources.
///
/// [`run`]: crate::Session::run
#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("a session is already open on this thread")]
    NestedSession,

    #[error("no runnable tasks left while {pending} tasks are still pending")]
    Deadlock { pending: usize },

    #[error("rule invocation '{label}' failed")]
    RuleFailure {
        label: String,
        #[source]
        source: Arc<anyhow::Error>,
    },

    #[error("dependency '{dep}' of '{label}' failed")]
    DependencyFailed {
        label: String,
        dep: String,
        #[source]
        source: Arc<Error>,
    },

    #[error("cache entry for {} conflicts with rule '{rule}'", .fingerprint.tag())]
    CacheConflict { fingerprint: Hash, rule: String },

    #[error("task '{label}' exceeded its {budget_ms} ms budget")]
    Timeout { label: String, budget_ms: u64 },

    #[error("cancelled by session close")]
    Cancelled,

    #[error("plugin '{plugin}' aborted while handling {event}")]
    PluginError {
        plugin: String,
        event: Event,
        #[source]
        source: Arc<anyhow::Error>,
    },

    #[error("cache store failure")]
    Store(#[source] Arc<StoreError>),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(Arc::new(err))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Store(Arc::new(StoreError::Sqlite(err)))
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Error::Store(Arc::new(StoreError::Codec(err)))
    }
}
