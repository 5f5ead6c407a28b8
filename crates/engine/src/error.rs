use jarindex_core::{ConfigError, EventKey, SourceError, StreamId};
use jarindex_projection::ProjectionError;
use jarindex_storage::StoreError;
use thiserror::Error;

/// Errors that end a pass of a stream worker.
///
/// Transient store and source failures only surface here once their retry
/// budget is spent, and the worker pauses on them instead of stopping.
/// Invariant violations never do: they become skipped events.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("log source error: {0}")]
    Source(#[from] SourceError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("projection of {event} failed: {source}")]
    Projection {
        event: EventKey,
        #[source]
        source: ProjectionError,
    },

    #[error("rebuilding the balance of {address} failed: {source}")]
    Rebuild {
        address: String,
        #[source]
        source: ProjectionError,
    },

    #[error("{event} still conflicted after {attempts} attempts")]
    ConflictsExhausted { event: EventKey, attempts: u32 },

    #[error("{stream}: reorg at block {block} is deeper than {max_depth} blocks")]
    ReorgTooDeep {
        stream: StreamId,
        block: u64,
        max_depth: u64,
    },
}

impl EngineError {
    /// Whether the stream may be resumed after a pause.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::Source(err) => err.is_transient(),
            Self::ConflictsExhausted { .. } => true,
            _ => false,
        }
    }
}
