//! Stream ingestion for Jarindex: ordering, idempotent apply, reorg
//! rollback and per-stream supervision over the store and source ports.

pub mod config;
pub mod error;
pub mod memory_source;
pub mod pipeline;
pub mod reorg;
pub mod retry;
pub mod supervisor;
pub mod worker;

pub use config::EngineConfig;
pub use error::EngineError;
pub use memory_source::MemoryLogSource;
pub use pipeline::{Applied, Pipeline};
pub use retry::RetryPolicy;
pub use supervisor::{StreamExit, StreamReport, Supervisor};
pub use worker::{Step, StreamWorker};
