//! Store ports shared by the in-memory and PostgreSQL backends.

use std::collections::BTreeSet;

use async_trait::async_trait;
use jarindex_core::{DecodedEvent, EventKey, StreamId};
use thiserror::Error;

use crate::models::*;
use crate::mutation::{CommitResult, EventOutcome, PurgeScope, Row, RowKey, WriteSet};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection refused, pool exhausted, timeout. Safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A row read by the write set changed before the commit. Re-read and re-project.
    #[error("write conflict: {0}")]
    Conflict(String),

    #[error("query failed: {0}")]
    Query(String),

    /// Stored data could not be decoded back into a model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code().as_deref() {
                // serialization_failure, deadlock_detected, unique_violation
                Some("40001") | Some("40P01") | Some("23505") => Self::Conflict(db.to_string()),
                _ => Self::Query(err.to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Self::Corrupt(err.to_string())
            }
            _ => Self::Query(err.to_string()),
        }
    }
}

/// Per-stream ingestion progress. Each stream's cursor has exactly one writer.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn cursor(&self, stream: &StreamId) -> Result<Option<Cursor>, StoreError>;

    /// Write `cursor` and record `block` for reorg walk-back, in one transaction.
    async fn advance(&self, cursor: &Cursor, block: &IndexedBlock) -> Result<(), StoreError>;

    /// Recorded blocks of `stream` in `[from, to]`, highest first.
    async fn indexed_blocks(
        &self,
        stream: &StreamId,
        from: u64,
        to: u64,
    ) -> Result<Vec<IndexedBlock>, StoreError>;

    /// Move the cursor back to `ancestor` (or remove it when `None`) and
    /// forget recorded blocks above it.
    async fn rewind(&self, stream: &StreamId, ancestor: Option<&Cursor>) -> Result<(), StoreError>;
}

/// Materialized aggregates plus the raw event log and idempotency index.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn get(&self, key: &RowKey) -> Result<Option<Row>, StoreError>;

    /// Number of tokens in `(collection, chain_id)` minted to `address`.
    async fn minted_count(&self, holder: &HolderKey) -> Result<u64, StoreError>;

    /// Timestamp of the newest transfer record in `(collection, chain_id)`
    /// sent or received by `address`.
    async fn last_transfer_time(&self, holder: &HolderKey) -> Result<Option<i64>, StoreError>;

    async fn is_applied(&self, key: &EventKey) -> Result<bool, StoreError>;

    /// Atomically: check the idempotency key, verify the write set's reads,
    /// apply its mutations (or record the skip), mark the key applied and
    /// append the event to the raw log.
    async fn commit_event(
        &self,
        event: &DecodedEvent,
        outcome: &EventOutcome,
    ) -> Result<CommitResult, StoreError>;

    /// Apply a write set that is not tied to an event (reconciliation).
    async fn commit(&self, write: &WriteSet) -> Result<(), StoreError>;

    /// Retained raw events of `stream` in `(block_number, log_index)` order.
    async fn raw_events(&self, stream: &StreamId) -> Result<Vec<DecodedEvent>, StoreError>;

    /// Drop raw events above `after_block` (all when `None`) and every
    /// idempotency key and dead-letter row of the stream. Returns the number
    /// of raw events removed.
    async fn truncate_stream(
        &self,
        stream: &StreamId,
        after_block: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Delete the aggregate family in `scope`. Returns the addresses whose
    /// cross-chain balances referenced the deleted rows.
    async fn purge(&self, scope: &PurgeScope) -> Result<BTreeSet<String>, StoreError>;

    /// Clear aggregates, raw log, idempotency index, dead letters, cursors
    /// and recorded blocks together.
    async fn reset(&self) -> Result<(), StoreError>;

    // ── Range queries ───────────────────────────────────────────────────

    async fn top_holders(
        &self,
        collection: &str,
        chain_id: u64,
        limit: usize,
    ) -> Result<Vec<Holder>, StoreError>;

    async fn top_user_balances(
        &self,
        generation: u8,
        limit: usize,
    ) -> Result<Vec<UserBalance>, StoreError>;

    /// Newest first. `chain_id = None` spans every chain of the collection.
    async fn recent_transfers(
        &self,
        collection: &str,
        chain_id: Option<u64>,
        mints_only: bool,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError>;

    /// Newest first.
    async fn vault_activity(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<VaultActivity>, StoreError>;

    async fn skipped_events(&self, stream: &StreamId) -> Result<Vec<SkippedEvent>, StoreError>;
}
