//! Reorg detection and rollback.
//!
//! A stream is `Synced` while the canonical header above its cursor names the
//! cursor block as parent. When it does not, the roller walks the recorded
//! blocks of the stream backwards until one matches the canonical chain,
//! then rebuilds the stream's aggregates from the raw events it retained up
//! to that ancestor. Nothing is ever patched in reverse.

use std::sync::Arc;

use chrono::Utc;
use jarindex_core::{BlockHeader, ContractBinding, LogSource};
use jarindex_storage::models::{Cursor, IndexedBlock};
use jarindex_storage::{AggregateStore, CursorStore};
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pipeline::Pipeline;
use crate::retry::with_retry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    Synced,
    /// The block above `cursor` does not extend it.
    ReorgDetected { cursor: Cursor, next: BlockHeader },
}

/// Compare the canonical header above the cursor with the cursor itself.
pub fn check(cursor: &Cursor, next: &BlockHeader) -> SyncState {
    if next.number == cursor.block_number + 1 && next.parent_hash == cursor.block_hash {
        SyncState::Synced
    } else {
        SyncState::ReorgDetected {
            cursor: cursor.clone(),
            next: next.clone(),
        }
    }
}

pub struct Roller<'a, S, L> {
    store: &'a Arc<S>,
    source: &'a Arc<L>,
    pipeline: &'a Pipeline<S>,
    binding: &'a ContractBinding,
    config: &'a EngineConfig,
}

impl<'a, S, L> Roller<'a, S, L>
where
    S: AggregateStore + CursorStore,
    L: LogSource,
{
    pub fn new(
        store: &'a Arc<S>,
        source: &'a Arc<L>,
        pipeline: &'a Pipeline<S>,
        binding: &'a ContractBinding,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            store,
            source,
            pipeline,
            binding,
            config,
        }
    }

    /// Newest recorded block of the stream that is still canonical.
    ///
    /// `Ok(None)` means no recorded block survives and the stream must be
    /// rebuilt from its start block.
    pub async fn find_ancestor(&self, cursor: &Cursor) -> Result<Option<Cursor>, EngineError> {
        let stream = self.binding.stream();
        let chain_id = self.binding.chain_id();
        let max_depth = self.binding.chain.max_reorg_depth;
        let floor = cursor.block_number.saturating_sub(max_depth);

        let store = self.store;
        let recorded = with_retry(&self.config.retry, "indexed_blocks", || {
            store.indexed_blocks(&stream, floor, cursor.block_number)
        })
        .await?;

        for block in recorded {
            let canonical = with_retry(&self.config.retry, "header", || {
                self.source.header(chain_id, block.block_number)
            })
            .await?;
            if canonical.is_some_and(|h| h.hash == block.block_hash) {
                return Ok(Some(Cursor {
                    stream: stream.clone(),
                    block_number: block.block_number,
                    block_hash: block.block_hash,
                    log_index: None,
                    updated_at: Utc::now(),
                }));
            }
        }

        if floor > self.binding.contract.start_block {
            return Err(EngineError::ReorgTooDeep {
                stream,
                block: cursor.block_number,
                max_depth,
            });
        }
        Ok(None)
    }

    /// Rebuild the stream as of `ancestor` and move the cursor there.
    ///
    /// Every step is repeatable: until the final rewind the cursor still points
    /// at the orphaned block, so a crash mid-way is detected and rolled back
    /// again on restart.
    pub async fn rollback(&self, ancestor: Option<Cursor>) -> Result<(), EngineError> {
        let stream = self.binding.stream();
        let store = self.store;
        let retry = &self.config.retry;
        let after = ancestor.as_ref().map(|c| c.block_number);

        let dropped =
            with_retry(retry, "truncate_stream", || store.truncate_stream(&stream, after)).await?;

        let scope = self.pipeline.projector().purge_scope();
        let touched = with_retry(retry, "purge", || store.purge(&scope)).await?;

        let retained = with_retry(retry, "raw_events", || store.raw_events(&stream)).await?;
        let replayed = retained.len();
        for event in &retained {
            self.pipeline.apply(event).await?;
        }

        self.pipeline.rebuild_balances(&touched).await?;

        with_retry(retry, "rewind", || store.rewind(&stream, ancestor.as_ref())).await?;

        info!(
            %stream,
            ancestor = ?after,
            dropped,
            replayed,
            "Rolled back to common ancestor"
        );
        Ok(())
    }

    /// Handle a detected reorg end to end.
    pub async fn recover(&self, cursor: &Cursor, next: &BlockHeader) -> Result<(), EngineError> {
        warn!(
            stream = %self.binding.stream(),
            block = cursor.block_number,
            expected_parent = %cursor.block_hash,
            actual_parent = %next.parent_hash,
            "Reorg detected"
        );
        let ancestor = self.find_ancestor(cursor).await?;
        self.rollback(ancestor).await
    }
}

/// The block record written alongside a cursor.
pub fn indexed_block(cursor: &Cursor, parent_hash: &str, timestamp: i64) -> IndexedBlock {
    IndexedBlock {
        stream: cursor.stream.clone(),
        block_number: cursor.block_number,
        block_hash: cursor.block_hash.clone(),
        parent_hash: parent_hash.to_string(),
        timestamp,
    }
}
