//! PostgreSQL implementation of the store ports.

use std::collections::BTreeSet;

use async_trait::async_trait;
use jarindex_core::{DecodedEvent, EventKey, StreamId};
use sqlx::PgPool;

use crate::models::*;
use crate::mutation::{CommitResult, EventOutcome, PurgeScope, Row, RowKey, WriteSet};
use crate::repos;
use crate::store::{AggregateStore, CursorStore, StoreError};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[async_trait]
impl CursorStore for PgStore {
    async fn cursor(&self, stream: &StreamId) -> Result<Option<Cursor>, StoreError> {
        repos::get_cursor(&self.pool, stream).await
    }

    async fn advance(&self, cursor: &Cursor, block: &IndexedBlock) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        repos::insert_block(&mut *tx, block).await?;
        repos::set_cursor(&mut *tx, cursor).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn indexed_blocks(
        &self,
        stream: &StreamId,
        from: u64,
        to: u64,
    ) -> Result<Vec<IndexedBlock>, StoreError> {
        repos::get_blocks(&self.pool, stream, from, to).await
    }

    async fn rewind(&self, stream: &StreamId, ancestor: Option<&Cursor>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        match ancestor {
            Some(cursor) => {
                repos::set_cursor(&mut *tx, cursor).await?;
                repos::delete_blocks_after(&mut *tx, stream, Some(cursor.block_number)).await?;
            }
            None => {
                repos::delete_cursor(&mut *tx, stream).await?;
                repos::delete_blocks_after(&mut *tx, stream, None).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for PgStore {
    async fn get(&self, key: &RowKey) -> Result<Option<Row>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        repos::load_row(&mut *conn, key, false).await
    }

    async fn minted_count(&self, holder: &HolderKey) -> Result<u64, StoreError> {
        repos::minted_count(&self.pool, holder).await
    }

    async fn last_transfer_time(&self, holder: &HolderKey) -> Result<Option<i64>, StoreError> {
        repos::last_transfer_time(&self.pool, holder).await
    }

    async fn is_applied(&self, key: &EventKey) -> Result<bool, StoreError> {
        repos::is_applied(&self.pool, key).await
    }

    async fn commit_event(
        &self,
        event: &DecodedEvent,
        outcome: &EventOutcome,
    ) -> Result<CommitResult, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Claiming the key first serializes concurrent deliveries of the same event.
        if !repos::mark_applied(&mut *tx, &event.key(), &event.stream()).await? {
            return Ok(CommitResult::AlreadyApplied);
        }

        match outcome {
            EventOutcome::Applied(write) => repos::apply_write_set(&mut *tx, write).await?,
            EventOutcome::Skipped(skipped) => {
                repos::insert_skipped_event(&mut *tx, skipped).await?
            }
        }
        repos::insert_raw_event(&mut *tx, event).await?;

        tx.commit().await?;
        Ok(CommitResult::Committed)
    }

    async fn commit(&self, write: &WriteSet) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        repos::apply_write_set(&mut *tx, write).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn raw_events(&self, stream: &StreamId) -> Result<Vec<DecodedEvent>, StoreError> {
        repos::get_raw_events(&self.pool, stream).await
    }

    async fn truncate_stream(
        &self,
        stream: &StreamId,
        after_block: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let removed = repos::truncate_stream(&mut *tx, stream, after_block).await?;
        tx.commit().await?;
        tracing::debug!(%stream, after_block, removed, "Truncated raw event log");
        Ok(removed)
    }

    async fn purge(&self, scope: &PurgeScope) -> Result<BTreeSet<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let addresses = repos::purge(&mut *tx, scope).await?;
        tx.commit().await?;
        tracing::debug!(?scope, touched = addresses.len(), "Purged aggregate rows");
        Ok(addresses)
    }

    async fn reset(&self) -> Result<(), StoreError> {
        repos::reset(&self.pool).await
    }

    async fn top_holders(
        &self,
        collection: &str,
        chain_id: u64,
        n: usize,
    ) -> Result<Vec<Holder>, StoreError> {
        repos::get_top_holders(&self.pool, collection, chain_id, limit(n)).await
    }

    async fn top_user_balances(
        &self,
        generation: u8,
        n: usize,
    ) -> Result<Vec<UserBalance>, StoreError> {
        repos::get_top_user_balances(&self.pool, generation, limit(n)).await
    }

    async fn recent_transfers(
        &self,
        collection: &str,
        chain_id: Option<u64>,
        mints_only: bool,
        n: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        repos::get_recent_transfers(&self.pool, collection, chain_id, mints_only, limit(n)).await
    }

    async fn vault_activity(&self, user: &str, n: usize) -> Result<Vec<VaultActivity>, StoreError> {
        repos::get_vault_activity(&self.pool, user, limit(n)).await
    }

    async fn skipped_events(&self, stream: &StreamId) -> Result<Vec<SkippedEvent>, StoreError> {
        repos::get_skipped_events(&self.pool, stream).await
    }
}
