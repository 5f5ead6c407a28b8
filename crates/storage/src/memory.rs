//! In-memory store for tests and ephemeral runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use jarindex_core::{DecodedEvent, EventKey, StreamId};

use crate::models::*;
use crate::mutation::{
    CommitResult, EventOutcome, Mutation, MutationOp, PurgeScope, Row, RowKey, WriteSet,
};
use crate::store::{AggregateStore, CursorStore, StoreError};

#[derive(Default)]
struct State {
    rows: BTreeMap<RowKey, Row>,
    applied: HashMap<EventKey, StreamId>,
    raw: BTreeMap<StreamId, BTreeMap<(u64, u32), DecodedEvent>>,
    skipped: BTreeMap<StreamId, Vec<SkippedEvent>>,
    cursors: HashMap<StreamId, Cursor>,
    blocks: BTreeMap<StreamId, BTreeMap<u64, IndexedBlock>>,
}

impl State {
    /// Validate the whole write set before touching anything.
    fn check(&self, write: &WriteSet) -> Result<(), StoreError> {
        for (key, expected) in &write.reads {
            if self.rows.get(key) != expected.as_ref() {
                return Err(StoreError::Conflict(format!(
                    "{} row changed since read",
                    key.entity()
                )));
            }
        }
        for m in &write.mutations {
            let key = m.key();
            let exists = self.rows.contains_key(&key);
            let ok = match m.op {
                MutationOp::Create => !exists,
                MutationOp::Update | MutationOp::Delete => exists,
            };
            if !ok {
                return Err(StoreError::Conflict(format!(
                    "{:?} on {} row that {}",
                    m.op,
                    key.entity(),
                    if exists { "already exists" } else { "does not exist" }
                )));
            }
        }
        Ok(())
    }

    fn apply(&mut self, mutations: &[Mutation]) {
        for m in mutations {
            match m.op {
                MutationOp::Create | MutationOp::Update => {
                    self.rows.insert(m.key(), m.row.clone());
                }
                MutationOp::Delete => {
                    self.rows.remove(&m.key());
                }
            }
        }
    }
}

/// Thread-safe in-memory implementation of both store ports.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Every aggregate row, ordered by key.
    pub fn dump(&self) -> Result<BTreeMap<RowKey, Row>, StoreError> {
        Ok(self.lock()?.rows.clone())
    }

    fn rows_of<T>(&self, pick: impl Fn(&Row) -> Option<T>) -> Result<Vec<T>, StoreError> {
        Ok(self.lock()?.rows.values().filter_map(pick).collect())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn cursor(&self, stream: &StreamId) -> Result<Option<Cursor>, StoreError> {
        Ok(self.lock()?.cursors.get(stream).cloned())
    }

    async fn advance(&self, cursor: &Cursor, block: &IndexedBlock) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.cursors.insert(cursor.stream.clone(), cursor.clone());
        state
            .blocks
            .entry(block.stream.clone())
            .or_default()
            .insert(block.block_number, block.clone());
        Ok(())
    }

    async fn indexed_blocks(
        &self,
        stream: &StreamId,
        from: u64,
        to: u64,
    ) -> Result<Vec<IndexedBlock>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .blocks
            .get(stream)
            .map(|blocks| blocks.range(from..=to).rev().map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    async fn rewind(&self, stream: &StreamId, ancestor: Option<&Cursor>) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        match ancestor {
            Some(cursor) => {
                state.cursors.insert(stream.clone(), cursor.clone());
                if let Some(blocks) = state.blocks.get_mut(stream) {
                    blocks.retain(|n, _| *n <= cursor.block_number);
                }
            }
            None => {
                state.cursors.remove(stream);
                state.blocks.remove(stream);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn get(&self, key: &RowKey) -> Result<Option<Row>, StoreError> {
        Ok(self.lock()?.rows.get(key).cloned())
    }

    async fn minted_count(&self, holder: &HolderKey) -> Result<u64, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rows
            .values()
            .filter(|row| match row {
                Row::Token(t) => {
                    t.collection == holder.collection
                        && t.chain_id == holder.chain_id
                        && t.minted_by == holder.address
                }
                _ => false,
            })
            .count() as u64)
    }

    async fn last_transfer_time(&self, holder: &HolderKey) -> Result<Option<i64>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rows
            .values()
            .filter_map(|row| match row {
                Row::TransferRecord(r)
                    if r.collection == holder.collection
                        && r.chain_id == holder.chain_id
                        && (r.from == holder.address || r.to == holder.address) =>
                {
                    Some(r.timestamp)
                }
                _ => None,
            })
            .max())
    }

    async fn is_applied(&self, key: &EventKey) -> Result<bool, StoreError> {
        Ok(self.lock()?.applied.contains_key(key))
    }

    async fn commit_event(
        &self,
        event: &DecodedEvent,
        outcome: &EventOutcome,
    ) -> Result<CommitResult, StoreError> {
        let mut state = self.lock()?;
        let key = event.key();
        if state.applied.contains_key(&key) {
            return Ok(CommitResult::AlreadyApplied);
        }

        let stream = event.stream();
        match outcome {
            EventOutcome::Applied(write) => {
                state.check(write)?;
                state.apply(&write.mutations);
            }
            EventOutcome::Skipped(skipped) => {
                state.skipped.entry(stream.clone()).or_default().push(skipped.clone());
            }
        }
        state.applied.insert(key, stream.clone());
        state
            .raw
            .entry(stream)
            .or_default()
            .insert(event.position(), event.clone());
        Ok(CommitResult::Committed)
    }

    async fn commit(&self, write: &WriteSet) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        state.check(write)?;
        state.apply(&write.mutations);
        Ok(())
    }

    async fn raw_events(&self, stream: &StreamId) -> Result<Vec<DecodedEvent>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .raw
            .get(stream)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn truncate_stream(
        &self,
        stream: &StreamId,
        after_block: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut removed = 0;
        if let Some(events) = state.raw.get_mut(stream) {
            let before = events.len();
            match after_block {
                Some(after) => events.retain(|(block, _), _| *block <= after),
                None => events.clear(),
            }
            removed = (before - events.len()) as u64;
        }
        state.applied.retain(|_, owner| owner != stream);
        state.skipped.remove(stream);
        Ok(removed)
    }

    async fn purge(&self, scope: &PurgeScope) -> Result<BTreeSet<String>, StoreError> {
        let mut state = self.lock()?;
        let mut addresses = BTreeSet::new();
        state.rows.retain(|_, row| {
            let doomed = match (scope, &*row) {
                (PurgeScope::Collection { collection, chain_id }, Row::Holder(h)) => {
                    let hit = &h.collection == collection && h.chain_id == *chain_id;
                    if hit {
                        addresses.insert(h.address.clone());
                    }
                    hit
                }
                (PurgeScope::Collection { collection, chain_id }, Row::Token(t)) => {
                    let hit = &t.collection == collection && t.chain_id == *chain_id;
                    if hit {
                        addresses.insert(t.minted_by.clone());
                    }
                    hit
                }
                (PurgeScope::Collection { collection, chain_id }, Row::CollectionStat(s)) => {
                    &s.collection == collection && s.chain_id == *chain_id
                }
                (PurgeScope::Collection { collection, chain_id }, Row::TransferRecord(r)) => {
                    &r.collection == collection && r.chain_id == *chain_id
                }
                (PurgeScope::Vault { chain_id }, Row::Vault(v)) => v.chain_id == *chain_id,
                (PurgeScope::Vault { chain_id }, Row::UserVaultSummary(s)) => {
                    s.chain_id == *chain_id
                }
                (PurgeScope::Vault { chain_id }, Row::VaultActivity(a)) => a.chain_id == *chain_id,
                _ => false,
            };
            !doomed
        });
        Ok(addresses)
    }

    async fn reset(&self) -> Result<(), StoreError> {
        *self.lock()? = State::default();
        Ok(())
    }

    async fn top_holders(
        &self,
        collection: &str,
        chain_id: u64,
        limit: usize,
    ) -> Result<Vec<Holder>, StoreError> {
        let mut holders = self.rows_of(|row| match row {
            Row::Holder(h) if h.collection == collection && h.chain_id == chain_id => {
                Some(h.clone())
            }
            _ => None,
        })?;
        holders.sort_by(|a, b| b.balance.cmp(&a.balance).then_with(|| a.address.cmp(&b.address)));
        holders.truncate(limit);
        Ok(holders)
    }

    async fn top_user_balances(
        &self,
        generation: u8,
        limit: usize,
    ) -> Result<Vec<UserBalance>, StoreError> {
        let mut balances = self.rows_of(|row| match row {
            Row::UserBalance(ub) if ub.generation == generation => Some(ub.clone()),
            _ => None,
        })?;
        balances.sort_by(|a, b| {
            b.balance_total
                .cmp(&a.balance_total)
                .then_with(|| a.address.cmp(&b.address))
        });
        balances.truncate(limit);
        Ok(balances)
    }

    async fn recent_transfers(
        &self,
        collection: &str,
        chain_id: Option<u64>,
        mints_only: bool,
        limit: usize,
    ) -> Result<Vec<TransferRecord>, StoreError> {
        let mut records = self.rows_of(|row| match row {
            Row::TransferRecord(r)
                if r.collection == collection
                    && chain_id.is_none_or(|c| c == r.chain_id)
                    && (!mints_only || r.kind == TransferKind::Mint) =>
            {
                Some(r.clone())
            }
            _ => None,
        })?;
        records.sort_by(|a, b| {
            (b.timestamp, b.block_number, b.log_index).cmp(&(a.timestamp, a.block_number, a.log_index))
        });
        records.truncate(limit);
        Ok(records)
    }

    async fn vault_activity(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<VaultActivity>, StoreError> {
        let mut activity = self.rows_of(|row| match row {
            Row::VaultActivity(a) if a.user == user => Some(a.clone()),
            _ => None,
        })?;
        activity.sort_by(|a, b| {
            (b.timestamp, b.block_number, b.log_index).cmp(&(a.timestamp, a.block_number, a.log_index))
        });
        activity.truncate(limit);
        Ok(activity)
    }

    async fn skipped_events(&self, stream: &StreamId) -> Result<Vec<SkippedEvent>, StoreError> {
        Ok(self.lock()?.skipped.get(stream).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jarindex_core::EventArgs;

    fn mint_event(tx: &str, block: u64, token_id: u64) -> DecodedEvent {
        DecodedEvent {
            chain_id: 1,
            contract: "HoneyJar1".into(),
            block_number: block,
            block_hash: format!("0xb{block}"),
            parent_hash: format!("0xb{}", block - 1),
            log_index: 0,
            transaction_hash: tx.into(),
            timestamp: block as i64,
            args: EventArgs::Transfer {
                from: jarindex_core::ZERO_ADDRESS.into(),
                to: "0xa".into(),
                token_id,
            },
        }
    }

    fn token(id: u64) -> Token {
        Token {
            collection: "HoneyJar1".into(),
            chain_id: 1,
            token_id: id,
            owner: "0xa".into(),
            minted_by: "0xa".into(),
            is_burned: false,
            minted_at: 1,
            last_transfer_time: 1,
        }
    }

    fn create(row: Row) -> WriteSet {
        WriteSet {
            reads: vec![(row.key(), None)],
            mutations: vec![Mutation::create(row)],
        }
    }

    #[tokio::test]
    async fn commit_event_is_idempotent() {
        let store = MemoryStore::new();
        let event = mint_event("0x1", 10, 1);
        let outcome = EventOutcome::Applied(create(Row::Token(token(1))));

        assert_eq!(
            store.commit_event(&event, &outcome).await.unwrap(),
            CommitResult::Committed
        );
        assert_eq!(
            store.commit_event(&event, &outcome).await.unwrap(),
            CommitResult::AlreadyApplied
        );
        assert!(store.is_applied(&event.key()).await.unwrap());
        assert_eq!(store.raw_events(&event.stream()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_read_is_a_conflict_and_writes_nothing() {
        let store = MemoryStore::new();
        store.commit(&create(Row::Token(token(1)))).await.unwrap();

        // Computed against a snapshot where the token did not exist yet.
        let stale = WriteSet {
            reads: vec![(Row::Token(token(1)).key(), None)],
            mutations: vec![Mutation::create(Row::Token(token(2)))],
        };
        let err = store.commit(&stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.dump().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_of_a_missing_row_is_a_conflict() {
        let store = MemoryStore::new();
        let write = WriteSet {
            reads: Vec::new(),
            mutations: vec![Mutation::update(Row::Token(token(1)))],
        };
        let err = store.commit(&write).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.dump().unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncate_keeps_ancestor_blocks_and_clears_keys() {
        let store = MemoryStore::new();
        for (i, block) in [10u64, 11, 12].into_iter().enumerate() {
            let event = mint_event(&format!("0x{i}"), block, i as u64 + 1);
            store
                .commit_event(&event, &EventOutcome::Applied(WriteSet::default()))
                .await
                .unwrap();
        }
        let stream = StreamId::new(1, "HoneyJar1");
        assert_eq!(store.truncate_stream(&stream, Some(10)).await.unwrap(), 2);
        let retained = store.raw_events(&stream).await.unwrap();
        assert_eq!(retained.len(), 1);
        assert!(!store.is_applied(&retained[0].key()).await.unwrap());
    }

    #[tokio::test]
    async fn purge_reports_minters_and_holders() {
        let store = MemoryStore::new();
        let mut t = token(1);
        t.minted_by = "0xminter".into();
        store.commit(&create(Row::Token(t))).await.unwrap();
        let holder = Holder {
            address: "0xa".into(),
            collection: "HoneyJar1".into(),
            chain_id: 1,
            balance: 1,
            total_minted: 0,
            first_mint_time: None,
            last_activity_time: 1,
        };
        store.commit(&create(Row::Holder(holder))).await.unwrap();

        let scope = PurgeScope::Collection {
            collection: "HoneyJar1".into(),
            chain_id: 1,
        };
        let addresses = store.purge(&scope).await.unwrap();
        assert_eq!(addresses, BTreeSet::from(["0xa".to_string(), "0xminter".to_string()]));
        assert!(store.dump().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rewind_drops_blocks_above_ancestor() {
        let store = MemoryStore::new();
        let stream = StreamId::new(1, "HoneyJar1");
        for n in 1..=5u64 {
            let cursor = Cursor {
                stream: stream.clone(),
                block_number: n,
                block_hash: format!("0x{n}"),
                log_index: None,
                updated_at: Utc::now(),
            };
            let block = IndexedBlock {
                stream: stream.clone(),
                block_number: n,
                block_hash: format!("0x{n}"),
                parent_hash: format!("0x{}", n - 1),
                timestamp: n as i64,
            };
            store.advance(&cursor, &block).await.unwrap();
        }
        let ancestor = store.indexed_blocks(&stream, 2, 2).await.unwrap().remove(0);
        let cursor = Cursor {
            stream: stream.clone(),
            block_number: ancestor.block_number,
            block_hash: ancestor.block_hash,
            log_index: None,
            updated_at: Utc::now(),
        };
        store.rewind(&stream, Some(&cursor)).await.unwrap();

        assert_eq!(store.cursor(&stream).await.unwrap().unwrap().block_number, 2);
        let remaining = store.indexed_blocks(&stream, 0, 10).await.unwrap();
        assert_eq!(
            remaining.iter().map(|b| b.block_number).collect::<Vec<_>>(),
            vec![2, 1]
        );
    }
}
