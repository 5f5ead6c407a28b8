//! Per-event apply path: idempotency check, projection over a snapshot,
//! atomic commit with optimistic conflict retries.

use std::collections::BTreeSet;
use std::sync::Arc;

use jarindex_core::DecodedEvent;
use jarindex_projection::{ReadSet, Snapshot, StreamProjector, reconcile};
use jarindex_storage::models::SkippedEvent;
use jarindex_storage::{AggregateStore, CommitResult, EventOutcome, StoreError, WriteSet};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::retry::with_retry;

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Committed,
    /// Invariant violation; recorded as a skipped event.
    Skipped,
    /// Idempotency key already present.
    Duplicate,
}

pub struct Pipeline<S> {
    store: Arc<S>,
    projector: StreamProjector,
    config: EngineConfig,
}

impl<S: AggregateStore> Pipeline<S> {
    pub fn new(store: Arc<S>, projector: StreamProjector, config: EngineConfig) -> Self {
        Self {
            store,
            projector,
            config,
        }
    }

    pub fn projector(&self) -> &StreamProjector {
        &self.projector
    }

    /// Read every row, mint tally and transfer timestamp in `reads` into a snapshot.
    pub async fn load(&self, reads: &ReadSet) -> Result<Snapshot, StoreError> {
        let mut snapshot = Snapshot::new();
        for key in &reads.rows {
            let row = with_retry(&self.config.retry, "get", || self.store.get(key)).await?;
            snapshot.insert(key.clone(), row);
        }
        for key in &reads.minted {
            let count =
                with_retry(&self.config.retry, "minted_count", || self.store.minted_count(key))
                    .await?;
            snapshot.insert_minted(key.clone(), count);
        }
        for key in &reads.activity {
            let latest = with_retry(&self.config.retry, "last_transfer_time", || {
                self.store.last_transfer_time(key)
            })
            .await?;
            snapshot.insert_activity(key.clone(), latest);
        }
        Ok(snapshot)
    }

    /// Apply one event exactly once.
    pub async fn apply(&self, event: &DecodedEvent) -> Result<Applied, EngineError> {
        let key = event.key();
        let store = &self.store;

        if with_retry(&self.config.retry, "is_applied", || store.is_applied(&key)).await? {
            debug!(
                chain = event.chain_id,
                contract = %event.contract,
                block = event.block_number,
                log_index = event.log_index,
                "Duplicate event, skipping"
            );
            return Ok(Applied::Duplicate);
        }

        let reads = self
            .projector
            .read_set(event)
            .map_err(|source| EngineError::Projection {
                event: key.clone(),
                source,
            })?;

        let attempts = self.config.max_conflict_retries + 1;
        for attempt in 1..=attempts {
            let snapshot = self.load(&reads).await?;
            let outcome = match self.projector.project(event, &snapshot) {
                Ok(write) => EventOutcome::Applied(write),
                Err(err) if err.is_invariant() => {
                    warn!(
                        chain = event.chain_id,
                        contract = %event.contract,
                        block = event.block_number,
                        log_index = event.log_index,
                        tx = %event.transaction_hash,
                        reason = %err,
                        "Invariant violation, event skipped"
                    );
                    EventOutcome::Skipped(SkippedEvent {
                        key: key.clone(),
                        contract: event.contract.clone(),
                        block_number: event.block_number,
                        reason: err.to_string(),
                    })
                }
                Err(source) => {
                    return Err(EngineError::Projection {
                        event: key.clone(),
                        source,
                    });
                }
            };

            let committed = with_retry(&self.config.retry, "commit_event", || {
                store.commit_event(event, &outcome)
            })
            .await;

            match committed {
                Ok(CommitResult::Committed) => {
                    return Ok(match outcome {
                        EventOutcome::Applied(_) => Applied::Committed,
                        EventOutcome::Skipped(_) => Applied::Skipped,
                    });
                }
                Ok(CommitResult::AlreadyApplied) => return Ok(Applied::Duplicate),
                Err(StoreError::Conflict(reason)) => {
                    debug!(
                        chain = event.chain_id,
                        contract = %event.contract,
                        block = event.block_number,
                        log_index = event.log_index,
                        attempt,
                        %reason,
                        "Write conflict, re-projecting"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(EngineError::ConflictsExhausted {
            event: key,
            attempts,
        })
    }

    /// Recompute the cross-chain balances of `addresses` from current rows.
    /// A no-op for collections without a generation and for vault streams.
    pub async fn rebuild_balances(&self, addresses: &BTreeSet<String>) -> Result<(), EngineError> {
        let Some(collection) = self.projector.binding().collection.as_ref() else {
            return Ok(());
        };
        if collection.generation.is_none() {
            return Ok(());
        }

        let store = &self.store;
        let mut rebuilt = 0usize;
        for address in addresses {
            if reconcile::targets(collection, [address.as_str()]).is_empty() {
                continue;
            }
            let mut reads = ReadSet::default();
            reconcile::reads(&mut reads, collection, address);

            let mut done = false;
            for _ in 0..=self.config.max_conflict_retries {
                let snapshot = self.load(&reads).await?;
                let mutations = reconcile::rebuild(&snapshot, collection, address).map_err(
                    |source| EngineError::Rebuild {
                        address: address.clone(),
                        source,
                    },
                )?;
                if mutations.is_empty() {
                    done = true;
                    break;
                }
                let write = WriteSet {
                    reads: snapshot.reads(),
                    mutations,
                };
                match with_retry(&self.config.retry, "commit", || store.commit(&write)).await {
                    Ok(()) => {
                        rebuilt += 1;
                        done = true;
                        break;
                    }
                    Err(StoreError::Conflict(_)) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            if !done {
                return Err(StoreError::Conflict(format!(
                    "balance of {address} kept changing during rebuild"
                ))
                .into());
            }
        }

        info!(
            stream = %self.projector.binding().stream(),
            checked = addresses.len(),
            rebuilt,
            "Cross-chain balances rebuilt"
        );
        Ok(())
    }
}
