//! One ingestion loop per stream.

use std::sync::Arc;

use chrono::Utc;
use jarindex_core::{BlockHeader, ContractBinding, DecodedEvent, LogSource, SourceError, StreamId};
use jarindex_projection::StreamProjector;
use jarindex_storage::models::Cursor;
use jarindex_storage::{AggregateStore, CursorStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pipeline::{Applied, Pipeline};
use crate::reorg::{self, Roller, SyncState};
use crate::retry::with_retry;

/// Result of one pass over the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A range was applied or a reorg was rolled back; go again immediately.
    Progressed,
    /// Nothing safe to ingest yet.
    CaughtUp,
    /// Shutdown was requested mid-range.
    Stopped,
}

/// Per-range tallies for the progress log line.
#[derive(Debug, Default)]
struct RangeStats {
    committed: usize,
    skipped: usize,
    duplicates: usize,
}

pub struct StreamWorker<S, L> {
    store: Arc<S>,
    source: Arc<L>,
    pipeline: Pipeline<S>,
    binding: ContractBinding,
    config: EngineConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S, L> StreamWorker<S, L>
where
    S: AggregateStore + CursorStore + 'static,
    L: LogSource + 'static,
{
    pub fn new(
        store: Arc<S>,
        source: Arc<L>,
        projector: StreamProjector,
        config: EngineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let binding = projector.binding().clone();
        Self {
            pipeline: Pipeline::new(store.clone(), projector, config.clone()),
            store,
            source,
            binding,
            config,
            shutdown,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.binding.stream()
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown or a fatal error.
    ///
    /// A pass that fails on an exhausted transient error pauses the stream for
    /// one poll interval and resumes from the durable cursor.
    pub async fn run(mut self) -> Result<(), EngineError> {
        let stream = self.stream();
        info!(%stream, start_block = self.binding.contract.start_block, "Stream worker started");

        while !self.stopping() {
            let step = match self.step().await {
                Ok(step) => step,
                Err(err) if err.is_transient() => {
                    error!(%stream, error = %err, "Retries exhausted, stream paused");
                    Step::CaughtUp
                }
                Err(err) => return Err(err),
            };
            match step {
                Step::Progressed => {}
                Step::Stopped => break,
                Step::CaughtUp => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        changed = self.shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!(%stream, "Stream worker stopped");
        Ok(())
    }

    /// Ingest the next safe range, or recover from a reorg.
    pub async fn step(&self) -> Result<Step, EngineError> {
        let stream = self.stream();
        let chain = &self.binding.chain;
        let retry = &self.config.retry;
        let store = &self.store;
        let source = &self.source;

        let cursor = with_retry(retry, "cursor", || store.cursor(&stream)).await?;
        let head = with_retry(retry, "head", || source.head(chain.id)).await?;
        let safe_head = head.saturating_sub(chain.confirmation_depth);
        let next = cursor
            .as_ref()
            .map_or(self.binding.contract.start_block, |c| c.block_number + 1);
        if next > safe_head {
            return Ok(Step::CaughtUp);
        }

        if let Some(cursor) = &cursor {
            let header = self.header(next).await?;
            if let SyncState::ReorgDetected { cursor: stale, next } = reorg::check(cursor, &header) {
                self.roller().recover(&stale, &next).await?;
                return Ok(Step::Progressed);
            }
        }

        let to = safe_head.min(next + chain.block_range.max(1) - 1);
        let mut events = with_retry(retry, "events", || {
            source.events(&self.binding.contract, next, to)
        })
        .await?;
        events.retain(|e| (next..=to).contains(&e.block_number));
        events.sort_by_key(DecodedEvent::position);

        let mut stats = RangeStats::default();
        let mut batch_start = next;
        let batch = chain.cursor_batch_blocks.max(1);
        for (i, event) in events.iter().enumerate() {
            if self.stopping() {
                return Ok(Step::Stopped);
            }
            match self.pipeline.apply(event).await? {
                Applied::Committed => stats.committed += 1,
                Applied::Skipped => stats.skipped += 1,
                Applied::Duplicate => stats.duplicates += 1,
            }

            let block_done = events
                .get(i + 1)
                .is_none_or(|n| n.block_number != event.block_number);
            if block_done && event.block_number + 1 - batch_start >= batch {
                self.advance_to_event(event).await?;
                batch_start = event.block_number + 1;
            }
        }

        // Events of one fetch must still be canonical before the cursor moves
        // past them; otherwise rebuild from where this range started.
        if let Some(last) = events.last() {
            let canonical = self.header(last.block_number).await?;
            if canonical.hash != last.block_hash {
                warn!(
                    %stream,
                    block = last.block_number,
                    "Fetched range was reorganised while applying"
                );
                self.roller().rollback(cursor).await?;
                return Ok(Step::Progressed);
            }
        }

        // Inside the reorg window every block is recorded so the ancestor
        // search can stop at the exact fork point; below it only event blocks
        // and range ends are.
        let dense_from = safe_head.saturating_sub(chain.max_reorg_depth).max(next);
        for number in dense_from..=to {
            let header = self.header(number).await?;
            self.advance_to_header(&header, &events).await?;
        }
        if dense_from > to {
            let tail = self.header(to).await?;
            self.advance_to_header(&tail, &events).await?;
        }

        if events.is_empty() {
            debug!(%stream, from = next, to, "Empty range");
        } else {
            info!(
                %stream,
                from = next,
                to,
                committed = stats.committed,
                skipped = stats.skipped,
                duplicates = stats.duplicates,
                "Indexed range"
            );
        }
        Ok(Step::Progressed)
    }

    fn roller(&self) -> Roller<'_, S, L> {
        Roller::new(
            &self.store,
            &self.source,
            &self.pipeline,
            &self.binding,
            &self.config,
        )
    }

    async fn header(&self, number: u64) -> Result<BlockHeader, EngineError> {
        let chain_id = self.binding.chain_id();
        let source = &self.source;
        let header = with_retry(&self.config.retry, "header", || async move {
            source
                .header(chain_id, number)
                .await?
                .ok_or(SourceError::MissingBlock { chain_id, number })
        })
        .await?;
        Ok(header)
    }

    async fn advance_to_event(&self, event: &DecodedEvent) -> Result<(), EngineError> {
        let cursor = Cursor {
            stream: self.stream(),
            block_number: event.block_number,
            block_hash: event.block_hash.clone(),
            log_index: Some(event.log_index),
            updated_at: Utc::now(),
        };
        self.advance(cursor, &event.parent_hash, event.timestamp).await
    }

    async fn advance_to_header(
        &self,
        header: &BlockHeader,
        events: &[DecodedEvent],
    ) -> Result<(), EngineError> {
        let cursor = Cursor {
            stream: self.stream(),
            block_number: header.number,
            block_hash: header.hash.clone(),
            log_index: events
                .iter()
                .rev()
                .find(|e| e.block_number == header.number)
                .map(|e| e.log_index),
            updated_at: Utc::now(),
        };
        self.advance(cursor, &header.parent_hash, header.timestamp).await
    }

    async fn advance(
        &self,
        cursor: Cursor,
        parent_hash: &str,
        timestamp: i64,
    ) -> Result<(), EngineError> {
        let block = reorg::indexed_block(&cursor, parent_hash, timestamp);
        let store = &self.store;
        with_retry(&self.config.retry, "advance", || store.advance(&cursor, &block)).await?;
        Ok(())
    }
}
