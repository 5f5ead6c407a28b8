//! Port for the upstream log source (RPC node, archive, test fixture).

use async_trait::async_trait;

use crate::config::ContractConfig;
use crate::error::SourceError;
use crate::types::{BlockHeader, ChainId, DecodedEvent};

/// Ordered, resumable supply of decoded events and canonical block headers.
///
/// Historical ranges must be re-queryable: reorg recovery asks for headers
/// below the current cursor and expects the canonical chain as of now.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Latest block number known to the source for `chain_id`.
    async fn head(&self, chain_id: ChainId) -> Result<u64, SourceError>;

    /// Canonical header at `number`, or `None` if the chain is not that long yet.
    async fn header(&self, chain_id: ChainId, number: u64)
    -> Result<Option<BlockHeader>, SourceError>;

    /// Decoded events emitted by `contract` in `[from, to]` (inclusive).
    ///
    /// Ordering is not required; the pipeline sorts by `(block_number, log_index)`.
    async fn events(
        &self,
        contract: &ContractConfig,
        from: u64,
        to: u64,
    ) -> Result<Vec<DecodedEvent>, SourceError>;
}
