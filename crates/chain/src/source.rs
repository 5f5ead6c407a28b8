//! JSON-RPC backed [`LogSource`].

use std::collections::BTreeMap;
use std::fmt::Display;

use alloy::{
    consensus::BlockHeader as _,
    eips::BlockNumberOrTag,
    network::primitives::HeaderResponse as _,
    primitives::Address,
    providers::Provider,
    rpc::types::Filter,
};
use async_trait::async_trait;
use jarindex_core::{
    BlockHeader, CapabilityTable, ChainId, ContractConfig, DecodedEvent, LogSource, Settings,
    SourceError,
};
use tracing::{info, warn};

use crate::decoder;
use crate::provider::{ChainProvider, create_provider};

fn transient(err: impl Display) -> SourceError {
    SourceError::Transient(err.to_string())
}

/// One HTTP provider per configured chain.
#[derive(Clone, Default)]
pub struct RpcLogSource {
    providers: BTreeMap<ChainId, ChainProvider>,
}

impl RpcLogSource {
    /// Connect to every chain of `table` that has an `RPC_URL_<chain_id>`.
    ///
    /// Chains without a URL are left out; their streams fail with
    /// `UnknownChain` while the rest keep running.
    pub fn connect(table: &CapabilityTable, settings: &Settings) -> eyre::Result<Self> {
        let mut source = Self::default();
        for chain in &table.chains {
            match settings.rpc_url(chain.id) {
                Some(url) => {
                    source.insert(chain.id, create_provider(url)?);
                    info!(chain = chain.id, name = %chain.name, "Connected RPC provider");
                }
                None => warn!(
                    chain = chain.id,
                    name = %chain.name,
                    "No RPC_URL_{} configured; streams on this chain will not run",
                    chain.id
                ),
            }
        }
        Ok(source)
    }

    pub fn insert(&mut self, chain_id: ChainId, provider: ChainProvider) {
        self.providers.insert(chain_id, provider);
    }

    fn provider(&self, chain_id: ChainId) -> Result<&ChainProvider, SourceError> {
        self.providers
            .get(&chain_id)
            .ok_or(SourceError::UnknownChain(chain_id))
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    async fn head(&self, chain_id: ChainId) -> Result<u64, SourceError> {
        self.provider(chain_id)?
            .get_block_number()
            .await
            .map_err(transient)
    }

    async fn header(
        &self,
        chain_id: ChainId,
        number: u64,
    ) -> Result<Option<BlockHeader>, SourceError> {
        let block = self
            .provider(chain_id)?
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await
            .map_err(transient)?;

        Ok(block.map(|block| BlockHeader {
            chain_id,
            number,
            hash: format!("{:#x}", block.header.hash()),
            parent_hash: format!("{:#x}", block.header.parent_hash()),
            timestamp: block.header.timestamp() as i64,
        }))
    }

    async fn events(
        &self,
        contract: &ContractConfig,
        from: u64,
        to: u64,
    ) -> Result<Vec<DecodedEvent>, SourceError> {
        let chain_id = contract.chain_id;
        let address: Address = contract.address.parse().map_err(|e| {
            SourceError::Decode(format!("contract {} address: {e}", contract.id))
        })?;

        let filter = Filter::new()
            .address(address)
            .event_signature(decoder::signatures(contract.kind))
            .from_block(from)
            .to_block(to);
        let logs = self
            .provider(chain_id)?
            .get_logs(&filter)
            .await
            .map_err(transient)?;

        // Logs carry no parent hash or (reliably) timestamp; fetch each
        // block's header once.
        let mut headers: BTreeMap<u64, BlockHeader> = BTreeMap::new();
        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            if log.removed {
                continue;
            }
            let Some(args) = decoder::decode_or_skip(contract.kind, log) else {
                continue;
            };
            let (Some(number), Some(log_index)) = (log.block_number, log.log_index) else {
                return Err(SourceError::Decode("log without block number or index".into()));
            };

            if !headers.contains_key(&number) {
                let header = self
                    .header(chain_id, number)
                    .await?
                    .ok_or(SourceError::MissingBlock { chain_id, number })?;
                headers.insert(number, header);
            }
            let header = &headers[&number];

            let block_hash = log.block_hash.map(|h| format!("{h:#x}"));
            if block_hash.as_deref() != Some(header.hash.as_str()) {
                return Err(SourceError::Transient(format!(
                    "block {number} on chain {chain_id} changed while fetching logs"
                )));
            }

            events.push(DecodedEvent {
                chain_id,
                contract: contract.id.clone(),
                block_number: number,
                block_hash: header.hash.clone(),
                parent_hash: header.parent_hash.clone(),
                log_index: log_index as u32,
                transaction_hash: log
                    .transaction_hash
                    .map(|h| format!("{h:#x}"))
                    .unwrap_or_default(),
                timestamp: header.timestamp,
                args,
            });
        }
        Ok(events)
    }
}
