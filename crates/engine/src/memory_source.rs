//! Scripted in-memory [`LogSource`] for tests and local runs.
//!
//! Each chain starts with a genesis block `0`. [`MemoryLogSource::mine`]
//! appends a block carrying events, [`MemoryLogSource::reorg`] drops the
//! newest blocks so that subsequently mined blocks form a new fork with
//! different hashes.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use jarindex_core::{
    BlockHeader, ChainId, ContractConfig, DecodedEvent, EventArgs, LogSource, SourceError,
};

#[derive(Debug)]
struct Block {
    header: BlockHeader,
    events: Vec<DecodedEvent>,
}

#[derive(Debug, Default)]
struct ChainScript {
    blocks: Vec<Block>,
    fork: u32,
    /// Calls left to fail with a transient error.
    failures: u32,
}

impl ChainScript {
    fn genesis(chain_id: ChainId) -> Self {
        Self {
            blocks: vec![Block {
                header: BlockHeader {
                    chain_id,
                    number: 0,
                    hash: block_hash(chain_id, 0, 0),
                    parent_hash: String::from("0x0"),
                    timestamp: 0,
                },
                events: Vec::new(),
            }],
            ..Self::default()
        }
    }

    fn trip(&mut self) -> Result<(), SourceError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(SourceError::Transient("scripted outage".into()));
        }
        Ok(())
    }
}

fn block_hash(chain_id: ChainId, fork: u32, number: u64) -> String {
    format!("0x{chain_id:x}f{fork:04x}b{number:012x}")
}

#[derive(Debug, Default)]
pub struct MemoryLogSource {
    chains: Mutex<HashMap<ChainId, ChainScript>>,
}

impl MemoryLogSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<ChainId, ChainScript>>, SourceError> {
        self.chains
            .lock()
            .map_err(|_| SourceError::Transient("memory source lock poisoned".into()))
    }

    fn with_chain<T>(&self, chain_id: ChainId, f: impl FnOnce(&mut ChainScript) -> T) -> T {
        let mut chains = self.chains.lock().unwrap_or_else(|p| p.into_inner());
        f(chains
            .entry(chain_id)
            .or_insert_with(|| ChainScript::genesis(chain_id)))
    }

    /// Start `chain_id` at its genesis block if it is not known yet.
    pub fn add_chain(&self, chain_id: ChainId) {
        self.with_chain(chain_id, |_| ());
    }

    /// Append a block on `chain_id` in which `contract` emits `args`, one log
    /// index per entry. Returns the new header.
    pub fn mine(&self, chain_id: ChainId, contract: &str, args: Vec<EventArgs>) -> BlockHeader {
        self.mine_many(chain_id, vec![(contract.to_string(), args)])
    }

    /// Append a block with logs from several contracts; log indexes run
    /// across the whole block.
    pub fn mine_many(&self, chain_id: ChainId, logs: Vec<(String, Vec<EventArgs>)>) -> BlockHeader {
        self.with_chain(chain_id, |script| {
            let parent = &script.blocks[script.blocks.len() - 1].header;
            let number = parent.number + 1;
            let header = BlockHeader {
                chain_id,
                number,
                hash: block_hash(chain_id, script.fork, number),
                parent_hash: parent.hash.clone(),
                timestamp: 1_700_000_000 + number as i64 * 12,
            };

            let mut events = Vec::new();
            let mut log_index = 0u32;
            for (contract, args) in logs {
                for args in args {
                    events.push(DecodedEvent {
                        chain_id,
                        contract: contract.clone(),
                        block_number: number,
                        block_hash: header.hash.clone(),
                        parent_hash: header.parent_hash.clone(),
                        log_index,
                        transaction_hash: format!("{}{log_index:04x}", header.hash),
                        timestamp: header.timestamp,
                        args,
                    });
                    log_index += 1;
                }
            }

            script.blocks.push(Block {
                header: header.clone(),
                events,
            });
            header
        })
    }

    /// Append `count` blocks without events.
    pub fn mine_empty(&self, chain_id: ChainId, count: u64) {
        for _ in 0..count {
            self.mine_many(chain_id, Vec::new());
        }
    }

    /// Drop the newest `depth` blocks; blocks mined afterwards get new hashes.
    pub fn reorg(&self, chain_id: ChainId, depth: u64) {
        self.with_chain(chain_id, |script| {
            let keep = script.blocks.len().saturating_sub(depth as usize).max(1);
            script.blocks.truncate(keep);
            script.fork += 1;
        });
    }

    /// Fail the next `calls` requests for `chain_id` with a transient error.
    pub fn fail_next(&self, chain_id: ChainId, calls: u32) {
        self.with_chain(chain_id, |script| script.failures = calls);
    }
}

#[async_trait]
impl LogSource for MemoryLogSource {
    async fn head(&self, chain_id: ChainId) -> Result<u64, SourceError> {
        let mut chains = self.lock()?;
        let script = chains
            .get_mut(&chain_id)
            .ok_or(SourceError::UnknownChain(chain_id))?;
        script.trip()?;
        Ok(script.blocks.len() as u64 - 1)
    }

    async fn header(
        &self,
        chain_id: ChainId,
        number: u64,
    ) -> Result<Option<BlockHeader>, SourceError> {
        let mut chains = self.lock()?;
        let script = chains
            .get_mut(&chain_id)
            .ok_or(SourceError::UnknownChain(chain_id))?;
        script.trip()?;
        Ok(script.blocks.get(number as usize).map(|b| b.header.clone()))
    }

    async fn events(
        &self,
        contract: &ContractConfig,
        from: u64,
        to: u64,
    ) -> Result<Vec<DecodedEvent>, SourceError> {
        let mut chains = self.lock()?;
        let script = chains
            .get_mut(&contract.chain_id)
            .ok_or(SourceError::UnknownChain(contract.chain_id))?;
        script.trip()?;
        Ok(script
            .blocks
            .iter()
            .filter(|b| (from..=to).contains(&b.header.number))
            .flat_map(|b| b.events.iter())
            .filter(|e| e.contract == contract.id)
            .cloned()
            .collect())
    }
}
