#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jarindex_core::{CapabilityTable, EventArgs, ZERO_ADDRESS};
use jarindex_engine::{EngineConfig, MemoryLogSource, RetryPolicy, Step, StreamWorker};
use jarindex_projection::StreamProjector;
use jarindex_storage::MemoryStore;
use tokio::sync::watch;

pub const ETH: u64 = 1;
pub const BERA: u64 = 80094;

pub const ALICE: &str = "0x00000000000000000000000000000000000a11ce";
pub const BOB: &str = "0x0000000000000000000000000000000000000b0b";
pub const CAROL: &str = "0x00000000000000000000000000000000000ca401";
pub const PROXY: &str = "0xe0b791529f7876dc2b9d748a2e6570e605f40e5e";

pub const TABLE: &str = r#"{
    "chains": [
        { "id": 1, "name": "ethereum", "block_range": 5 },
        { "id": 80094, "name": "berachain", "block_range": 5 }
    ],
    "collections": [
        {
            "name": "HoneyJar1",
            "generation": 1,
            "home_chain_id": 1,
            "proxy_address": "0xE0B791529F7876DC2B9D748A2E6570E605F40E5E"
        },
        { "name": "Honeycomb", "home_chain_id": 1, "supply_policy": "max_token_id" }
    ],
    "contracts": [
        { "id": "HoneyJar1", "chain_id": 1, "address": "0xa20cf9b0874c3e46b344deaeea9c2e0c3e1db37d", "start_block": 1, "kind": "collection", "collection": "HoneyJar1" },
        { "id": "HoneyJar1Bera", "chain_id": 80094, "address": "0xedc5dfd6f37464cc91bbce572b6fe2c97f1bc7b3", "start_block": 1, "kind": "collection", "collection": "HoneyJar1" },
        { "id": "Honeycomb", "chain_id": 1, "address": "0xcb0477d1af5b8b05795d89d59f4667b59eae9244", "start_block": 1, "kind": "collection", "collection": "Honeycomb" },
        { "id": "MoneycombVault", "chain_id": 80094, "address": "0x9279b2227b57f349a0ce552b25af341e735f6309", "start_block": 1, "kind": "vault" }
    ]
}"#;

pub fn table() -> CapabilityTable {
    CapabilityTable::from_json(TABLE).expect("fixture table parses")
}

pub fn config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(5),
        retry: RetryPolicy {
            max_retries: 3,
            initial_backoff_ms: 1,
            backoff_multiplier: 2.0,
            max_backoff_ms: 2,
            jitter: false,
        },
        max_conflict_retries: 4,
    }
}

pub fn source() -> Arc<MemoryLogSource> {
    let source = MemoryLogSource::new();
    source.add_chain(ETH);
    source.add_chain(BERA);
    Arc::new(source)
}

pub fn projector(table: &CapabilityTable, contract: &str) -> StreamProjector {
    StreamProjector::resolve(table.resolve(contract).expect("contract resolves"))
        .expect("projector resolves")
}

pub fn worker(
    store: &Arc<MemoryStore>,
    source: &Arc<MemoryLogSource>,
    table: &CapabilityTable,
    contract: &str,
) -> StreamWorker<MemoryStore, MemoryLogSource> {
    // The receiver keeps the last value after the sender is gone.
    let (_tx, rx) = watch::channel(false);
    StreamWorker::new(
        store.clone(),
        source.clone(),
        projector(table, contract),
        config(),
        rx,
    )
}

/// Step `worker` until it reports that it has caught up with the chain.
pub async fn sync(worker: &StreamWorker<MemoryStore, MemoryLogSource>) {
    for _ in 0..100 {
        if worker.step().await.expect("step succeeds") == Step::CaughtUp {
            return;
        }
    }
    panic!("worker did not catch up");
}

pub fn mint(to: &str, token_id: u64) -> EventArgs {
    transfer(ZERO_ADDRESS, to, token_id)
}

pub fn transfer(from: &str, to: &str, token_id: u64) -> EventArgs {
    EventArgs::Transfer {
        from: from.into(),
        to: to.into(),
        token_id,
    }
}
