//! Fixtures shared by the projection unit tests.

use std::collections::BTreeMap;

use jarindex_core::{
    BucketChains, ChainConfig, CollectionBinding, ContractBinding, ContractConfig, ContractKind,
    DecodedEvent, EventArgs, SupplyPolicy,
};
use jarindex_storage::models::HolderKey;
use jarindex_storage::{MutationOp, Row, RowKey};

use crate::registry::StreamProjector;
use crate::snapshot::Snapshot;

fn chain(id: u64) -> ChainConfig {
    ChainConfig {
        id,
        name: format!("chain-{id}"),
        confirmation_depth: 0,
        block_range: 100,
        max_reorg_depth: 128,
        cursor_batch_blocks: 1,
    }
}

/// `HoneyJar1` on Ethereum, also indexed on Berachain.
pub fn binding() -> ContractBinding {
    ContractBinding {
        contract: ContractConfig {
            id: "HoneyJar1".into(),
            chain_id: 1,
            address: "0xa20cf9b0874c3e46b344deaeea9c2e0c3e1db37d".into(),
            start_block: 0,
            kind: ContractKind::Collection,
            collection: Some("HoneyJar1".into()),
        },
        chain: chain(1),
        collection: Some(CollectionBinding {
            name: "HoneyJar1".into(),
            generation: Some(1),
            home_chain_id: 1,
            proxy_address: Some("0xe0b791529f7876dc2b9d748a2e6570e605f40e5e".into()),
            supply_policy: SupplyPolicy::Counters,
            indexed_chains: vec![1, 80094],
            buckets: BucketChains::default(),
        }),
    }
}

pub fn vault_binding() -> ContractBinding {
    ContractBinding {
        contract: ContractConfig {
            id: "MoneycombVault".into(),
            chain_id: 80094,
            address: "0x9279b2227b57f349a0ce552b25af341e735f6309".into(),
            start_block: 0,
            kind: ContractKind::Vault,
            collection: None,
        },
        chain: chain(80094),
        collection: None,
    }
}

pub fn vault_event(block: u64, args: EventArgs) -> DecodedEvent {
    DecodedEvent {
        chain_id: 80094,
        contract: "MoneycombVault".into(),
        block_number: block,
        block_hash: format!("0xv{block}"),
        parent_hash: format!("0xv{}", block.saturating_sub(1)),
        log_index: 0,
        transaction_hash: format!("0xvt{block}"),
        timestamp: block as i64 * 2,
        args,
    }
}

/// Apply `prior` in order to an empty state, then snapshot what `event` reads.
pub fn snapshot_for(event: &DecodedEvent, binding: &ContractBinding, prior: &[&DecodedEvent]) -> Snapshot {
    let projector = StreamProjector::resolve(binding.clone()).expect("binding resolves");
    let mut state: BTreeMap<RowKey, Row> = BTreeMap::new();
    for earlier in prior {
        let snapshot = read(&projector, earlier, &state);
        let write = projector.project(earlier, &snapshot).expect("prior event applies");
        for m in write.mutations {
            match m.op {
                MutationOp::Delete => {
                    state.remove(&m.key());
                }
                _ => {
                    state.insert(m.key(), m.row);
                }
            }
        }
    }
    read(&projector, event, &state)
}

fn read(projector: &StreamProjector, event: &DecodedEvent, state: &BTreeMap<RowKey, Row>) -> Snapshot {
    let reads = projector.read_set(event).expect("read set");
    let mut snapshot = Snapshot::new();
    for key in reads.rows {
        let row = state.get(&key).cloned();
        snapshot.insert(key, row);
    }
    for key in reads.minted {
        snapshot.insert_minted(key.clone(), minted(state, &key));
    }
    for key in reads.activity {
        snapshot.insert_activity(key.clone(), latest_transfer(state, &key));
    }
    snapshot
}

fn minted(state: &BTreeMap<RowKey, Row>, key: &HolderKey) -> u64 {
    state
        .values()
        .filter(|row| {
            matches!(row, Row::Token(t)
                if t.collection == key.collection && t.chain_id == key.chain_id && t.minted_by == key.address)
        })
        .count() as u64
}

fn latest_transfer(state: &BTreeMap<RowKey, Row>, key: &HolderKey) -> Option<i64> {
    state
        .values()
        .filter_map(|row| match row {
            Row::TransferRecord(r)
                if r.collection == key.collection
                    && r.chain_id == key.chain_id
                    && (r.from == key.address || r.to == key.address) =>
            {
                Some(r.timestamp)
            }
            _ => None,
        })
        .max()
}
