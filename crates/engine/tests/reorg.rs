mod common;

use std::sync::Arc;

use common::*;
use jarindex_engine::{EngineError, Step};
use jarindex_storage::{AggregateStore, CursorStore, MemoryStore};

/// Index the chain as it is now into an empty store.
async fn fresh_sync(source: &Arc<jarindex_engine::MemoryLogSource>, contract: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let worker = worker(&store, source, &table(), contract);
    sync(&worker).await;
    store
}

async fn assert_same_state(left: &MemoryStore, right: &MemoryStore, contract: &str) {
    let stream = table().resolve(contract).unwrap().stream();
    assert_eq!(left.dump().unwrap(), right.dump().unwrap());
    assert_eq!(
        left.raw_events(&stream).await.unwrap(),
        right.raw_events(&stream).await.unwrap()
    );
    let (l, r) = (
        left.cursor(&stream).await.unwrap().unwrap(),
        right.cursor(&stream).await.unwrap().unwrap(),
    );
    assert_eq!((l.block_number, l.block_hash), (r.block_number, r.block_hash));
}

#[tokio::test]
async fn shallow_reorg_matches_a_clean_index_of_the_new_chain() {
    let table = table();
    let source = source();
    let store = Arc::new(MemoryStore::new());
    source.mine(ETH, "HoneyJar1", vec![mint(ALICE, 1)]);
    source.mine(ETH, "HoneyJar1", vec![mint(BOB, 2)]);
    source.mine(ETH, "HoneyJar1", vec![transfer(ALICE, BOB, 1)]);

    let worker = worker(&store, &source, &table, "HoneyJar1");
    sync(&worker).await;
    let bob = store.top_holders("HoneyJar1", ETH, 10).await.unwrap();
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].balance, 2);

    source.reorg(ETH, 2);
    source.mine(ETH, "HoneyJar1", vec![mint(CAROL, 2)]);
    source.mine_empty(ETH, 1);
    source.mine(ETH, "HoneyJar1", vec![transfer(CAROL, ALICE, 2)]);
    sync(&worker).await;

    let holders = store.top_holders("HoneyJar1", ETH, 10).await.unwrap();
    let owners: Vec<_> = holders.iter().map(|h| (h.address.as_str(), h.balance)).collect();
    assert_eq!(owners, vec![(ALICE, 2)]);

    let clean = fresh_sync(&source, "HoneyJar1").await;
    assert_same_state(&store, &clean, "HoneyJar1").await;
}

#[tokio::test]
async fn reorg_past_every_recorded_block_rebuilds_from_start() {
    let table = table();
    let source = source();
    let store = Arc::new(MemoryStore::new());
    source.mine(ETH, "HoneyJar1", vec![mint(ALICE, 1)]);
    source.mine(ETH, "HoneyJar1", vec![mint(ALICE, 2)]);
    source.mine(ETH, "HoneyJar1", vec![transfer(ALICE, BOB, 2)]);

    let worker = worker(&store, &source, &table, "HoneyJar1");
    sync(&worker).await;

    source.reorg(ETH, 3);
    source.mine(ETH, "HoneyJar1", vec![mint(BOB, 1)]);
    source.mine_empty(ETH, 3);
    sync(&worker).await;

    let clean = fresh_sync(&source, "HoneyJar1").await;
    assert_same_state(&store, &clean, "HoneyJar1").await;
    let balances = store.top_user_balances(1, 10).await.unwrap();
    assert_eq!(balances.len(), 1);
    assert_eq!(balances[0].address, BOB);
}

#[tokio::test]
async fn reorg_deeper_than_the_window_halts_the_stream() {
    let mut table = table();
    table.chains[0].max_reorg_depth = 2;
    let source = source();
    let store = Arc::new(MemoryStore::new());
    source.mine_empty(ETH, 10);

    let worker = worker(&store, &source, &table, "HoneyJar1");
    sync(&worker).await;

    source.reorg(ETH, 5);
    source.mine_empty(ETH, 6);

    let err = worker.step().await.unwrap_err();
    assert!(
        matches!(err, EngineError::ReorgTooDeep { block: 10, max_depth: 2, .. }),
        "unexpected error: {err}"
    );
    // Nothing moved; the stream stays parked on the orphaned block.
    let cursor = store.cursor(&worker.stream()).await.unwrap().unwrap();
    assert_eq!(cursor.block_number, 10);
}

#[tokio::test]
async fn a_reorg_is_reported_as_progress() {
    let table = table();
    let source = source();
    let store = Arc::new(MemoryStore::new());
    source.mine_empty(ETH, 3);

    let worker = worker(&store, &source, &table, "HoneyJar1");
    sync(&worker).await;
    source.reorg(ETH, 1);
    source.mine_empty(ETH, 2);

    assert_eq!(worker.step().await.unwrap(), Step::Progressed);
    let cursor = store.cursor(&worker.stream()).await.unwrap().unwrap();
    assert_eq!(cursor.block_number, 2);
}

#[tokio::test]
async fn emptying_one_chain_keeps_cross_chain_activity_through_a_reorg() {
    let table = table();
    let source = source();
    source.mine(BERA, "HoneyJar1Bera", (0..10).map(|id| mint(ALICE, 100 + id)).collect());
    source.mine(ETH, "HoneyJar1", vec![mint(ALICE, 1)]);
    source.mine(ETH, "HoneyJar1", vec![transfer(ALICE, BOB, 1)]);
    source.mine_empty(ETH, 1);

    let store = Arc::new(MemoryStore::new());
    let bera = worker(&store, &source, &table, "HoneyJar1Bera");
    let eth = worker(&store, &source, &table, "HoneyJar1");
    sync(&bera).await;
    sync(&eth).await;

    source.reorg(ETH, 1);
    source.mine_empty(ETH, 1);
    sync(&eth).await;

    let clean = Arc::new(MemoryStore::new());
    sync(&worker(&clean, &source, &table, "HoneyJar1")).await;
    sync(&worker(&clean, &source, &table, "HoneyJar1Bera")).await;
    assert_eq!(store.dump().unwrap(), clean.dump().unwrap());

    let balances = store.top_user_balances(1, 10).await.unwrap();
    let alice = balances.iter().find(|b| b.address == ALICE).unwrap();
    assert_eq!(alice.balance_total, 10);
    assert_eq!(alice.minted_total, 11);
    // The Ethereum send at block 2 is newer than the Berachain mints at block 1.
    assert_eq!(alice.last_activity_time, 1_700_000_024);
}
