mod common;

use std::sync::Arc;

use common::*;
use jarindex_engine::{Applied, Pipeline};
use jarindex_storage::{AggregateStore, CursorStore, MemoryStore};

#[tokio::test]
async fn reapplying_the_raw_log_changes_nothing() {
    let table = table();
    let source = source();
    let store = Arc::new(MemoryStore::new());
    source.mine(ETH, "HoneyJar1", vec![mint(ALICE, 1), mint(BOB, 2)]);
    source.mine(ETH, "HoneyJar1", vec![transfer(ALICE, BOB, 1)]);

    let worker = worker(&store, &source, &table, "HoneyJar1");
    sync(&worker).await;
    let before = store.dump().unwrap();

    let pipeline = Pipeline::new(store.clone(), projector(&table, "HoneyJar1"), config());
    let raw = store.raw_events(&worker.stream()).await.unwrap();
    assert_eq!(raw.len(), 3);
    for event in &raw {
        assert_eq!(pipeline.apply(event).await.unwrap(), Applied::Duplicate);
    }
    assert_eq!(store.dump().unwrap(), before);
}

#[tokio::test]
async fn lost_cursor_advance_is_repaired_by_idempotency() {
    let table = table();
    let source = source();
    let store = Arc::new(MemoryStore::new());
    source.mine(ETH, "HoneyJar1", vec![mint(ALICE, 1)]);
    source.mine(ETH, "HoneyJar1", vec![transfer(ALICE, CAROL, 1), mint(BOB, 2)]);

    let worker = worker(&store, &source, &table, "HoneyJar1");
    sync(&worker).await;
    let before = store.dump().unwrap();

    // As if the process died after committing events but before the cursor moved.
    store.rewind(&worker.stream(), None).await.unwrap();
    sync(&worker).await;

    assert_eq!(store.dump().unwrap(), before);
    let cursor = store.cursor(&worker.stream()).await.unwrap().unwrap();
    assert_eq!(cursor.block_number, 2);
}

#[tokio::test]
async fn transient_source_failures_are_retried() {
    let table = table();
    let source = source();
    let store = Arc::new(MemoryStore::new());
    source.mine(ETH, "HoneyJar1", vec![mint(ALICE, 1)]);
    source.fail_next(ETH, 2);

    let worker = worker(&store, &source, &table, "HoneyJar1");
    sync(&worker).await;

    let holders = store.top_holders("HoneyJar1", ETH, 10).await.unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].address, ALICE);
}
