//! Runs against the database named by `DATABASE_URL`; skipped when unset.
//! Each test works on its own chain id, so runs never see each other's rows.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use jarindex_core::{DecodedEvent, EventArgs, StreamId, ZERO_ADDRESS};
use jarindex_storage::models::{Holder, HolderKey, Token, TokenKey, TransferKind, TransferRecord};
use jarindex_storage::{
    Aggregate, AggregateStore, CommitResult, EventOutcome, Mutation, PgStore, PurgeScope, Row,
    StoreError, WriteSet,
};

async fn store() -> Option<PgStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL store tests");
        return None;
    };
    let pool = jarindex_storage::connect(&url).await.expect("connect");
    jarindex_storage::migrate(&pool).await.expect("migrate");
    Some(PgStore::new(pool))
}

fn unique_chain() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let micros = Utc::now().timestamp_micros() as u64;
    micros * 64 + NEXT.fetch_add(1, Ordering::Relaxed) % 64
}

fn mint_event(chain_id: u64, tx: &str, block: u64, token_id: u64) -> DecodedEvent {
    DecodedEvent {
        chain_id,
        contract: "HoneyJar1".into(),
        block_number: block,
        block_hash: format!("0xb{block}"),
        parent_hash: format!("0xb{}", block - 1),
        log_index: 0,
        transaction_hash: tx.into(),
        timestamp: block as i64,
        args: EventArgs::Transfer {
            from: ZERO_ADDRESS.into(),
            to: "0xa".into(),
            token_id,
        },
    }
}

fn token(chain_id: u64, id: u64) -> Token {
    Token {
        collection: "HoneyJar1".into(),
        chain_id,
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

fn token_key(chain_id: u64, id: u64) -> jarindex_storage::RowKey {
    Token::row_key(&TokenKey {
        collection: "HoneyJar1".into(),
        chain_id,
        token_id: id,
    })
}

#[tokio::test]
async fn commit_event_is_idempotent_and_atomic() {
    let Some(store) = store().await else { return };
    let chain = unique_chain();

    let first = mint_event(chain, "0x1", 10, 1);
    let outcome = EventOutcome::Applied(create(Row::Token(token(chain, 1))));
    assert_eq!(
        store.commit_event(&first, &outcome).await.unwrap(),
        CommitResult::Committed
    );
    assert_eq!(
        store.commit_event(&first, &outcome).await.unwrap(),
        CommitResult::AlreadyApplied
    );

    // Projected before token 1 existed: the whole commit must roll back.
    let second = mint_event(chain, "0x2", 11, 2);
    let stale = EventOutcome::Applied(WriteSet {
        reads: vec![(token_key(chain, 1), None)],
        mutations: vec![Mutation::create(Row::Token(token(chain, 2)))],
    });
    let err = store.commit_event(&second, &stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "unexpected error: {err}");

    assert!(store.is_applied(&first.key()).await.unwrap());
    assert!(!store.is_applied(&second.key()).await.unwrap());
    assert_eq!(store.get(&token_key(chain, 2)).await.unwrap(), None);
    assert_eq!(store.raw_events(&first.stream()).await.unwrap(), vec![first]);
}

#[tokio::test]
async fn create_and_update_conflict_like_the_memory_store() {
    let Some(store) = store().await else { return };
    let chain = unique_chain();

    let missing = WriteSet {
        reads: Vec::new(),
        mutations: vec![Mutation::update(Row::Token(token(chain, 1)))],
    };
    let err = store.commit(&missing).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "unexpected error: {err}");
    assert_eq!(store.get(&token_key(chain, 1)).await.unwrap(), None);

    store.commit(&create(Row::Token(token(chain, 1)))).await.unwrap();
    let twice = WriteSet {
        reads: Vec::new(),
        mutations: vec![Mutation::create(Row::Token(token(chain, 1)))],
    };
    let err = store.commit(&twice).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "unexpected error: {err}");

    let mut moved = token(chain, 1);
    moved.owner = "0xb".into();
    store
        .commit(&WriteSet {
            reads: vec![(token_key(chain, 1), Some(Row::Token(token(chain, 1))))],
            mutations: vec![Mutation::update(Row::Token(moved.clone()))],
        })
        .await
        .unwrap();
    assert_eq!(
        store.get(&token_key(chain, 1)).await.unwrap(),
        Some(Row::Token(moved))
    );
}

#[tokio::test]
async fn truncate_and_purge_clear_one_stream() {
    let Some(store) = store().await else { return };
    let chain = unique_chain();
    let stream = StreamId::new(chain, "HoneyJar1");

    for (i, block) in [10u64, 11, 12].into_iter().enumerate() {
        let id = i as u64 + 1;
        let mut t = token(chain, id);
        t.minted_by = format!("0xminter{id}");
        let event = mint_event(chain, &format!("0x{i}"), block, id);
        store
            .commit_event(&event, &EventOutcome::Applied(create(Row::Token(t))))
            .await
            .unwrap();
    }
    let holder = Holder {
        address: "0xa".into(),
        collection: "HoneyJar1".into(),
        chain_id: chain,
        balance: 3,
        total_minted: 0,
        first_mint_time: None,
        last_activity_time: 12,
    };
    store.commit(&create(Row::Holder(holder))).await.unwrap();

    assert_eq!(store.truncate_stream(&stream, Some(10)).await.unwrap(), 2);
    let retained = store.raw_events(&stream).await.unwrap();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].block_number, 10);
    assert!(!store.is_applied(&retained[0].key()).await.unwrap());

    let scope = PurgeScope::Collection {
        collection: "HoneyJar1".into(),
        chain_id: chain,
    };
    let touched = store.purge(&scope).await.unwrap();
    let expected: BTreeSet<String> = ["0xa", "0xminter1", "0xminter2", "0xminter3"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(touched, expected);
    for id in 1..=3 {
        assert_eq!(store.get(&token_key(chain, id)).await.unwrap(), None);
    }
    assert!(store.top_holders("HoneyJar1", chain, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn last_transfer_time_covers_both_directions() {
    let Some(store) = store().await else { return };
    let chain = unique_chain();
    let record = |tx: &str, from: &str, to: &str, timestamp: i64| TransferRecord {
        collection: "HoneyJar1".into(),
        chain_id: chain,
        transaction_hash: tx.into(),
        log_index: 0,
        token_id: 1,
        from: from.into(),
        to: to.into(),
        kind: TransferKind::Transfer,
        timestamp,
        block_number: timestamp as u64,
    };
    let write = WriteSet {
        reads: Vec::new(),
        mutations: vec![
            Mutation::create(Row::TransferRecord(record("0x1", "0xb", "0xa", 5))),
            Mutation::create(Row::TransferRecord(record("0x2", "0xa", "0xc", 9))),
            Mutation::create(Row::TransferRecord(record("0x3", "0xb", "0xc", 20))),
        ],
    };
    store.commit(&write).await.unwrap();

    let key = |address: &str| HolderKey {
        collection: "HoneyJar1".into(),
        chain_id: chain,
        address: address.into(),
    };
    assert_eq!(store.last_transfer_time(&key("0xa")).await.unwrap(), Some(9));
    assert_eq!(store.last_transfer_time(&key("0xc")).await.unwrap(), Some(20));
    assert_eq!(store.last_transfer_time(&key("0xd")).await.unwrap(), None);
}
