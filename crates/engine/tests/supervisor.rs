mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use jarindex_core::{ConfigError, EventArgs};
use jarindex_engine::{StreamExit, Supervisor};
use jarindex_storage::{AggregateStore, MemoryStore, Row};
use tokio::sync::watch;

#[tokio::test]
async fn bad_contract_does_not_stop_the_others() {
    let mut table = table();
    let mut ghost = table.contracts[0].clone();
    ghost.id = "Ghost".into();
    ghost.collection = Some("Ghost".into());
    table.contracts.push(ghost);

    let source = source();
    let store = Arc::new(MemoryStore::new());
    source.mine(ETH, "HoneyJar1", vec![mint(ALICE, 1)]);
    source.mine(
        BERA,
        "MoneycombVault",
        vec![EventArgs::AccountOpened {
            user: BOB.into(),
            account_index: 0,
            honeycomb_id: 1,
        }],
    );

    let (tx, rx) = watch::channel(false);
    let supervisor = Supervisor::new(store.clone(), source.clone(), table, config());
    let handle = tokio::spawn(supervisor.run(rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let rows = store.dump().unwrap();
            let holder = rows.values().any(|r| matches!(r, Row::Holder(_)));
            let vault = rows.values().any(|r| matches!(r, Row::Vault(_)));
            if holder && vault {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("streams index their blocks");

    tx.send(true).unwrap();
    let reports = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("supervisor stops")
        .unwrap();

    assert_eq!(reports.len(), 5);
    for report in &reports {
        match (report.contract.as_str(), &report.exit) {
            ("Ghost", StreamExit::NotStarted(ConfigError::UnknownCollection { collection, .. })) => {
                assert_eq!(collection, "Ghost");
            }
            ("Ghost", other) => panic!("unexpected exit for Ghost: {other:?}"),
            (_, StreamExit::Stopped) => {}
            (contract, other) => panic!("unexpected exit for {contract}: {other:?}"),
        }
    }
    assert_eq!(
        store.top_holders("HoneyJar1", ETH, 10).await.unwrap()[0].address,
        ALICE
    );
}

#[tokio::test]
async fn duplicate_contract_ids_are_rejected() {
    let mut table = table();
    let twin = table.contracts[0].clone();
    table.contracts.push(twin);

    let supervisor = Supervisor::new(Arc::new(MemoryStore::new()), source(), table, config());
    let (projectors, rejected) = supervisor.projectors();

    assert_eq!(projectors.len(), 4);
    assert_eq!(rejected.len(), 1);
    assert!(matches!(
        &rejected[0].exit,
        StreamExit::NotStarted(ConfigError::DuplicateContract(id)) if id == "HoneyJar1"
    ));
}

#[tokio::test]
async fn long_outage_pauses_the_stream_until_the_source_recovers() {
    let source = source();
    let store = Arc::new(MemoryStore::new());
    source.mine(ETH, "HoneyJar1", vec![mint(ALICE, 1)]);
    // Several times the per-call retry budget of the test policy.
    source.fail_next(ETH, 40);

    let (tx, rx) = watch::channel(false);
    let supervisor = Supervisor::new(store.clone(), source.clone(), table(), config());
    let handle = tokio::spawn(supervisor.run(rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let rows = store.dump().unwrap();
            if rows.values().any(|r| matches!(r, Row::Holder(_))) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stream resumes after the outage");

    tx.send(true).unwrap();
    let reports = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("supervisor stops")
        .unwrap();
    assert_eq!(reports.len(), 4);
    for report in &reports {
        assert!(
            matches!(report.exit, StreamExit::Stopped),
            "unexpected exit for {}: {:?}",
            report.contract,
            report.exit
        );
    }
}
