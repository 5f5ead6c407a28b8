//! jarindex indexer: materialises Honey Jar, Honeycomb and Moneycomb vault
//! aggregates from on-chain events.
//!
//! Flow:
//! 1. Load settings and the capability table
//! 2. Open the aggregate store (PostgreSQL, or in-memory for dry runs)
//! 3. Connect one RPC provider per configured chain
//! 4. Run one worker per contract stream until ctrl-c
//!
//! Each worker applies events idempotently, advances its cursor after the
//! events are durable and rolls back by replay when its chain reorganises.

use std::sync::Arc;

use eyre::Result;
use jarindex_chain::RpcLogSource;
use jarindex_core::{CapabilityTable, Settings, StoreKind, telemetry};
use jarindex_engine::{EngineConfig, StreamExit, StreamReport, Supervisor};
use jarindex_storage::{self as storage, AggregateStore, CursorStore, MemoryStore, PgStore};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Initialisation ──────────────────────────────────────────────────
    telemetry::init();
    let settings = Settings::from_env()?;

    let table = CapabilityTable::load(&settings.contracts_file)?;
    tracing::info!(
        file = %settings.contracts_file.display(),
        chains = table.chains.len(),
        contracts = table.contracts.len(),
        store = ?settings.store,
        "Starting jarindex indexer"
    );
    for problem in table.validate() {
        tracing::warn!(error = %problem, "Capability table problem");
    }

    let source = Arc::new(RpcLogSource::connect(&table, &settings)?);

    match settings.store {
        StoreKind::Postgres => {
            let pool = storage::connect(&settings.database_url).await?;
            tracing::info!("Connected to database");
            storage::migrate(&pool).await?;
            tracing::info!("Database migrations applied");
            run(Arc::new(PgStore::new(pool)), source, table, &settings).await
        }
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory store; aggregates are lost on exit");
            run(Arc::new(MemoryStore::new()), source, table, &settings).await
        }
    }
}

async fn run<S>(
    store: Arc<S>,
    source: Arc<RpcLogSource>,
    table: CapabilityTable,
    settings: &Settings,
) -> Result<()>
where
    S: AggregateStore + CursorStore + 'static,
{
    if settings.force_reindex {
        tracing::warn!("FORCE_REINDEX set: clearing aggregates, raw log and cursors");
        store.reset().await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutting down gracefully…");
                shutdown_tx.send(true).ok();
            }
            Err(e) => {
                // Keep the sender alive so workers are not told to stop.
                tracing::error!(error = %e, "Cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    });

    let config = EngineConfig::from_settings(settings);
    let reports = Supervisor::new(store, source, table, config)
        .run(shutdown_rx)
        .await;

    summarize(&reports)
}

/// Log how every stream ended; fail the process if any did not stop cleanly.
fn summarize(reports: &[StreamReport]) -> Result<()> {
    let mut unhealthy = 0usize;
    for report in reports {
        match &report.exit {
            StreamExit::Stopped => tracing::info!(contract = %report.contract, "Stream stopped"),
            StreamExit::Failed(e) => {
                unhealthy += 1;
                tracing::error!(contract = %report.contract, error = %e, "Stream failed");
            }
            StreamExit::NotStarted(e) => {
                unhealthy += 1;
                tracing::error!(contract = %report.contract, error = %e, "Stream never started");
            }
            StreamExit::Panicked(e) => {
                unhealthy += 1;
                tracing::error!(contract = %report.contract, error = %e, "Stream panicked");
            }
        }
    }

    tracing::info!(streams = reports.len(), unhealthy, "Indexer stopped.");
    if unhealthy > 0 {
        eyre::bail!("{unhealthy} of {} streams did not stop cleanly", reports.len());
    }
    Ok(())
}
