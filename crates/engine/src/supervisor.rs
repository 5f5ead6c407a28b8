//! Spawns one worker per configured stream and waits for all of them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use jarindex_core::{CapabilityTable, ConfigError, LogSource};
use jarindex_projection::StreamProjector;
use jarindex_storage::{AggregateStore, CursorStore};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, info_span};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::worker::StreamWorker;

/// How a stream's worker ended.
#[derive(Debug)]
pub enum StreamExit {
    /// Shut down on request.
    Stopped,
    Failed(EngineError),
    /// Never started because its configuration is unusable.
    NotStarted(ConfigError),
    Panicked(String),
}

#[derive(Debug)]
pub struct StreamReport {
    pub contract: String,
    pub exit: StreamExit,
}

pub struct Supervisor<S, L> {
    store: Arc<S>,
    source: Arc<L>,
    table: CapabilityTable,
    config: EngineConfig,
}

impl<S, L> Supervisor<S, L>
where
    S: AggregateStore + CursorStore + 'static,
    L: LogSource + 'static,
{
    pub fn new(store: Arc<S>, source: Arc<L>, table: CapabilityTable, config: EngineConfig) -> Self {
        Self {
            store,
            source,
            table,
            config,
        }
    }

    /// Resolve every contract of the table into a projector. A contract that
    /// fails to resolve is reported and left out; the others still run.
    pub fn projectors(&self) -> (Vec<StreamProjector>, Vec<StreamReport>) {
        let mut seen = HashSet::new();
        let mut projectors = Vec::new();
        let mut rejected = Vec::new();

        for contract in &self.table.contracts {
            let resolved = if seen.insert(contract.id.as_str()) {
                self.table
                    .resolve(&contract.id)
                    .and_then(StreamProjector::resolve)
            } else {
                Err(ConfigError::DuplicateContract(contract.id.clone()))
            };
            match resolved {
                Ok(projector) => projectors.push(projector),
                Err(err) => {
                    error!(contract = %contract.id, error = %err, "Stream not started");
                    rejected.push(StreamReport {
                        contract: contract.id.clone(),
                        exit: StreamExit::NotStarted(err),
                    });
                }
            }
        }
        (projectors, rejected)
    }

    /// Run every stream until shutdown. A failing stream is reported and does
    /// not stop the others.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Vec<StreamReport> {
        let (projectors, mut reports) = self.projectors();
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();

        for projector in projectors {
            let contract = projector.binding().contract.id.clone();
            let stream = projector.binding().stream();
            let worker = StreamWorker::new(
                self.store.clone(),
                self.source.clone(),
                projector,
                self.config.clone(),
                shutdown.clone(),
            );
            let name = contract.clone();
            let handle = tasks.spawn(
                async move { (contract, worker.run().await) }
                    .instrument(info_span!("stream", %stream)),
            );
            names.insert(handle.id(), name);
        }
        info!(streams = tasks.len(), "Supervisor started");

        while let Some(joined) = tasks.join_next().await {
            let report = match joined {
                Ok((contract, Ok(()))) => StreamReport {
                    contract,
                    exit: StreamExit::Stopped,
                },
                Ok((contract, Err(err))) => {
                    error!(%contract, error = %err, "Stream worker halted");
                    StreamReport {
                        contract,
                        exit: StreamExit::Failed(err),
                    }
                }
                Err(join_err) => {
                    let contract = names.remove(&join_err.id()).unwrap_or_default();
                    error!(%contract, error = %join_err, "Stream worker panicked");
                    StreamReport {
                        contract,
                        exit: StreamExit::Panicked(join_err.to_string()),
                    }
                }
            };
            reports.push(report);
        }
        reports
    }
}
