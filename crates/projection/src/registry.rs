//! Static dispatch table from `(contract kind, event type)` to a projection.

use jarindex_core::{ConfigError, ContractBinding, ContractKind, DecodedEvent, EventType};
use jarindex_storage::{Mutation, PurgeScope, WriteSet};

use crate::error::ProjectionError;
use crate::snapshot::{ReadSet, Snapshot};
use crate::{transfer, vault};

pub type ReadsFn = fn(&DecodedEvent, &ContractBinding) -> Result<ReadSet, ProjectionError>;
pub type ProjectFn =
    fn(&DecodedEvent, &ContractBinding, &Snapshot) -> Result<Vec<Mutation>, ProjectionError>;

/// A pure event handler: what it reads, and what it writes given those reads.
#[derive(Clone, Copy)]
pub struct Projection {
    pub name: &'static str,
    pub reads: ReadsFn,
    pub project: ProjectFn,
}

impl std::fmt::Debug for Projection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Projection").field("name", &self.name).finish()
    }
}

const TABLE: &[(ContractKind, EventType, Projection)] = &[
    (
        ContractKind::Collection,
        EventType::Transfer,
        Projection {
            name: "nft_transfer",
            reads: transfer::reads,
            project: transfer::project,
        },
    ),
    (
        ContractKind::Vault,
        EventType::AccountOpened,
        Projection {
            name: "vault_account_opened",
            reads: vault::reads,
            project: vault::project,
        },
    ),
    (
        ContractKind::Vault,
        EventType::HjBurned,
        Projection {
            name: "vault_hj_burned",
            reads: vault::reads,
            project: vault::project,
        },
    ),
    (
        ContractKind::Vault,
        EventType::SharesMinted,
        Projection {
            name: "vault_shares_minted",
            reads: vault::reads,
            project: vault::project,
        },
    ),
    (
        ContractKind::Vault,
        EventType::RewardClaimed,
        Projection {
            name: "vault_reward_claimed",
            reads: vault::reads,
            project: vault::project,
        },
    ),
    (
        ContractKind::Vault,
        EventType::AccountClosed,
        Projection {
            name: "vault_account_closed",
            reads: vault::reads,
            project: vault::project,
        },
    ),
];

/// The projection registered for `event_type` on contracts of `kind`.
pub fn lookup(kind: ContractKind, event_type: EventType) -> Option<&'static Projection> {
    TABLE
        .iter()
        .find(|(k, t, _)| *k == kind && *t == event_type)
        .map(|(_, _, p)| p)
}

/// Event types a contract of `kind` emits that something consumes.
pub fn event_types(kind: ContractKind) -> Vec<EventType> {
    TABLE
        .iter()
        .filter(|(k, _, _)| *k == kind)
        .map(|(_, t, _)| *t)
        .collect()
}

/// Projections bound to one stream's contract.
#[derive(Debug, Clone)]
pub struct StreamProjector {
    binding: ContractBinding,
}

impl StreamProjector {
    /// Fails for a collection contract without a collection binding.
    pub fn resolve(binding: ContractBinding) -> Result<Self, ConfigError> {
        if binding.contract.kind == ContractKind::Collection && binding.collection.is_none() {
            return Err(ConfigError::MissingCollection(binding.contract.id.clone()));
        }
        Ok(Self { binding })
    }

    pub fn binding(&self) -> &ContractBinding {
        &self.binding
    }

    pub fn event_types(&self) -> Vec<EventType> {
        event_types(self.binding.contract.kind)
    }

    fn projection(&self, event: &DecodedEvent) -> Result<&'static Projection, ProjectionError> {
        lookup(self.binding.contract.kind, event.event_type())
            .ok_or(ProjectionError::Unsupported(event.event_type()))
    }

    /// Everything [`Self::project`] will read for `event`.
    pub fn read_set(&self, event: &DecodedEvent) -> Result<ReadSet, ProjectionError> {
        (self.projection(event)?.reads)(event, &self.binding)
    }

    /// Run the projection against a snapshot of [`Self::read_set`].
    pub fn project(&self, event: &DecodedEvent, snapshot: &Snapshot) -> Result<WriteSet, ProjectionError> {
        let mutations = (self.projection(event)?.project)(event, &self.binding, snapshot)?;
        Ok(WriteSet {
            reads: snapshot.reads(),
            mutations,
        })
    }

    /// The aggregate family this stream writes, cleared before a replay.
    pub fn purge_scope(&self) -> PurgeScope {
        match &self.binding.collection {
            Some(collection) => PurgeScope::Collection {
                collection: collection.name.clone(),
                chain_id: self.binding.chain_id(),
            },
            None => PurgeScope::Vault {
                chain_id: self.binding.chain_id(),
            },
        }
    }
}
