//! Row-level change sets produced by projections and applied by stores.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::*;

/// Aggregate entity kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Entity {
    Holder,
    Token,
    UserBalance,
    CollectionStat,
    Vault,
    UserVaultSummary,
    VaultActivity,
    TransferRecord,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Holder => "holder",
            Self::Token => "token",
            Self::UserBalance => "user_balance",
            Self::CollectionStat => "collection_stat",
            Self::Vault => "vault",
            Self::UserVaultSummary => "user_vault_summary",
            Self::VaultActivity => "vault_activity",
            Self::TransferRecord => "transfer_record",
        }
    }

    /// Append-only entities are only ever created.
    pub fn is_append_only(&self) -> bool {
        matches!(self, Self::VaultActivity | Self::TransferRecord)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of any aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RowKey {
    Holder(HolderKey),
    Token(TokenKey),
    UserBalance(UserBalanceKey),
    CollectionStat(CollectionKey),
    Vault(VaultKey),
    UserVaultSummary(SummaryKey),
    VaultActivity(ActivityKey),
    TransferRecord(ActivityKey),
}

impl RowKey {
    pub fn entity(&self) -> Entity {
        match self {
            Self::Holder(_) => Entity::Holder,
            Self::Token(_) => Entity::Token,
            Self::UserBalance(_) => Entity::UserBalance,
            Self::CollectionStat(_) => Entity::CollectionStat,
            Self::Vault(_) => Entity::Vault,
            Self::UserVaultSummary(_) => Entity::UserVaultSummary,
            Self::VaultActivity(_) => Entity::VaultActivity,
            Self::TransferRecord(_) => Entity::TransferRecord,
        }
    }
}

/// A full aggregate row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Row {
    Holder(Holder),
    Token(Token),
    UserBalance(UserBalance),
    CollectionStat(CollectionStat),
    Vault(Vault),
    UserVaultSummary(UserVaultSummary),
    VaultActivity(VaultActivity),
    TransferRecord(TransferRecord),
}

impl Row {
    pub fn key(&self) -> RowKey {
        match self {
            Self::Holder(r) => RowKey::Holder(r.key()),
            Self::Token(r) => RowKey::Token(r.key()),
            Self::UserBalance(r) => RowKey::UserBalance(r.key()),
            Self::CollectionStat(r) => RowKey::CollectionStat(r.key()),
            Self::Vault(r) => RowKey::Vault(r.key()),
            Self::UserVaultSummary(r) => RowKey::UserVaultSummary(r.key()),
            Self::VaultActivity(r) => RowKey::VaultActivity(r.key()),
            Self::TransferRecord(r) => RowKey::TransferRecord(r.key()),
        }
    }

    pub fn entity(&self) -> Entity {
        self.key().entity()
    }
}

/// Typed access to one variant of [`Row`] / [`RowKey`].
pub trait Aggregate: Sized + Clone {
    type Key;

    fn row_key(key: &Self::Key) -> RowKey;
    fn from_row(row: Row) -> Option<Self>;
    fn into_row(self) -> Row;
}

macro_rules! aggregate {
    ($ty:ident, $key:ident) => {
        impl Aggregate for $ty {
            type Key = $key;

            fn row_key(key: &$key) -> RowKey {
                RowKey::$ty(key.clone())
            }

            fn from_row(row: Row) -> Option<Self> {
                match row {
                    Row::$ty(r) => Some(r),
                    _ => None,
                }
            }

            fn into_row(self) -> Row {
                Row::$ty(self)
            }
        }
    };
}

aggregate!(Holder, HolderKey);
aggregate!(Token, TokenKey);
aggregate!(UserBalance, UserBalanceKey);
aggregate!(CollectionStat, CollectionKey);
aggregate!(Vault, VaultKey);
aggregate!(UserVaultSummary, SummaryKey);
aggregate!(VaultActivity, ActivityKey);
aggregate!(TransferRecord, ActivityKey);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

/// One row change. For `Delete`, `row` is the last state of the deleted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub op: MutationOp,
    pub row: Row,
}

impl Mutation {
    pub fn create(row: Row) -> Self {
        Self { op: MutationOp::Create, row }
    }

    pub fn update(row: Row) -> Self {
        Self { op: MutationOp::Update, row }
    }

    pub fn delete(row: Row) -> Self {
        Self { op: MutationOp::Delete, row }
    }

    pub fn key(&self) -> RowKey {
        self.row.key()
    }
}

/// Mutations plus the row versions they were computed from.
///
/// A store applies the mutations only if every read still matches the
/// current row; otherwise it fails with [`crate::StoreError::Conflict`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteSet {
    pub reads: Vec<(RowKey, Option<Row>)>,
    pub mutations: Vec<Mutation>,
}

impl WriteSet {
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// What committing one event records besides its idempotency key and raw log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied(WriteSet),
    /// Invariant violation: nothing is mutated, a dead-letter row is written.
    Skipped(SkippedEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitResult {
    Committed,
    /// The idempotency key was already recorded; nothing was written.
    AlreadyApplied,
}

/// Aggregate family owned by one stream, cleared wholesale before a replay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PurgeScope {
    /// `Holder`, `Token`, `CollectionStat` and `TransferRecord` rows of one collection on one chain.
    Collection {
        collection: String,
        chain_id: jarindex_core::ChainId,
    },
    /// `Vault`, `VaultActivity` and `UserVaultSummary` rows on one chain.
    Vault { chain_id: jarindex_core::ChainId },
}
