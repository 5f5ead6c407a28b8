use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use jarindex_core::{ChainId, EventKey, StreamId};
use serde::{Deserialize, Serialize};

// ─── Holder ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HolderKey {
    pub collection: String,
    pub chain_id: ChainId,
    pub address: String,
}

/// Current owner of at least one token of a collection on one chain.
///
/// Rows never sit at zero: the row is deleted when `balance` drops to 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub address: String,
    pub collection: String,
    pub chain_id: ChainId,
    pub balance: u64,
    pub total_minted: u64,
    pub first_mint_time: Option<i64>,
    pub last_activity_time: i64,
}

impl Holder {
    pub fn key(&self) -> HolderKey {
        HolderKey {
            collection: self.collection.clone(),
            chain_id: self.chain_id,
            address: self.address.clone(),
        }
    }
}

// ─── Token ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenKey {
    pub collection: String,
    pub chain_id: ChainId,
    pub token_id: u64,
}

/// A single NFT. Created once at its first-seen mint and never re-created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub collection: String,
    pub chain_id: ChainId,
    pub token_id: u64,
    pub owner: String,
    pub minted_by: String,
    pub is_burned: bool,
    pub minted_at: i64,
    pub last_transfer_time: i64,
}

impl Token {
    pub fn key(&self) -> TokenKey {
        TokenKey {
            collection: self.collection.clone(),
            chain_id: self.chain_id,
            token_id: self.token_id,
        }
    }
}

// ─── UserBalance ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserBalanceKey {
    pub address: String,
    pub generation: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBucket {
    pub balance: u64,
    pub minted: u64,
}

/// Cross-chain rollup of one wallet's holdings of one Honey Jar generation.
///
/// Always re-derivable from `Holder` balances and `Token.minted_by` tallies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserBalance {
    pub address: String,
    pub generation: u8,
    pub home_chain_id: ChainId,
    /// Only chains with a non-zero balance or mint tally are present.
    pub buckets: BTreeMap<ChainId, ChainBucket>,
    pub balance_total: u64,
    pub minted_total: u64,
    pub last_activity_time: i64,
}

impl UserBalance {
    pub fn key(&self) -> UserBalanceKey {
        UserBalanceKey {
            address: self.address.clone(),
            generation: self.generation,
        }
    }

    pub fn bucket(&self, chain_id: ChainId) -> ChainBucket {
        self.buckets.get(&chain_id).copied().unwrap_or_default()
    }

    /// Holdings on the generation's home chain.
    pub fn home(&self) -> ChainBucket {
        self.bucket(self.home_chain_id)
    }
}

// ─── CollectionStat ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionKey {
    pub collection: String,
    pub chain_id: ChainId,
}

/// Supply and holder counts of one collection on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStat {
    pub collection: String,
    pub chain_id: ChainId,
    pub total_supply: u64,
    pub total_minted: u64,
    pub total_burned: u64,
    pub unique_holders: u64,
    pub last_mint_time: Option<i64>,
}

impl CollectionStat {
    pub fn empty(key: &CollectionKey) -> Self {
        Self {
            collection: key.collection.clone(),
            chain_id: key.chain_id,
            total_supply: 0,
            total_minted: 0,
            total_burned: 0,
            unique_holders: 0,
            last_mint_time: None,
        }
    }

    pub fn key(&self) -> CollectionKey {
        CollectionKey {
            collection: self.collection.clone(),
            chain_id: self.chain_id,
        }
    }
}

// ─── Vault ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VaultKey {
    pub chain_id: ChainId,
    pub user: String,
    pub account_index: u32,
}

/// Set of Honey Jar generations (1..=6) burned into a vault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BurnedGenerations(u8);

impl BurnedGenerations {
    pub const MAX_GENERATION: u8 = 6;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0b0011_1111)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Returns `false` for generations outside `1..=6`.
    pub fn insert(&mut self, generation: u8) -> bool {
        if !(1..=Self::MAX_GENERATION).contains(&generation) {
            return false;
        }
        self.0 |= 1 << (generation - 1);
        true
    }

    pub fn contains(&self, generation: u8) -> bool {
        (1..=Self::MAX_GENERATION).contains(&generation) && self.0 & (1 << (generation - 1)) != 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (1..=Self::MAX_GENERATION).filter(|g| self.contains(*g))
    }
}

/// A Moneycomb vault account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub user: String,
    pub account_index: u32,
    pub chain_id: ChainId,
    pub honeycomb_id: u64,
    pub is_active: bool,
    pub shares: u128,
    pub total_burned: u32,
    pub burned_generations: BurnedGenerations,
    pub created_at: i64,
    pub closed_at: Option<i64>,
    pub last_activity_time: i64,
}

impl Vault {
    pub fn key(&self) -> VaultKey {
        VaultKey {
            chain_id: self.chain_id,
            user: self.user.clone(),
            account_index: self.account_index,
        }
    }
}

// ─── Activity records ───────────────────────────────────────────────────────

/// Key of an append-only activity record: the event that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityKey {
    pub chain_id: ChainId,
    pub transaction_hash: String,
    pub log_index: u32,
}

impl From<&EventKey> for ActivityKey {
    fn from(key: &EventKey) -> Self {
        Self {
            chain_id: key.chain_id,
            transaction_hash: key.transaction_hash.clone(),
            log_index: key.log_index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultActivityKind {
    Opened,
    Burned,
    SharesMinted,
    Claimed,
    Closed,
}

impl VaultActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Burned => "burned",
            Self::SharesMinted => "shares_minted",
            Self::Claimed => "claimed",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "opened" => Self::Opened,
            "burned" => Self::Burned,
            "shares_minted" => Self::SharesMinted,
            "claimed" => Self::Claimed,
            "closed" => Self::Closed,
            _ => return None,
        })
    }
}

/// An immutable vault state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultActivity {
    pub chain_id: ChainId,
    pub transaction_hash: String,
    pub log_index: u32,
    pub user: String,
    /// `None` for reward claims, which are not tied to one account.
    pub account_index: Option<u32>,
    pub kind: VaultActivityKind,
    pub timestamp: i64,
    pub block_number: u64,
    pub honeycomb_id: Option<u64>,
    pub hj_gen: Option<u8>,
    pub shares: Option<u128>,
    pub reward: Option<u128>,
}

impl VaultActivity {
    pub fn key(&self) -> ActivityKey {
        ActivityKey {
            chain_id: self.chain_id,
            transaction_hash: self.transaction_hash.clone(),
            log_index: self.log_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SummaryKey {
    pub chain_id: ChainId,
    pub user: String,
}

/// Rollup over all of a user's vaults on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserVaultSummary {
    pub user: String,
    pub chain_id: ChainId,
    pub total_vaults: u64,
    pub active_vaults: u64,
    pub total_shares: u128,
    pub total_rewards_claimed: u128,
    pub total_hjs_burned: u64,
    pub first_vault_time: Option<i64>,
    pub last_activity_time: i64,
}

impl UserVaultSummary {
    pub fn empty(key: &SummaryKey) -> Self {
        Self {
            user: key.user.clone(),
            chain_id: key.chain_id,
            total_vaults: 0,
            active_vaults: 0,
            total_shares: 0,
            total_rewards_claimed: 0,
            total_hjs_burned: 0,
            first_vault_time: None,
            last_activity_time: 0,
        }
    }

    pub fn key(&self) -> SummaryKey {
        SummaryKey {
            chain_id: self.chain_id,
            user: self.user.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Mint,
    Burn,
    Transfer,
    BridgeOut,
    BridgeIn,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mint => "mint",
            Self::Burn => "burn",
            Self::Transfer => "transfer",
            Self::BridgeOut => "bridge_out",
            Self::BridgeIn => "bridge_in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "mint" => Self::Mint,
            "burn" => Self::Burn,
            "transfer" => Self::Transfer,
            "bridge_out" => Self::BridgeOut,
            "bridge_in" => Self::BridgeIn,
            _ => return None,
        })
    }
}

/// An immutable record of an NFT movement (mint, burn, transfer or bridge hop).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub collection: String,
    pub chain_id: ChainId,
    pub transaction_hash: String,
    pub log_index: u32,
    pub token_id: u64,
    pub from: String,
    pub to: String,
    pub kind: TransferKind,
    pub timestamp: i64,
    pub block_number: u64,
}

impl TransferRecord {
    pub fn key(&self) -> ActivityKey {
        ActivityKey {
            chain_id: self.chain_id,
            transaction_hash: self.transaction_hash.clone(),
            log_index: self.log_index,
        }
    }
}

// ─── Ingestion bookkeeping ──────────────────────────────────────────────────

/// An event that was skipped because applying it would break an aggregate invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEvent {
    pub key: EventKey,
    pub contract: String,
    pub block_number: u64,
    pub reason: String,
}

impl SkippedEvent {
    pub fn stream(&self) -> StreamId {
        StreamId::new(self.key.chain_id, self.contract.clone())
    }
}

/// Durable ingestion progress of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub stream: StreamId,
    pub block_number: u64,
    pub block_hash: String,
    /// Last applied log index inside `block_number`, if the block had events.
    pub log_index: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// A block header a stream has advanced through, kept for reorg walk-back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedBlock {
    pub stream: StreamId,
    pub block_number: u64,
    pub block_hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burned_generations_accepts_only_one_through_six() {
        let mut gens = BurnedGenerations::default();
        assert!(gens.insert(1));
        assert!(gens.insert(6));
        assert!(!gens.insert(0));
        assert!(!gens.insert(7));
        assert!(gens.contains(6));
        assert!(!gens.contains(3));
        assert_eq!(gens.iter().collect::<Vec<_>>(), vec![1, 6]);
        assert_eq!(BurnedGenerations::from_bits(gens.bits()), gens);
    }

    #[test]
    fn user_balance_buckets_default_to_zero() {
        let mut buckets = BTreeMap::new();
        buckets.insert(80094, ChainBucket { balance: 2, minted: 0 });
        let ub = UserBalance {
            address: "0xa".into(),
            generation: 2,
            home_chain_id: 42161,
            buckets,
            balance_total: 2,
            minted_total: 0,
            last_activity_time: 0,
        };
        assert_eq!(ub.home(), ChainBucket::default());
        assert_eq!(ub.bucket(80094).balance, 2);
    }

    #[test]
    fn kind_strings_parse_back() {
        for kind in [
            TransferKind::Mint,
            TransferKind::Burn,
            TransferKind::Transfer,
            TransferKind::BridgeOut,
            TransferKind::BridgeIn,
        ] {
            assert_eq!(TransferKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(VaultActivityKind::parse("shares_minted"), Some(VaultActivityKind::SharesMinted));
        assert_eq!(VaultActivityKind::parse("bogus"), None);
    }
}
