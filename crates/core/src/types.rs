//! Chain-level value types shared by every Jarindex crate.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// EVM chain id (1 = Ethereum, 80094 = Berachain, ...).
pub type ChainId = u64;

/// Address zero, the counterparty of mints and burns.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Lowercase, trimmed form used for every stored address.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

// ─── StreamId ───────────────────────────────────────────────────────────────

/// One independently ordered ingestion stream: a contract on a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub chain_id: ChainId,
    /// Contract id from the capability table (e.g. `"HoneyJar2Bera"`).
    pub contract: String,
}

impl StreamId {
    pub fn new(chain_id: ChainId, contract: impl Into<String>) -> Self {
        Self {
            chain_id,
            contract: contract.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.contract, self.chain_id)
    }
}

// ─── EventKey ───────────────────────────────────────────────────────────────

/// Idempotency key of a decoded event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub chain_id: ChainId,
    pub transaction_hash: String,
    pub log_index: u32,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}",
            self.chain_id, self.transaction_hash, self.log_index
        )
    }
}

// ─── EventType / EventArgs ──────────────────────────────────────────────────

/// Every event type a projection exists for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Transfer,
    AccountOpened,
    HjBurned,
    SharesMinted,
    RewardClaimed,
    AccountClosed,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::Transfer,
        EventType::AccountOpened,
        EventType::HjBurned,
        EventType::SharesMinted,
        EventType::RewardClaimed,
        EventType::AccountClosed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transfer => "Transfer",
            Self::AccountOpened => "AccountOpened",
            Self::HjBurned => "HJBurned",
            Self::SharesMinted => "SharesMinted",
            Self::RewardClaimed => "RewardClaimed",
            Self::AccountClosed => "AccountClosed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown event type '{s}'"))
    }
}

/// Decoded event arguments.
///
/// Addresses are stored normalized (see [`normalize_address`]). Share and
/// reward amounts are raw `uint256` values narrowed to `u128`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventArgs {
    Transfer {
        from: String,
        to: String,
        token_id: u64,
    },
    AccountOpened {
        user: String,
        account_index: u32,
        honeycomb_id: u64,
    },
    HjBurned {
        user: String,
        account_index: u32,
        hj_gen: u8,
    },
    SharesMinted {
        user: String,
        account_index: u32,
        shares: u128,
    },
    RewardClaimed {
        user: String,
        reward: u128,
    },
    AccountClosed {
        user: String,
        account_index: u32,
        honeycomb_id: u64,
    },
}

impl EventArgs {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Transfer { .. } => EventType::Transfer,
            Self::AccountOpened { .. } => EventType::AccountOpened,
            Self::HjBurned { .. } => EventType::HjBurned,
            Self::SharesMinted { .. } => EventType::SharesMinted,
            Self::RewardClaimed { .. } => EventType::RewardClaimed,
            Self::AccountClosed { .. } => EventType::AccountClosed,
        }
    }
}

// ─── DecodedEvent ───────────────────────────────────────────────────────────

/// An immutable, already-decoded contract event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub chain_id: ChainId,
    /// Contract id from the capability table, not the on-chain address.
    pub contract: String,
    pub block_number: u64,
    pub block_hash: String,
    pub parent_hash: String,
    pub log_index: u32,
    pub transaction_hash: String,
    /// Block timestamp, unix seconds.
    pub timestamp: i64,
    pub args: EventArgs,
}

impl DecodedEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            chain_id: self.chain_id,
            transaction_hash: self.transaction_hash.clone(),
            log_index: self.log_index,
        }
    }

    pub fn stream(&self) -> StreamId {
        StreamId::new(self.chain_id, self.contract.clone())
    }

    pub fn event_type(&self) -> EventType {
        self.args.event_type()
    }

    /// Ordering position inside a stream.
    pub fn position(&self) -> (u64, u32) {
        (self.block_number, self.log_index)
    }
}

// ─── BlockHeader ────────────────────────────────────────────────────────────

/// The slice of a block header the engine needs for reorg detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain_id: ChainId,
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
}

impl BlockHeader {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockHeader) -> bool {
        self.chain_id == parent.chain_id
            && self.number == parent.number + 1
            && self.parent_hash == parent.hash
    }
}
