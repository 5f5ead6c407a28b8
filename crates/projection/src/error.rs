use jarindex_core::EventType;
use thiserror::Error;

/// An event that cannot be applied without breaking an aggregate invariant.
///
/// These point at an upstream data or mapping bug. The event is skipped and
/// recorded; the stream keeps going.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("token #{token_id} minted twice")]
    DuplicateMint { token_id: u64 },

    #[error("transfer of unknown token #{token_id}")]
    UnknownToken { token_id: u64 },

    #[error("transfer of burned token #{token_id}")]
    TokenBurned { token_id: u64 },

    #[error("token #{token_id} is owned by {owner}, not {from}")]
    OwnerMismatch {
        token_id: u64,
        owner: String,
        from: String,
    },

    #[error("{address} has no balance to debit")]
    BalanceUnderflow { address: String },

    #[error("transfer from and to the zero address")]
    ZeroToZero,

    #[error("vault {user}#{account_index} does not exist")]
    UnknownVault { user: String, account_index: u32 },

    #[error("vault {user}#{account_index} already exists")]
    VaultExists { user: String, account_index: u32 },

    #[error("vault {user}#{account_index} is already closed")]
    VaultClosed { user: String, account_index: u32 },

    #[error("honey jar generation {0} is outside 1..=6")]
    InvalidGeneration(u8),

    #[error("{0} would overflow or underflow")]
    Overflow(&'static str),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProjectionError {
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    /// The contract has no projection for this event type.
    #[error("no projection for {0} events on this contract")]
    Unsupported(EventType),

    /// Programming error: unread row, mismatched arguments, missing binding.
    #[error("projection bug: {0}")]
    Internal(String),
}

impl ProjectionError {
    pub fn is_invariant(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}
