use thiserror::Error;

use crate::types::ChainId;

/// Failures reported by a [`crate::LogSource`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Network blip, rate limit or node overload. Safe to retry.
    #[error("transient log source failure: {0}")]
    Transient(String),

    #[error("block {number} on chain {chain_id} is not available")]
    MissingBlock { chain_id: ChainId, number: u64 },

    #[error("no log source configured for chain {0}")]
    UnknownChain(ChainId),

    #[error("decode error: {0}")]
    Decode(String),
}

impl SourceError {
    /// Returns `true` if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::MissingBlock { .. })
    }
}

/// Configuration problems. Fatal for the stream they concern, never for the process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown contract '{0}'")]
    UnknownContract(String),

    #[error("duplicate contract id '{0}'")]
    DuplicateContract(String),

    #[error("contract '{contract}' is on unconfigured chain {chain_id}")]
    UnknownChain { contract: String, chain_id: ChainId },

    #[error("contract '{contract}' references unknown collection '{collection}'")]
    UnknownCollection { contract: String, collection: String },

    #[error("collection contract '{0}' has no collection mapping")]
    MissingCollection(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_are_transient() {
        assert!(SourceError::Transient("503".into()).is_transient());
        assert!(SourceError::MissingBlock { chain_id: 1, number: 7 }.is_transient());
        assert!(!SourceError::Decode("bad topic".into()).is_transient());
        assert!(!SourceError::UnknownChain(10).is_transient());
    }

    #[test]
    fn config_errors_name_the_contract() {
        let err = ConfigError::UnknownCollection {
            contract: "HoneyJar9".into(),
            collection: "Ghost".into(),
        };
        assert_eq!(
            err.to_string(),
            "contract 'HoneyJar9' references unknown collection 'Ghost'"
        );
    }
}
