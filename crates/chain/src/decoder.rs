use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use jarindex_core::{ContractKind, EventArgs, SourceError};
use tracing::warn;

use crate::abi::{HoneyJar, MoneycombVault};

/// Topic-0 hashes worth fetching for a contract of `kind`.
pub fn signatures(kind: ContractKind) -> Vec<B256> {
    match kind {
        ContractKind::Collection => vec![HoneyJar::Transfer::SIGNATURE_HASH],
        ContractKind::Vault => vec![
            MoneycombVault::AccountOpened::SIGNATURE_HASH,
            MoneycombVault::HJBurned::SIGNATURE_HASH,
            MoneycombVault::SharesMinted::SIGNATURE_HASH,
            MoneycombVault::RewardClaimed::SIGNATURE_HASH,
            MoneycombVault::AccountClosed::SIGNATURE_HASH,
        ],
    }
}

fn hex(address: Address) -> String {
    format!("{address:#x}")
}

fn narrow<T: TryFrom<U256>>(value: U256, field: &str) -> Result<T, SourceError> {
    T::try_from(value).map_err(|_| SourceError::Decode(format!("{field} {value} out of range")))
}

fn decode<E: SolEvent>(log: &Log) -> Result<E, SourceError> {
    log.log_decode::<E>()
        .map(|decoded| decoded.inner.data)
        .map_err(|e| SourceError::Decode(format!("{}: {e}", E::SIGNATURE)))
}

/// Decode a log emitted by a contract of `kind`.
///
/// Returns `Ok(None)` for events no projection consumes (approvals and the
/// like). A log whose topic matches but whose payload does not is an error.
pub fn decode_log(kind: ContractKind, log: &Log) -> Result<Option<EventArgs>, SourceError> {
    let Some(topic0) = log.topic0().copied() else {
        return Ok(None);
    };

    let args = match kind {
        ContractKind::Collection if topic0 == HoneyJar::Transfer::SIGNATURE_HASH => {
            let d = decode::<HoneyJar::Transfer>(log)?;
            EventArgs::Transfer {
                from: hex(d.from),
                to: hex(d.to),
                token_id: narrow(d.tokenId, "tokenId")?,
            }
        }
        ContractKind::Vault if topic0 == MoneycombVault::AccountOpened::SIGNATURE_HASH => {
            let d = decode::<MoneycombVault::AccountOpened>(log)?;
            EventArgs::AccountOpened {
                user: hex(d.user),
                account_index: narrow(d.accountIndex, "accountIndex")?,
                honeycomb_id: narrow(d.honeycombId, "honeycombId")?,
            }
        }
        ContractKind::Vault if topic0 == MoneycombVault::HJBurned::SIGNATURE_HASH => {
            let d = decode::<MoneycombVault::HJBurned>(log)?;
            EventArgs::HjBurned {
                user: hex(d.user),
                account_index: narrow(d.accountIndex, "accountIndex")?,
                hj_gen: d.hjGen,
            }
        }
        ContractKind::Vault if topic0 == MoneycombVault::SharesMinted::SIGNATURE_HASH => {
            let d = decode::<MoneycombVault::SharesMinted>(log)?;
            EventArgs::SharesMinted {
                user: hex(d.user),
                account_index: narrow(d.accountIndex, "accountIndex")?,
                shares: narrow(d.shares, "shares")?,
            }
        }
        ContractKind::Vault if topic0 == MoneycombVault::RewardClaimed::SIGNATURE_HASH => {
            let d = decode::<MoneycombVault::RewardClaimed>(log)?;
            EventArgs::RewardClaimed {
                user: hex(d.user),
                reward: narrow(d.reward, "reward")?,
            }
        }
        ContractKind::Vault if topic0 == MoneycombVault::AccountClosed::SIGNATURE_HASH => {
            let d = decode::<MoneycombVault::AccountClosed>(log)?;
            EventArgs::AccountClosed {
                user: hex(d.user),
                account_index: narrow(d.accountIndex, "accountIndex")?,
                honeycomb_id: narrow(d.honeycombId, "honeycombId")?,
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(args))
}

/// [`decode_log`] for ingestion: a malformed log is reported and dropped so
/// the rest of its range still applies.
pub fn decode_or_skip(kind: ContractKind, log: &Log) -> Option<EventArgs> {
    match decode_log(kind, log) {
        Ok(args) => args,
        Err(err) => {
            warn!(
                block = ?log.block_number,
                log_index = ?log.log_index,
                tx = ?log.transaction_hash,
                error = %err,
                "Skipping undecodable log"
            );
            None
        }
    }
}
