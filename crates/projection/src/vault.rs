//! Moneycomb vault projections.
//!
//! Every handler appends one immutable [`VaultActivity`] keyed by the event
//! and touches the per-chain [`UserVaultSummary`] of the user.

use jarindex_core::{ChainId, ContractBinding, DecodedEvent, EventArgs};
use jarindex_storage::Mutation;
use jarindex_storage::models::{
    BurnedGenerations, SummaryKey, UserVaultSummary, Vault, VaultActivity, VaultActivityKind,
    VaultKey,
};

use crate::error::{InvariantViolation, ProjectionError};
use crate::snapshot::{ReadSet, Snapshot, WorkingSet};

/// The account an event addresses, if any.
fn account(event: &DecodedEvent) -> (&str, Option<u32>) {
    match &event.args {
        EventArgs::AccountOpened {
            user, account_index, ..
        }
        | EventArgs::HjBurned {
            user, account_index, ..
        }
        | EventArgs::SharesMinted {
            user, account_index, ..
        }
        | EventArgs::AccountClosed {
            user, account_index, ..
        } => (user, Some(*account_index)),
        EventArgs::RewardClaimed { user, .. } => (user, None),
        EventArgs::Transfer { from, .. } => (from, None),
    }
}

fn vault_key(chain_id: ChainId, user: &str, account_index: u32) -> VaultKey {
    VaultKey {
        chain_id,
        user: user.to_string(),
        account_index,
    }
}

fn summary_key(chain_id: ChainId, user: &str) -> SummaryKey {
    SummaryKey {
        chain_id,
        user: user.to_string(),
    }
}

pub fn reads(event: &DecodedEvent, _binding: &ContractBinding) -> Result<ReadSet, ProjectionError> {
    if matches!(event.args, EventArgs::Transfer { .. }) {
        return Err(ProjectionError::Internal(
            "vault projection got Transfer arguments".into(),
        ));
    }
    let (user, account_index) = account(event);
    let mut reads = ReadSet::default();
    reads.row::<UserVaultSummary>(&summary_key(event.chain_id, user));
    if let Some(index) = account_index {
        reads.row::<Vault>(&vault_key(event.chain_id, user, index));
    }
    Ok(reads)
}

pub fn project(
    event: &DecodedEvent,
    _binding: &ContractBinding,
    snapshot: &Snapshot,
) -> Result<Vec<Mutation>, ProjectionError> {
    let mut ws = WorkingSet::new(snapshot);
    let ts = event.timestamp;
    let mut activity = VaultActivity {
        chain_id: event.chain_id,
        transaction_hash: event.transaction_hash.clone(),
        log_index: event.log_index,
        user: String::new(),
        account_index: None,
        kind: VaultActivityKind::Opened,
        timestamp: ts,
        block_number: event.block_number,
        honeycomb_id: None,
        hj_gen: None,
        shares: None,
        reward: None,
    };

    match &event.args {
        EventArgs::AccountOpened {
            user,
            account_index,
            honeycomb_id,
        } => {
            let key = vault_key(event.chain_id, user, *account_index);
            if ws.get::<Vault>(&key)?.is_some() {
                return Err(InvariantViolation::VaultExists {
                    user: user.clone(),
                    account_index: *account_index,
                }
                .into());
            }
            ws.put(Vault {
                user: user.clone(),
                account_index: *account_index,
                chain_id: event.chain_id,
                honeycomb_id: *honeycomb_id,
                is_active: true,
                shares: 0,
                total_burned: 0,
                burned_generations: BurnedGenerations::default(),
                created_at: ts,
                closed_at: None,
                last_activity_time: ts,
            });

            let mut summary = summary(&ws, event.chain_id, user)?;
            summary.total_vaults += 1;
            summary.active_vaults += 1;
            summary.first_vault_time.get_or_insert(ts);
            summary.last_activity_time = ts;
            ws.put(summary);

            activity.kind = VaultActivityKind::Opened;
            activity.honeycomb_id = Some(*honeycomb_id);
        }

        EventArgs::HjBurned {
            user,
            account_index,
            hj_gen,
        } => {
            let mut vault = active_vault(&ws, event.chain_id, user, *account_index)?;
            if !vault.burned_generations.insert(*hj_gen) {
                return Err(InvariantViolation::InvalidGeneration(*hj_gen).into());
            }
            vault.total_burned = vault
                .total_burned
                .checked_add(1)
                .ok_or(InvariantViolation::Overflow("vault total_burned"))?;
            vault.last_activity_time = ts;
            ws.put(vault);

            let mut summary = summary(&ws, event.chain_id, user)?;
            summary.total_hjs_burned += 1;
            summary.last_activity_time = ts;
            ws.put(summary);

            activity.kind = VaultActivityKind::Burned;
            activity.hj_gen = Some(*hj_gen);
        }

        EventArgs::SharesMinted {
            user,
            account_index,
            shares,
        } => {
            let mut vault = active_vault(&ws, event.chain_id, user, *account_index)?;
            vault.shares = vault
                .shares
                .checked_add(*shares)
                .ok_or(InvariantViolation::Overflow("vault shares"))?;
            vault.last_activity_time = ts;
            ws.put(vault);

            let mut summary = summary(&ws, event.chain_id, user)?;
            summary.total_shares = summary
                .total_shares
                .checked_add(*shares)
                .ok_or(InvariantViolation::Overflow("total_shares"))?;
            summary.last_activity_time = ts;
            ws.put(summary);

            activity.kind = VaultActivityKind::SharesMinted;
            activity.shares = Some(*shares);
        }

        EventArgs::RewardClaimed { user, reward } => {
            let mut summary = summary(&ws, event.chain_id, user)?;
            summary.total_rewards_claimed = summary
                .total_rewards_claimed
                .checked_add(*reward)
                .ok_or(InvariantViolation::Overflow("total_rewards_claimed"))?;
            summary.last_activity_time = ts;
            ws.put(summary);

            activity.kind = VaultActivityKind::Claimed;
            activity.reward = Some(*reward);
        }

        EventArgs::AccountClosed {
            user,
            account_index,
            honeycomb_id,
        } => {
            let mut vault = active_vault(&ws, event.chain_id, user, *account_index)?;
            vault.is_active = false;
            vault.closed_at = Some(ts);
            vault.last_activity_time = ts;
            ws.put(vault);

            let mut summary = summary(&ws, event.chain_id, user)?;
            summary.active_vaults = summary
                .active_vaults
                .checked_sub(1)
                .ok_or(InvariantViolation::Overflow("active_vaults"))?;
            summary.last_activity_time = ts;
            ws.put(summary);

            activity.kind = VaultActivityKind::Closed;
            activity.honeycomb_id = Some(*honeycomb_id);
        }

        EventArgs::Transfer { .. } => {
            return Err(ProjectionError::Internal(
                "vault projection got Transfer arguments".into(),
            ));
        }
    }

    let (user, account_index) = account(event);
    activity.user = user.to_string();
    activity.account_index = account_index;
    ws.append(activity);
    ws.into_mutations()
}

fn summary(
    ws: &WorkingSet<'_>,
    chain_id: ChainId,
    user: &str,
) -> Result<UserVaultSummary, ProjectionError> {
    let key = summary_key(chain_id, user);
    Ok(ws
        .get::<UserVaultSummary>(&key)?
        .unwrap_or_else(|| UserVaultSummary::empty(&key)))
}

fn active_vault(
    ws: &WorkingSet<'_>,
    chain_id: ChainId,
    user: &str,
    account_index: u32,
) -> Result<Vault, ProjectionError> {
    let vault = ws
        .get::<Vault>(&vault_key(chain_id, user, account_index))?
        .ok_or_else(|| InvariantViolation::UnknownVault {
            user: user.to_string(),
            account_index,
        })?;
    if !vault.is_active {
        return Err(InvariantViolation::VaultClosed {
            user: user.to_string(),
            account_index,
        }
        .into());
    }
    Ok(vault)
}
