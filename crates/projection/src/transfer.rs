//! ERC-721 `Transfer` projection.
//!
//! `from == 0x0` is a mint, `to == 0x0` a burn. Transfers to the collection's
//! bridge proxy leave the counted population (the sender is debited, nobody is
//! credited); transfers from the proxy re-enter it (the recipient is credited,
//! nobody is debited).

use jarindex_core::{
    CollectionBinding, ContractBinding, DecodedEvent, EventArgs, SupplyPolicy, ZERO_ADDRESS,
};
use jarindex_storage::Mutation;
use jarindex_storage::models::{
    CollectionKey, CollectionStat, Holder, HolderKey, Token, TokenKey, TransferKind,
    TransferRecord,
};

use crate::error::{InvariantViolation, ProjectionError};
use crate::reconcile;
use crate::snapshot::{ReadSet, Snapshot, WorkingSet};

/// How one transfer moves a token through the counted holder population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub is_mint: bool,
    pub is_burn: bool,
    pub from_proxy: bool,
    pub to_proxy: bool,
}

impl Flow {
    pub fn classify(collection: &CollectionBinding, from: &str, to: &str) -> Self {
        Self {
            is_mint: from == ZERO_ADDRESS,
            is_burn: to == ZERO_ADDRESS,
            from_proxy: collection.is_proxy(from),
            to_proxy: collection.is_proxy(to),
        }
    }

    /// Whether `from` loses a counted token.
    pub fn debits_sender(&self) -> bool {
        !self.is_mint && !self.from_proxy
    }

    /// Whether `to` gains a counted token.
    pub fn credits_recipient(&self) -> bool {
        !self.is_burn && !self.to_proxy
    }

    pub fn kind(&self) -> TransferKind {
        if self.is_mint {
            TransferKind::Mint
        } else if self.is_burn {
            TransferKind::Burn
        } else if self.to_proxy {
            TransferKind::BridgeOut
        } else if self.from_proxy {
            TransferKind::BridgeIn
        } else {
            TransferKind::Transfer
        }
    }
}

struct TransferArgs<'a> {
    from: &'a str,
    to: &'a str,
    token_id: u64,
}

fn args(event: &DecodedEvent) -> Result<TransferArgs<'_>, ProjectionError> {
    match &event.args {
        EventArgs::Transfer { from, to, token_id } => Ok(TransferArgs {
            from,
            to,
            token_id: *token_id,
        }),
        other => Err(ProjectionError::Internal(format!(
            "transfer projection got {} arguments",
            other.event_type()
        ))),
    }
}

fn collection(binding: &ContractBinding) -> Result<&CollectionBinding, ProjectionError> {
    binding.collection.as_ref().ok_or_else(|| {
        ProjectionError::Internal(format!("{} has no collection binding", binding.contract.id))
    })
}

fn holder_key(collection: &CollectionBinding, chain_id: u64, address: &str) -> HolderKey {
    HolderKey {
        collection: collection.name.clone(),
        chain_id,
        address: address.to_string(),
    }
}

pub fn reads(event: &DecodedEvent, binding: &ContractBinding) -> Result<ReadSet, ProjectionError> {
    let collection = collection(binding)?;
    let t = args(event)?;
    let mut reads = ReadSet::default();

    reads.row::<Token>(&TokenKey {
        collection: collection.name.clone(),
        chain_id: event.chain_id,
        token_id: t.token_id,
    });
    reads.row::<CollectionStat>(&CollectionKey {
        collection: collection.name.clone(),
        chain_id: event.chain_id,
    });
    for address in reconcile::targets(collection, [t.from, t.to]) {
        reads.row::<Holder>(&holder_key(collection, event.chain_id, &address));
        reconcile::reads(&mut reads, collection, &address);
    }
    Ok(reads)
}

pub fn project(
    event: &DecodedEvent,
    binding: &ContractBinding,
    snapshot: &Snapshot,
) -> Result<Vec<Mutation>, ProjectionError> {
    let collection = collection(binding)?;
    let t = args(event)?;
    let flow = Flow::classify(collection, t.from, t.to);
    if flow.is_mint && flow.is_burn {
        return Err(InvariantViolation::ZeroToZero.into());
    }

    let chain_id = event.chain_id;
    let ts = event.timestamp;
    let mut ws = WorkingSet::new(snapshot);

    move_token(&mut ws, collection, chain_id, &t, flow, ts)?;

    let stat_key = CollectionKey {
        collection: collection.name.clone(),
        chain_id,
    };
    let mut stat = ws
        .get::<CollectionStat>(&stat_key)?
        .unwrap_or_else(|| CollectionStat::empty(&stat_key));

    if t.from == t.to && !flow.is_mint {
        // Self-transfer: ownership is unchanged, only activity moves.
        if flow.debits_sender() {
            let key = holder_key(collection, chain_id, t.from);
            let mut holder = ws.get::<Holder>(&key)?.ok_or_else(|| {
                InvariantViolation::BalanceUnderflow {
                    address: t.from.to_string(),
                }
            })?;
            holder.last_activity_time = ts;
            ws.put(holder);
        }
    } else {
        if flow.debits_sender() {
            debit(&mut ws, &mut stat, holder_key(collection, chain_id, t.from), ts)?;
        }
        if flow.credits_recipient() {
            credit(&mut ws, &mut stat, collection, chain_id, t.to, flow.is_mint, ts)?;
        }
    }

    update_supply(&mut stat, collection.supply_policy, &t, flow, ts)?;
    ws.put(stat);

    ws.append(TransferRecord {
        collection: collection.name.clone(),
        chain_id,
        transaction_hash: event.transaction_hash.clone(),
        log_index: event.log_index,
        token_id: t.token_id,
        from: t.from.to_string(),
        to: t.to.to_string(),
        kind: flow.kind(),
        timestamp: ts,
        block_number: event.block_number,
    });

    for address in reconcile::targets(collection, [t.from, t.to]) {
        reconcile::reconcile(&mut ws, collection, &address)?;
    }

    ws.into_mutations()
}

fn move_token(
    ws: &mut WorkingSet<'_>,
    collection: &CollectionBinding,
    chain_id: u64,
    t: &TransferArgs<'_>,
    flow: Flow,
    ts: i64,
) -> Result<(), ProjectionError> {
    let key = TokenKey {
        collection: collection.name.clone(),
        chain_id,
        token_id: t.token_id,
    };
    let existing = ws.get::<Token>(&key)?;

    if flow.is_mint {
        if existing.is_some() {
            return Err(InvariantViolation::DuplicateMint {
                token_id: t.token_id,
            }
            .into());
        }
        ws.put(Token {
            collection: collection.name.clone(),
            chain_id,
            token_id: t.token_id,
            owner: t.to.to_string(),
            minted_by: t.to.to_string(),
            is_burned: false,
            minted_at: ts,
            last_transfer_time: ts,
        });
        return Ok(());
    }

    let mut token = existing.ok_or(InvariantViolation::UnknownToken {
        token_id: t.token_id,
    })?;
    if token.is_burned {
        return Err(InvariantViolation::TokenBurned {
            token_id: t.token_id,
        }
        .into());
    }
    if token.owner != t.from {
        return Err(InvariantViolation::OwnerMismatch {
            token_id: t.token_id,
            owner: token.owner,
            from: t.from.to_string(),
        }
        .into());
    }

    token.last_transfer_time = ts;
    if flow.is_burn {
        token.is_burned = true;
        token.owner = ZERO_ADDRESS.to_string();
    } else {
        token.owner = t.to.to_string();
    }
    ws.put(token);
    Ok(())
}

fn debit(
    ws: &mut WorkingSet<'_>,
    stat: &mut CollectionStat,
    key: HolderKey,
    ts: i64,
) -> Result<(), ProjectionError> {
    let underflow = || InvariantViolation::BalanceUnderflow {
        address: key.address.clone(),
    };
    let mut holder = ws.get::<Holder>(&key)?.ok_or_else(underflow)?;
    holder.balance = holder.balance.checked_sub(1).ok_or_else(underflow)?;

    if holder.balance == 0 {
        ws.remove::<Holder>(&key);
        stat.unique_holders = stat
            .unique_holders
            .checked_sub(1)
            .ok_or(InvariantViolation::Overflow("unique_holders"))?;
    } else {
        holder.last_activity_time = ts;
        ws.put(holder);
    }
    Ok(())
}

fn credit(
    ws: &mut WorkingSet<'_>,
    stat: &mut CollectionStat,
    collection: &CollectionBinding,
    chain_id: u64,
    address: &str,
    is_mint: bool,
    ts: i64,
) -> Result<(), ProjectionError> {
    let key = holder_key(collection, chain_id, address);
    let mut holder = match ws.get::<Holder>(&key)? {
        Some(holder) => holder,
        None => {
            stat.unique_holders += 1;
            Holder {
                address: address.to_string(),
                collection: collection.name.clone(),
                chain_id,
                balance: 0,
                total_minted: 0,
                first_mint_time: None,
                last_activity_time: ts,
            }
        }
    };

    holder.balance += 1;
    if is_mint {
        holder.total_minted += 1;
        holder.first_mint_time.get_or_insert(ts);
    }
    holder.last_activity_time = ts;
    ws.put(holder);
    Ok(())
}

fn update_supply(
    stat: &mut CollectionStat,
    policy: SupplyPolicy,
    t: &TransferArgs<'_>,
    flow: Flow,
    ts: i64,
) -> Result<(), ProjectionError> {
    if flow.is_mint {
        stat.total_minted = match policy {
            SupplyPolicy::Counters => stat.total_minted + 1,
            SupplyPolicy::MaxTokenId => stat.total_minted.max(t.token_id),
        };
        stat.last_mint_time = Some(ts);
    }
    if flow.is_burn {
        stat.total_burned += 1;
    }
    stat.total_supply = match policy {
        SupplyPolicy::Counters => stat
            .total_minted
            .checked_sub(stat.total_burned)
            .ok_or(InvariantViolation::Overflow("total_supply"))?,
        // Ids start at 0, so burns can outnumber the highest id.
        SupplyPolicy::MaxTokenId => stat.total_minted.saturating_sub(stat.total_burned),
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{binding, snapshot_for};
    use jarindex_storage::{MutationOp, Row};

    const A: &str = "0x000000000000000000000000000000000000000a";
    const B: &str = "0x000000000000000000000000000000000000000b";
    const PROXY: &str = "0xe0b791529f7876dc2b9d748a2e6570e605f40e5e";

    fn transfer(from: &str, to: &str, token_id: u64, block: u64) -> DecodedEvent {
        DecodedEvent {
            chain_id: 1,
            contract: "HoneyJar1".into(),
            block_number: block,
            block_hash: format!("0xb{block}"),
            parent_hash: format!("0xb{}", block - 1),
            log_index: 0,
            transaction_hash: format!("0xt{block}"),
            timestamp: block as i64 * 10,
            args: EventArgs::Transfer {
                from: from.into(),
                to: to.into(),
                token_id,
            },
        }
    }

    fn find<'m>(mutations: &'m [Mutation], pred: impl Fn(&Row) -> bool) -> Option<&'m Mutation> {
        mutations.iter().find(|m| pred(&m.row))
    }

    #[test]
    fn mint_creates_token_holder_and_supply() {
        let binding = binding();
        let event = transfer(ZERO_ADDRESS, A, 1, 10);
        let snapshot = snapshot_for(&event, &binding, &[]);
        let mutations = project(&event, &binding, &snapshot).unwrap();

        let holder = find(&mutations, |r| matches!(r, Row::Holder(_))).unwrap();
        assert_eq!(holder.op, MutationOp::Create);
        let Row::Holder(h) = &holder.row else { unreachable!() };
        assert_eq!((h.balance, h.total_minted), (1, 1));
        assert_eq!(h.first_mint_time, Some(100));

        let Row::CollectionStat(stat) =
            &find(&mutations, |r| matches!(r, Row::CollectionStat(_))).unwrap().row
        else {
            unreachable!()
        };
        assert_eq!(stat.total_supply, 1);
        assert_eq!(stat.unique_holders, 1);

        let Row::TransferRecord(record) =
            &find(&mutations, |r| matches!(r, Row::TransferRecord(_))).unwrap().row
        else {
            unreachable!()
        };
        assert_eq!(record.kind, TransferKind::Mint);

        let Row::UserBalance(ub) =
            &find(&mutations, |r| matches!(r, Row::UserBalance(_))).unwrap().row
        else {
            unreachable!()
        };
        assert_eq!((ub.balance_total, ub.minted_total), (1, 1));
    }

    #[test]
    fn duplicate_mint_is_an_invariant_violation() {
        let binding = binding();
        let mint = transfer(ZERO_ADDRESS, A, 1, 10);
        let snapshot = snapshot_for(&mint, &binding, &[&mint]);
        let err = project(&mint, &binding, &snapshot).unwrap_err();
        assert_eq!(err, InvariantViolation::DuplicateMint { token_id: 1 }.into());
    }

    #[test]
    fn bridging_out_debits_without_crediting_the_proxy() {
        let binding = binding();
        let mint = transfer(ZERO_ADDRESS, B, 1, 10);
        let out = transfer(B, PROXY, 1, 11);
        let snapshot = snapshot_for(&out, &binding, &[&mint]);
        let mutations = project(&out, &binding, &snapshot).unwrap();

        let deleted = find(&mutations, |r| matches!(r, Row::Holder(_))).unwrap();
        assert_eq!(deleted.op, MutationOp::Delete);
        assert!(
            mutations
                .iter()
                .all(|m| !matches!(&m.row, Row::Holder(h) if h.address == PROXY))
        );
        let ub = find(&mutations, |r| matches!(r, Row::UserBalance(_))).unwrap();
        assert_eq!(ub.op, MutationOp::Delete);
        let Row::CollectionStat(stat) =
            &find(&mutations, |r| matches!(r, Row::CollectionStat(_))).unwrap().row
        else {
            unreachable!()
        };
        assert_eq!(stat.unique_holders, 0);
        assert_eq!(stat.total_supply, 1);
    }

    #[test]
    fn transfer_from_non_owner_is_rejected() {
        let binding = binding();
        let mint = transfer(ZERO_ADDRESS, A, 1, 10);
        let bogus = transfer(B, A, 1, 11);
        let snapshot = snapshot_for(&bogus, &binding, &[&mint]);
        let err = project(&bogus, &binding, &snapshot).unwrap_err();
        assert!(matches!(
            err,
            ProjectionError::Invariant(InvariantViolation::OwnerMismatch { .. })
        ));
    }

    #[test]
    fn self_transfer_only_touches_activity() {
        let binding = binding();
        let mint = transfer(ZERO_ADDRESS, A, 1, 10);
        let again = transfer(A, A, 1, 12);
        let snapshot = snapshot_for(&again, &binding, &[&mint]);
        let mutations = project(&again, &binding, &snapshot).unwrap();

        let Row::Holder(h) = &find(&mutations, |r| matches!(r, Row::Holder(_))).unwrap().row
        else {
            unreachable!()
        };
        assert_eq!(h.balance, 1);
        assert_eq!(h.last_activity_time, 120);
        let Row::UserBalance(ub) =
            &find(&mutations, |r| matches!(r, Row::UserBalance(_))).unwrap().row
        else {
            unreachable!()
        };
        assert_eq!(ub.balance_total, 1);
        assert!(
            find(&mutations, |r| matches!(r, Row::CollectionStat(_))).is_none(),
            "supply must not move"
        );
    }

    #[test]
    fn max_token_id_policy_tracks_highest_id() {
        let mut binding = binding();
        if let Some(c) = binding.collection.as_mut() {
            c.supply_policy = SupplyPolicy::MaxTokenId;
        }
        let first = transfer(ZERO_ADDRESS, A, 5, 10);
        let snapshot = snapshot_for(&first, &binding, &[]);
        let mutations = project(&first, &binding, &snapshot).unwrap();
        let Row::CollectionStat(stat) =
            &find(&mutations, |r| matches!(r, Row::CollectionStat(_))).unwrap().row
        else {
            unreachable!()
        };
        assert_eq!(stat.total_minted, 5);
        assert_eq!(stat.total_supply, stat.total_minted - stat.total_burned);
    }

    #[test]
    fn max_token_id_supply_floors_at_zero() {
        let mut binding = binding();
        if let Some(c) = binding.collection.as_mut() {
            c.supply_policy = SupplyPolicy::MaxTokenId;
        }
        let mint = transfer(ZERO_ADDRESS, A, 0, 10);
        let burn = transfer(A, ZERO_ADDRESS, 0, 11);
        let snapshot = snapshot_for(&burn, &binding, &[&mint]);
        let mutations = project(&burn, &binding, &snapshot).unwrap();

        let Row::CollectionStat(stat) =
            &find(&mutations, |r| matches!(r, Row::CollectionStat(_))).unwrap().row
        else {
            unreachable!()
        };
        assert_eq!((stat.total_minted, stat.total_burned, stat.total_supply), (0, 1, 0));
        let Row::Token(token) = &find(&mutations, |r| matches!(r, Row::Token(_))).unwrap().row
        else {
            unreachable!()
        };
        assert!(token.is_burned);
    }
}
