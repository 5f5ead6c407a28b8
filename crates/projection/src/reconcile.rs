//! Cross-chain `UserBalance` derivation.
//!
//! A `UserBalance` row is never adjusted by deltas. Every time a transfer of a
//! generation-bearing collection touches a wallet, the row is rebuilt from the
//! post-event `Holder` rows (balances) and `Token.minted_by` tallies (mints)
//! on every chain the collection is indexed on. The row is deleted when the
//! wallet holds nothing on any chain.
//!
//! `last_activity_time` is the newest `TransferRecord` sending to or from the
//! wallet on any indexed chain. Transfer records survive balance changes and
//! are rebuilt exactly by a replay, so the value does not depend on which
//! event or which stream triggered the rebuild.

use std::collections::BTreeMap;

use jarindex_core::config::BucketChains;
use jarindex_core::{ChainId, CollectionBinding, ZERO_ADDRESS};
use jarindex_storage::models::{ChainBucket, Holder, HolderKey, UserBalance, UserBalanceKey};
use jarindex_storage::{Mutation, Row};

use crate::error::{InvariantViolation, ProjectionError};
use crate::snapshot::{ReadSet, Snapshot, WorkingSet};

/// Wallets among `addresses` that carry a cross-chain balance: not the zero
/// address, not the collection's bridge proxy, deduplicated.
pub fn targets<'a>(
    collection: &CollectionBinding,
    addresses: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for address in addresses {
        if address == ZERO_ADDRESS || collection.is_proxy(address) {
            continue;
        }
        if !out.iter().any(|a| a == address) {
            out.push(address.to_string());
        }
    }
    out
}

fn holder_key(collection: &CollectionBinding, chain_id: ChainId, address: &str) -> HolderKey {
    HolderKey {
        collection: collection.name.clone(),
        chain_id,
        address: address.to_string(),
    }
}

/// Add what [`reconcile`] reads for `address` to `reads`.
pub fn reads(reads: &mut ReadSet, collection: &CollectionBinding, address: &str) {
    let Some(generation) = collection.generation else {
        return;
    };
    reads.row::<UserBalance>(&UserBalanceKey {
        address: address.to_string(),
        generation,
    });
    for chain_id in &collection.indexed_chains {
        let key = holder_key(collection, *chain_id, address);
        reads.row::<Holder>(&key);
        reads.minted(key.clone());
        reads.activity(key);
    }
}

/// Newest transfer involving `address` on `chain_id`, counting records the
/// working set is about to append.
fn latest_transfer(ws: &WorkingSet<'_>, key: &HolderKey) -> Result<Option<i64>, ProjectionError> {
    let stored = ws.snapshot().activity(key)?;
    let pending = ws
        .appended()
        .filter_map(|row| match row {
            Row::TransferRecord(r)
                if r.collection == key.collection
                    && r.chain_id == key.chain_id
                    && (r.from == key.address || r.to == key.address) =>
            {
                Some(r.timestamp)
            }
            _ => None,
        })
        .max();
    Ok(stored.max(pending))
}

/// Rebuild the `UserBalance` of `address` inside `ws`.
pub fn reconcile(
    ws: &mut WorkingSet<'_>,
    collection: &CollectionBinding,
    address: &str,
) -> Result<(), ProjectionError> {
    let Some(generation) = collection.generation else {
        return Ok(());
    };
    let key = UserBalanceKey {
        address: address.to_string(),
        generation,
    };
    let previous = ws.get::<UserBalance>(&key)?;

    let mut buckets = BTreeMap::new();
    let mut latest_activity: Option<i64> = None;
    for chain_id in &collection.indexed_chains {
        let hkey = holder_key(collection, *chain_id, address);
        let holder = ws.get::<Holder>(&hkey)?;
        let minted_here = ws
            .created()
            .filter(|row| match row {
                Row::Token(t) => {
                    t.collection == collection.name && t.chain_id == *chain_id && t.minted_by == address
                }
                _ => false,
            })
            .count() as u64;
        let minted = ws
            .snapshot()
            .minted(&hkey)?
            .checked_add(minted_here)
            .ok_or(InvariantViolation::Overflow("minted tally"))?;
        let balance = holder.as_ref().map_or(0, |h| h.balance);
        latest_activity = latest_activity.max(latest_transfer(ws, &hkey)?);
        if balance > 0 || minted > 0 {
            buckets.insert(*chain_id, ChainBucket { balance, minted });
        }
    }

    let balance_total = buckets.values().map(|b| b.balance).sum::<u64>();
    let minted_total = buckets.values().map(|b| b.minted).sum::<u64>();

    if balance_total == 0 {
        if previous.is_some() {
            ws.remove::<UserBalance>(&key);
        }
        return Ok(());
    }

    ws.put(UserBalance {
        address: address.to_string(),
        generation,
        home_chain_id: collection.home_chain_id,
        buckets,
        balance_total,
        minted_total,
        last_activity_time: latest_activity.unwrap_or_default(),
    });
    Ok(())
}

/// Recompute one wallet's balance outside of any event (after a purge and replay).
/// Yields exactly what the last event touching the wallet would have written.
pub fn rebuild(
    snapshot: &Snapshot,
    collection: &CollectionBinding,
    address: &str,
) -> Result<Vec<Mutation>, ProjectionError> {
    let mut ws = WorkingSet::new(snapshot);
    reconcile(&mut ws, collection, address)?;
    ws.into_mutations()
}

/// Named presentation buckets over a [`UserBalance`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketView {
    pub home: ChainBucket,
    pub berachain: ChainBucket,
    pub ethereum: ChainBucket,
    /// Holdings on chains that are neither home, Berachain nor Ethereum.
    pub other: ChainBucket,
}

impl BucketView {
    /// When the home chain is Berachain or Ethereum the holdings appear in
    /// both `home` and that named bucket; `other` never double-counts.
    pub fn of(balance: &UserBalance, chains: BucketChains) -> Self {
        let mut other = ChainBucket::default();
        for (chain_id, bucket) in &balance.buckets {
            if *chain_id != balance.home_chain_id
                && *chain_id != chains.berachain
                && *chain_id != chains.ethereum
            {
                other.balance += bucket.balance;
                other.minted += bucket.minted;
            }
        }
        Self {
            home: balance.home(),
            berachain: balance.bucket(chains.berachain),
            ethereum: balance.bucket(chains.ethereum),
            other,
        }
    }
}
