//! Read sets, snapshots and the working set projections mutate.

use std::collections::{BTreeMap, BTreeSet};

use jarindex_storage::models::HolderKey;
use jarindex_storage::{Aggregate, Mutation, Row, RowKey};

use crate::error::ProjectionError;

/// Rows (plus mint tallies and transfer activity) a projection needs before
/// it can run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSet {
    pub rows: BTreeSet<RowKey>,
    pub minted: BTreeSet<HolderKey>,
    pub activity: BTreeSet<HolderKey>,
}

impl ReadSet {
    pub fn row<T: Aggregate>(&mut self, key: &T::Key) -> &mut Self {
        self.rows.insert(T::row_key(key));
        self
    }

    pub fn minted(&mut self, key: HolderKey) -> &mut Self {
        self.minted.insert(key);
        self
    }

    /// Newest transfer timestamp of `key.address` on `key.chain_id`.
    pub fn activity(&mut self, key: HolderKey) -> &mut Self {
        self.activity.insert(key);
        self
    }

    pub fn extend(&mut self, other: ReadSet) {
        self.rows.extend(other.rows);
        self.minted.extend(other.minted);
        self.activity.extend(other.activity);
    }
}

/// Point-in-time values of a [`ReadSet`]. Absent rows are recorded as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    rows: BTreeMap<RowKey, Option<Row>>,
    minted: BTreeMap<HolderKey, u64>,
    activity: BTreeMap<HolderKey, Option<i64>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: RowKey, row: Option<Row>) {
        self.rows.insert(key, row);
    }

    pub fn insert_minted(&mut self, key: HolderKey, count: u64) {
        self.minted.insert(key, count);
    }

    pub fn insert_activity(&mut self, key: HolderKey, latest: Option<i64>) {
        self.activity.insert(key, latest);
    }

    pub(crate) fn raw(&self, key: &RowKey) -> Result<Option<&Row>, ProjectionError> {
        self.rows
            .get(key)
            .map(Option::as_ref)
            .ok_or_else(|| ProjectionError::Internal(format!("{} row was not read", key.entity())))
    }

    pub fn get<T: Aggregate>(&self, key: &T::Key) -> Result<Option<T>, ProjectionError> {
        let row_key = T::row_key(key);
        self.raw(&row_key)?.cloned().map(|row| typed(&row_key, row)).transpose()
    }

    pub fn minted(&self, key: &HolderKey) -> Result<u64, ProjectionError> {
        self.minted.get(key).copied().ok_or_else(|| {
            ProjectionError::Internal(format!(
                "mint tally of {} on chain {} was not read",
                key.address, key.chain_id
            ))
        })
    }

    pub fn activity(&self, key: &HolderKey) -> Result<Option<i64>, ProjectionError> {
        self.activity.get(key).copied().ok_or_else(|| {
            ProjectionError::Internal(format!(
                "transfer activity of {} on chain {} was not read",
                key.address, key.chain_id
            ))
        })
    }

    /// The versions a commit must still find in the store.
    pub fn reads(&self) -> Vec<(RowKey, Option<Row>)> {
        self.rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

fn typed<T: Aggregate>(key: &RowKey, row: Row) -> Result<T, ProjectionError> {
    T::from_row(row).ok_or_else(|| ProjectionError::Internal(format!("{key:?} holds another entity")))
}

/// Copy-on-write view over a [`Snapshot`] that diffs into mutations.
pub struct WorkingSet<'s> {
    snapshot: &'s Snapshot,
    current: BTreeMap<RowKey, Option<Row>>,
    appends: Vec<Row>,
}

impl<'s> WorkingSet<'s> {
    pub fn new(snapshot: &'s Snapshot) -> Self {
        Self {
            snapshot,
            current: BTreeMap::new(),
            appends: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> &'s Snapshot {
        self.snapshot
    }

    pub fn get<T: Aggregate>(&self, key: &T::Key) -> Result<Option<T>, ProjectionError> {
        let row_key = T::row_key(key);
        match self.current.get(&row_key) {
            Some(row) => row.clone().map(|r| typed(&row_key, r)).transpose(),
            None => self.snapshot.get(key),
        }
    }

    pub fn put<T: Aggregate>(&mut self, value: T) {
        let row = value.into_row();
        self.current.insert(row.key(), Some(row));
    }

    pub fn remove<T: Aggregate>(&mut self, key: &T::Key) {
        self.current.insert(T::row_key(key), None);
    }

    /// Queue an append-only record.
    pub fn append<T: Aggregate>(&mut self, value: T) {
        self.appends.push(value.into_row());
    }

    /// Append-only records queued so far.
    pub fn appended(&self) -> impl Iterator<Item = &Row> + '_ {
        self.appends.iter()
    }

    /// Rows that exist in the working set but not in the snapshot.
    pub fn created(&self) -> impl Iterator<Item = &Row> + '_ {
        self.current.iter().filter_map(|(key, row)| match (self.snapshot.raw(key), row) {
            (Ok(None), Some(row)) => Some(row),
            _ => None,
        })
    }

    pub fn into_mutations(self) -> Result<Vec<Mutation>, ProjectionError> {
        let mut mutations = Vec::with_capacity(self.current.len() + self.appends.len());
        for (key, now) in self.current {
            let before = self.snapshot.raw(&key)?;
            match (before, now) {
                (None, Some(row)) => mutations.push(Mutation::create(row)),
                (Some(old), Some(row)) if *old != row => mutations.push(Mutation::update(row)),
                (Some(old), None) => mutations.push(Mutation::delete(old.clone())),
                _ => {}
            }
        }
        mutations.extend(self.appends.into_iter().map(Mutation::create));
        Ok(mutations)
    }
}
