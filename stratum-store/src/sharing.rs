//! The sharing resolver.
//!
//! A state path may be an alias for another: every query against the
//! alias is answered from the target. Aliases chain, so resolution walks
//! `shared-state` until it reaches a path with no binding. A chain-length
//! bound turns accidental cycles into an error instead of a hang.

use std::collections::BTreeSet;

use stratum_store_db::{ReadTxn, Txn};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::{LocalStore, Tables};

/// Longest alias chain resolution will follow.
const MAX_SHARING_CHAIN: usize = 100;

pub(crate) fn query_shared_state<R: ReadTxn>(
    r: &R,
    t: &Tables,
    state_path: &str,
) -> Result<Option<String>> {
    Ok(r.get_string(t.shared_state, state_path)?)
}

/// Follow the alias chain to its non-aliased tail.
pub(crate) fn to_non_shared_path<R: ReadTxn>(r: &R, t: &Tables, state_path: &str) -> Result<String> {
    let mut current = state_path.to_string();
    for _ in 0..MAX_SHARING_CHAIN {
        match query_shared_state(r, t, &current)? {
            Some(next) => current = next,
            None => return Ok(current),
        }
    }
    Err(StoreError::SharingChainTooLong(state_path.to_string()))
}

/// State paths whose binding points directly at `state_path`.
pub(crate) fn directly_shared_with<R: ReadTxn>(
    r: &R,
    t: &Tables,
    state_path: &str,
) -> Result<BTreeSet<String>> {
    let mut sharers = BTreeSet::new();
    for key in r.enumerate_keys(t.shared_state)? {
        if query_shared_state(r, t, &key)?.as_deref() == Some(state_path) {
            sharers.insert(key);
        }
    }
    Ok(sharers)
}

/// Transitive closure of the reverse alias relation, excluding
/// `state_path` itself.
pub(crate) fn shared_with_rec<R: ReadTxn>(
    r: &R,
    t: &Tables,
    state_path: &str,
) -> Result<BTreeSet<String>> {
    let tail = to_non_shared_path(r, t, state_path)?;

    let mut result = BTreeSet::new();
    if tail != state_path {
        result.insert(tail.clone());
    }

    let mut worklist = vec![tail];
    while let Some(current) = worklist.pop() {
        for sharer in directly_shared_with(r, t, &current)? {
            if result.insert(sharer.clone()) {
                worklist.push(sharer);
            }
        }
    }

    result.remove(state_path);
    Ok(result)
}

pub(crate) fn set_shared_state(
    txn: &Txn<'_>,
    t: &Tables,
    from_existing: &str,
    to_new: &str,
) -> Result<()> {
    debug!(alias = to_new, target = from_existing, "binding shared state");

    // a source has at most one binding; replace any earlier one
    txn.delete(t.shared_state, to_new)?;
    txn.put_string(t.shared_state, to_new, from_existing)?;
    Ok(())
}

impl LocalStore {
    /// Make `to_new` an alias for `from_existing`.
    pub fn set_shared_state(&mut self, from_existing: &str, to_new: &str) -> Result<()> {
        self.check_writable()?;
        self.dirs.assert_state_path(from_existing)?;
        self.dirs.assert_state_path(to_new)?;

        let Self { db, tables, .. } = self;
        let txn = db.transaction()?;
        set_shared_state(&txn, tables, from_existing, to_new)?;
        // reject bindings that close a cycle
        to_non_shared_path(&txn, tables, to_new)?;
        txn.commit()?;
        Ok(())
    }

    /// Resolve a state path through the alias chain.
    pub fn to_non_shared_path(&self, state_path: &str) -> Result<String> {
        to_non_shared_path(&self.db, &self.tables, state_path)
    }

    /// Resolve a whole set of state paths.
    pub fn to_non_shared_path_set(&self, state_paths: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        state_paths
            .iter()
            .map(|p| to_non_shared_path(&self.db, &self.tables, p))
            .collect()
    }

    /// Every state path that directly or indirectly aliases `state_path`.
    pub fn shared_with_rec(&self, state_path: &str) -> Result<BTreeSet<String>> {
        shared_with_rec(&self.db, &self.tables, state_path)
    }

    /// State paths directly aliasing `state_path`.
    pub fn directly_shared_with(&self, state_path: &str) -> Result<BTreeSet<String>> {
        directly_shared_with(&self.db, &self.tables, state_path)
    }
}
