//! The reference store: four edge colours, two of them time-indexed.
//!
//! Component paths are immutable, so their outgoing edges
//! (component→component and component→state) are plain overwritable
//! lists. A state path's contents change over time, so its outgoing
//! edges (state→component and state→state) are keyed by commit timestamp
//! and queried as of a revision.

use std::collections::{BTreeMap, BTreeSet};

use stratum_store_core::store_path::StoreDirs;
use stratum_store_db::{
    query_state_reference_list, revision_to_timestamp, set_state_reference_list, split_db_key,
    merge_db_key, ReadTxn, TableId, Txn,
};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::sharing::to_non_shared_path;
use crate::validity::{is_realisable, is_realisable_any, is_realisable_state};
use crate::{LocalStore, Tables};

/// Record the outgoing references of a path.
///
/// For component paths the lists are overwritten (no-op when unchanged).
/// For state paths both colours are written under one commit timestamp:
/// a fresh one when `revision` is 0, the revision's otherwise. Clearing
/// (both sets empty) is permitted even for unrealisable paths.
pub(crate) fn set_references(
    txn: &Txn<'_>,
    t: &Tables,
    dirs: &StoreDirs,
    path: &str,
    references: &BTreeSet<String>,
    state_references: &BTreeSet<String>,
    revision: u64,
) -> Result<()> {
    if (!references.is_empty() || !state_references.is_empty())
        && !is_realisable_any(txn, t, path)?
    {
        return Err(StoreError::InvalidPath(path.to_string()));
    }

    if is_realisable(txn, t, path)? || dirs.is_store_path(path) {
        debug!(path, "setting component path references");

        let old_refs: BTreeSet<String> = txn.get_list(t.refs_cc, path)?.into_iter().collect();
        let old_state_refs: BTreeSet<String> =
            txn.get_list(t.refs_cs, path)?.into_iter().collect();
        if old_refs == *references && old_state_refs == *state_references {
            return Ok(());
        }

        let refs: Vec<&String> = references.iter().collect();
        let state_refs: Vec<&String> = state_references.iter().collect();
        txn.put_list(t.refs_cc, path, &refs)?;
        txn.put_list(t.refs_cs, path, &state_refs)?;
        Ok(())
    } else {
        debug!(path, revision, "setting state path references");

        let state_path = to_non_shared_path(txn, t, path)?;
        let timestamp = if revision == 0 {
            txn.alloc_timestamp()?
        } else {
            revision_to_timestamp(txn, t.revisions, &state_path, revision)?.ok_or_else(|| {
                StoreError::UnknownRevision {
                    path: state_path.clone(),
                    revision,
                }
            })?
        };

        let refs: Vec<String> = references.iter().cloned().collect();
        let state_refs: Vec<String> = state_references.iter().cloned().collect();
        set_state_reference_list(txn, t.refs_sc, t.revisions, &state_path, &refs, 0, timestamp)?;
        set_state_reference_list(txn, t.refs_ss, t.revisions, &state_path, &state_refs, 0, timestamp)?;
        Ok(())
    }
}

/// Outgoing references of either colour, as of a revision (state paths)
/// or timelessly (component paths).
///
/// `component_edges` selects the target colour: `true` reads the
/// `*→component` tables, `false` the `*→state` tables. An explicit
/// `timestamp` overrides revision resolution.
pub(crate) fn query_references_txn<R: ReadTxn>(
    r: &R,
    t: &Tables,
    path: &str,
    component_edges: bool,
    revision: u64,
    timestamp: u64,
) -> Result<BTreeSet<String>> {
    let (component_table, state_table) = if component_edges {
        (t.refs_cc, t.refs_sc)
    } else {
        (t.refs_cs, t.refs_ss)
    };

    if is_realisable(r, t, path)? {
        Ok(r.get_list(component_table, path)?.into_iter().collect())
    } else if is_realisable_state(r, t, path)? {
        let state_path = to_non_shared_path(r, t, path)?;
        let refs = query_state_reference_list(
            r,
            state_table,
            t.revisions,
            &state_path,
            revision,
            timestamp,
        )?
        .ok_or_else(|| StoreError::UnknownRevision {
            path: state_path.clone(),
            revision,
        })?;
        Ok(refs.into_iter().collect())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

/// Inverse edges over the component-keyed tables: scan every key and
/// collect those whose reference list contains the target.
fn component_referrers<R: ReadTxn>(
    r: &R,
    table: TableId,
    target: &str,
) -> Result<BTreeSet<String>> {
    let mut referrers = BTreeSet::new();
    for key in r.enumerate_keys(table)? {
        if r.get_list(table, &key)?.iter().any(|p| p == target) {
            referrers.insert(key);
        }
    }
    Ok(referrers)
}

/// Inverse edges over the state-keyed tables: fold each state path to
/// its latest timestamp not after the resolved revision, then inspect
/// that timestamp's list.
fn state_referrers<R: ReadTxn>(
    r: &R,
    t: &Tables,
    table: TableId,
    target: &str,
    revision: u64,
) -> Result<BTreeSet<String>> {
    // resolve the revision to a timestamp first, then compare timestamps
    let limit = if revision == 0 {
        u64::MAX
    } else {
        revision_to_timestamp(r, t.revisions, target, revision)?.ok_or_else(|| {
            StoreError::UnknownRevision {
                path: target.to_string(),
                revision,
            }
        })?
    };

    let mut latest: BTreeMap<String, u64> = BTreeMap::new();
    for key in r.enumerate_keys(table)? {
        let (state_path, ts) = split_db_key(&key)?;
        if ts <= limit {
            let entry = latest.entry(state_path).or_insert(ts);
            if *entry < ts {
                *entry = ts;
            }
        }
    }

    let mut referrers = BTreeSet::new();
    for (state_path, ts) in latest {
        let refs = r.get_list(table, &merge_db_key(&state_path, ts))?;
        if refs.iter().any(|p| p == target) {
            referrers.insert(state_path);
        }
    }
    Ok(referrers)
}

pub(crate) fn query_referrers_txn<R: ReadTxn>(
    r: &R,
    t: &Tables,
    dirs: &StoreDirs,
    path: &str,
    component_referrer: bool,
    revision: u64,
) -> Result<BTreeSet<String>> {
    if !is_realisable_any(r, t, path)? {
        return Err(StoreError::InvalidPath(path.to_string()));
    }

    let is_component = is_realisable(r, t, path)? || dirs.is_store_path(path);
    let target = if is_component {
        path.to_string()
    } else {
        to_non_shared_path(r, t, path)?
    };

    if component_referrer {
        // referrers are component paths; pick the table keyed on them
        let table = if is_component { t.refs_cc } else { t.refs_cs };
        component_referrers(r, table, &target)
    } else {
        let table = if is_component { t.refs_sc } else { t.refs_ss };
        state_referrers(r, t, table, &target, revision)
    }
}

/// Solid references: state→component edges that every scan must report
/// even when the hash never appears in the tree.
pub(crate) fn query_solid_state_references<R: ReadTxn>(
    r: &R,
    t: &Tables,
    state_path: &str,
) -> Result<BTreeSet<String>> {
    Ok(r.get_list(t.solid_cs, state_path)?.into_iter().collect())
}

impl LocalStore {
    /// Component references of a path at a revision (0 = latest).
    pub fn query_references(&self, path: &str, revision: u64) -> Result<BTreeSet<String>> {
        query_references_txn(&self.db, &self.tables, path, true, revision, 0)
    }

    /// State references of a path at a revision (0 = latest).
    pub fn query_state_references(&self, path: &str, revision: u64) -> Result<BTreeSet<String>> {
        query_references_txn(&self.db, &self.tables, path, false, revision, 0)
    }

    /// Component paths referencing `path`, at a revision of `path` for
    /// time-indexed referrers.
    pub fn query_referrers(&self, path: &str, revision: u64) -> Result<BTreeSet<String>> {
        query_referrers_txn(&self.db, &self.tables, &self.dirs, path, true, revision)
    }

    /// State paths referencing `path`, at a revision of `path`.
    pub fn query_state_referrers(&self, path: &str, revision: u64) -> Result<BTreeSet<String>> {
        query_referrers_txn(&self.db, &self.tables, &self.dirs, path, false, revision)
    }

    /// Record references that every scan of `state_path` must include.
    pub fn set_solid_state_references(
        &mut self,
        state_path: &str,
        references: &BTreeSet<String>,
    ) -> Result<()> {
        self.check_writable()?;
        let refs: Vec<&String> = references.iter().collect();
        let Self { db, tables, .. } = self;
        let txn = db.transaction()?;
        txn.put_list(tables.solid_cs, state_path, &refs)?;
        txn.commit()?;
        Ok(())
    }

    pub fn query_solid_state_references(&self, state_path: &str) -> Result<BTreeSet<String>> {
        query_solid_state_references(&self.db, &self.tables, state_path)
    }
}
