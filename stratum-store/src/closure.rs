//! Closure and requisites computation.
//!
//! The closure of a set of paths is the least set containing it and
//! closed under the selected edge colours, with state edges evaluated at
//! a revision. Traversal is deterministic (worklist in sorted order,
//! memoised visited set) and cycle-safe.

use std::collections::BTreeSet;

use stratum_store_core::derivation::{is_derivation, Derivation};
use stratum_store_db::ReadTxn;

use crate::error::Result;
use crate::references::query_references_txn;
use crate::sharing::to_non_shared_path;
use crate::validity::{is_realisable_any, is_valid_path};
use crate::{LocalStore, Tables};

fn references_or_empty<R: ReadTxn>(
    r: &R,
    t: &Tables,
    path: &str,
    component_edges: bool,
    revision: u64,
) -> Result<BTreeSet<String>> {
    // A member may predate the pinned revision; fall back to its latest
    // references rather than failing the whole traversal.
    match query_references_txn(r, t, path, component_edges, revision, 0) {
        Ok(refs) => Ok(refs),
        Err(crate::error::StoreError::UnknownRevision { .. }) if revision != 0 => {
            query_references_txn(r, t, path, component_edges, 0, 0)
        }
        Err(e) => Err(e),
    }
}

pub(crate) fn compute_closure<R: ReadTxn>(
    r: &R,
    t: &Tables,
    dirs: &stratum_store_core::store_path::StoreDirs,
    start: &BTreeSet<String>,
    with_components: bool,
    with_state: bool,
    revision: u64,
) -> Result<BTreeSet<String>> {
    let mut closure = BTreeSet::new();
    let mut worklist: BTreeSet<String> = start.clone();

    while let Some(path) = worklist.pop_first() {
        // sharing is resolved on entry, per node
        let path = if dirs.is_state_path(&path) {
            to_non_shared_path(r, t, &path)?
        } else {
            path
        };
        if !closure.insert(path.clone()) {
            continue;
        }

        // dangling edges terminate the walk at this node
        if !is_realisable_any(r, t, &path)? {
            continue;
        }

        if with_components {
            for reference in references_or_empty(r, t, &path, true, revision)? {
                if !closure.contains(&reference) {
                    worklist.insert(reference);
                }
            }
        }
        if with_state {
            for reference in references_or_empty(r, t, &path, false, revision)? {
                if !closure.contains(&reference) {
                    worklist.insert(reference);
                }
            }
        }
    }

    Ok(closure)
}

impl LocalStore {
    /// The least set containing `start` and closed under the selected
    /// edge colours, with state edges pinned to `revision`.
    pub fn compute_closure(
        &self,
        start: &BTreeSet<String>,
        with_components: bool,
        with_state: bool,
        revision: u64,
    ) -> Result<BTreeSet<String>> {
        compute_closure(
            &self.db,
            &self.tables,
            &self.dirs,
            start,
            with_components,
            with_state,
            revision,
        )
    }

    /// Everything required to realise `path`: its closure, and with
    /// `include_outputs` the closures of the valid outputs of any
    /// derivation in it.
    pub fn requisites(
        &self,
        path: &str,
        include_outputs: bool,
        with_components: bool,
        with_state: bool,
        revision: u64,
    ) -> Result<BTreeSet<String>> {
        let start: BTreeSet<String> = [path.to_string()].into();
        let mut paths = self.compute_closure(&start, with_components, with_state, revision)?;

        if include_outputs {
            let derivations: Vec<String> = paths
                .iter()
                .filter(|p| is_derivation(p))
                .cloned()
                .collect();
            for drv_path in derivations {
                let drv = Derivation::read(&drv_path)?;
                for output in drv.output_paths() {
                    if is_valid_path(&self.db, &self.tables, output)? {
                        let start: BTreeSet<String> = [output.to_string()].into();
                        let output_closure = compute_closure(
                            &self.db,
                            &self.tables,
                            &self.dirs,
                            &start,
                            with_components,
                            with_state,
                            revision,
                        )?;
                        paths.extend(output_closure);
                    }
                }
            }
        }

        Ok(paths)
    }
}
