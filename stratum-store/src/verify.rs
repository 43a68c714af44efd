//! Store verification.
//!
//! One transaction walks the whole database, restores the cleanup
//! invariant (only realisable paths carry references, derivers or
//! substitutes) and reports what it cannot repair. Diagnostics are
//! accumulated, not fatal; a deep check additionally rehashes every
//! valid path and reports mismatches without touching them.

use std::collections::BTreeSet;
use std::path::Path;

use stratum_store_core::hash::HashAlgo;
use stratum_store_db::{split_db_key, ReadTxn as _};
use tracing::{info, warn};

use crate::error::Result;
use crate::ingest::hash_path;
use crate::references::set_references;
use crate::validity::{invalidate_path, query_hash_txn, read_substitutes};
use crate::LocalStore;

/// One finding of a verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyIssue {
    PathDisappeared(String),
    PathOutsideStore(String),
    HashMismatch { path: String, expected: String, actual: String },
    RemovedSubstitutes(String),
    RemovedDeriver(String),
    ClearedReferences(String),
    IncompleteClosure { path: String, missing: String },
}

impl std::fmt::Display for VerifyIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyIssue::PathDisappeared(p) => write!(f, "path `{p}` disappeared"),
            VerifyIssue::PathOutsideStore(p) => write!(f, "path `{p}` is not in the store"),
            VerifyIssue::HashMismatch { path, expected, actual } => {
                write!(f, "path `{path}` was modified: expected {expected}, got {actual}")
            }
            VerifyIssue::RemovedSubstitutes(p) => {
                write!(f, "removed substitutes for `{p}`")
            }
            VerifyIssue::RemovedDeriver(p) => write!(f, "removed deriver entry for `{p}`"),
            VerifyIssue::ClearedReferences(p) => {
                write!(f, "cleared references of unrealisable path `{p}`")
            }
            VerifyIssue::IncompleteClosure { path, missing } => {
                write!(f, "incomplete closure: `{path}` needs missing `{missing}`")
            }
        }
    }
}

impl LocalStore {
    /// Check the store against its database and repair what can be
    /// repaired. With `check_contents`, also rehash every valid path.
    pub fn verify(&mut self, check_contents: bool) -> Result<Vec<VerifyIssue>> {
        self.check_writable()?;
        let mut issues = Vec::new();

        let interrupt = self.interrupt.clone();
        let Self { db, tables, dirs, .. } = self;
        let txn = db.transaction()?;

        info!("checking path existence");

        let mut valid_paths = BTreeSet::new();
        for path in txn.enumerate_keys(tables.valid)? {
            crate::check_interrupt(&interrupt)?;
            if !Path::new(&path).exists() {
                warn!(path = %path, "path disappeared");
                invalidate_path(&txn, tables, dirs, &path)?;
                issues.push(VerifyIssue::PathDisappeared(path));
            } else if !dirs.is_store_path(&path) {
                warn!(path = %path, "path is not in the store");
                invalidate_path(&txn, tables, dirs, &path)?;
                issues.push(VerifyIssue::PathOutsideStore(path));
            } else {
                if check_contents {
                    let expected = query_hash_txn(&txn, tables, &path)?;
                    let actual = hash_path(HashAlgo::Sha256, Path::new(&path))?;
                    if expected != actual {
                        warn!(path = %path, "path contents were modified");
                        issues.push(VerifyIssue::HashMismatch {
                            path: path.clone(),
                            expected: expected.to_db_string(),
                            actual: actual.to_db_string(),
                        });
                    }
                }
                valid_paths.insert(path);
            }
        }

        let mut valid_state_paths = BTreeSet::new();
        for path in txn.enumerate_keys(tables.valid_state)? {
            crate::check_interrupt(&interrupt)?;
            if !Path::new(&path).exists() {
                warn!(path = %path, "state path disappeared");
                invalidate_path(&txn, tables, dirs, &path)?;
                issues.push(VerifyIssue::PathDisappeared(path));
            } else {
                valid_state_paths.insert(path);
            }
        }

        info!("checking path realisability");

        let mut realisable = valid_paths.clone();
        for path in txn.enumerate_keys(tables.substitutes)? {
            crate::check_interrupt(&interrupt)?;
            if !dirs.is_store_path(&path) {
                warn!(path = %path, "removing substitutes for non-store path");
                txn.delete(tables.substitutes, &path)?;
                issues.push(VerifyIssue::RemovedSubstitutes(path));
            } else if read_substitutes(&txn, tables, &path)?.is_empty() {
                txn.delete(tables.substitutes, &path)?;
            } else {
                realisable.insert(path);
            }
        }

        info!("checking the derivers table");

        for path in txn.enumerate_keys(tables.derivers)? {
            crate::check_interrupt(&interrupt)?;
            if !realisable.contains(&path) {
                warn!(path = %path, "removing deriver entry for unrealisable path");
                txn.delete(tables.derivers, &path)?;
                issues.push(VerifyIssue::RemovedDeriver(path));
                continue;
            }
            let derivers = txn.get_list(tables.derivers, &path)?;
            if derivers.iter().any(|d| !dirs.is_store_path(d)) {
                warn!(path = %path, "removing corrupt deriver entry");
                txn.delete(tables.derivers, &path)?;
                issues.push(VerifyIssue::RemovedDeriver(path));
            }
        }

        info!("checking the reference tables");

        for (table, target_valid) in [
            (tables.refs_cc, &valid_paths),
            (tables.refs_cs, &valid_state_paths),
        ] {
            for path in txn.enumerate_keys(table)? {
                crate::check_interrupt(&interrupt)?;
                if !realisable.contains(&path) {
                    warn!(path = %path, "clearing references of unrealisable path");
                    set_references(
                        &txn,
                        tables,
                        dirs,
                        &path,
                        &BTreeSet::new(),
                        &BTreeSet::new(),
                        0,
                    )?;
                    issues.push(VerifyIssue::ClearedReferences(path));
                    continue;
                }
                if !valid_paths.contains(&path) {
                    continue;
                }
                for reference in txn.get_list(table, &path)? {
                    if !target_valid.contains(&reference) {
                        warn!(path = %path, reference = %reference, "incomplete closure");
                        issues.push(VerifyIssue::IncompleteClosure {
                            path: path.clone(),
                            missing: reference,
                        });
                    }
                }
            }
        }

        // timestamped reference tables: drop entries of unrealisable
        // state paths
        for table in [tables.refs_sc, tables.refs_ss] {
            for key in txn.enumerate_keys(table)? {
                crate::check_interrupt(&interrupt)?;
                let (state_path, _ts) = split_db_key(&key)?;
                let has_substitutes = !read_substitutes(&txn, tables, &state_path)?.is_empty();
                if !valid_state_paths.contains(&state_path) && !has_substitutes {
                    warn!(path = %state_path, "dropping references of unrealisable state path");
                    txn.delete(table, &key)?;
                    issues.push(VerifyIssue::ClearedReferences(state_path));
                }
            }
        }

        txn.commit()?;
        info!(findings = issues.len(), "verification finished");
        Ok(issues)
    }
}
