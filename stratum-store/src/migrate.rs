//! On-disk schema versioning and upgrades.
//!
//! The schema version lives as a decimal integer in `<dbDir>/schema`.
//! Version 3 is current; version 4 is a legacy branch layout that is
//! accepted as-is. Anything below 3 runs through the upgrade pipeline,
//! committing in batches so no single transaction grows unboundedly.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use stratum_store_core::hash::HashAlgo;
use stratum_store_db::ReadTxn as _;
use tracing::{info, warn};

use crate::error::{IoContext as _, Result, StoreError};
use crate::ingest::hash_path;
use crate::references::set_references;
use crate::validity::set_hash;
use crate::LocalStore;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 3;

/// A later branch bumped the schema without changing the tables this
/// store uses; tolerated on open.
const LEGACY_SCHEMA_VERSION: u32 = 4;

/// Entries per upgrade transaction.
const UPGRADE_BATCH: usize = 1000;

/// Suffix of legacy closure documents registered as valid paths.
const CLOSURE_SUFFIX: &str = ".closure";

fn read_schema(path: &Path) -> Result<u32> {
    match fs::read_to_string(path) {
        Ok(s) => s
            .trim()
            .parse()
            .map_err(|_| StoreError::SchemaCorrupt(format!("`{}`", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(StoreError::io(
            format!("reading `{}`", path.display()),
            e,
        )),
    }
}

impl LocalStore {
    /// Check the persisted schema version and upgrade if it is behind.
    pub(crate) fn check_schema(&mut self) -> Result<()> {
        let schema_path = self.config.schema_path();
        let current = read_schema(&schema_path)?;

        if current > SCHEMA_VERSION && current != LEGACY_SCHEMA_VERSION {
            return Err(StoreError::SchemaTooNew {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        if current == LEGACY_SCHEMA_VERSION || current == SCHEMA_VERSION {
            return Ok(());
        }

        if self.read_only {
            warn!(current, "schema is outdated but the store is read-only");
            return Ok(());
        }

        if current != 0 {
            info!(from = current, to = SCHEMA_VERSION, "upgrading store schema");
        }
        if current <= 1 {
            self.upgrade_to_schema_2()?;
        }
        if current <= 2 {
            self.upgrade_to_schema_3()?;
        }

        fs::write(&schema_path, SCHEMA_VERSION.to_string())
            .io_context(|| format!("writing `{}`", schema_path.display()))?;
        Ok(())
    }

    /// Schema 2: every valid path carries its content hash, and legacy
    /// closure documents are folded into the reference relation.
    fn upgrade_to_schema_2(&mut self) -> Result<()> {
        let all_paths = self.db.enumerate_keys(self.tables.valid)?;
        let valid: BTreeSet<String> = all_paths.iter().cloned().collect();

        let mut unhashed = Vec::new();
        for path in &all_paths {
            if self
                .db
                .get_string(self.tables.valid, path)?
                .is_some_and(|v| v.is_empty())
            {
                unhashed.push(path.clone());
            }
        }

        if !unhashed.is_empty() {
            info!(count = unhashed.len(), "hashing unhashed valid paths");
        }
        for batch in unhashed.chunks(UPGRADE_BATCH) {
            let interrupt = self.interrupt.clone();
            let Self { db, tables, .. } = self;
            let txn = db.transaction()?;
            for path in batch {
                crate::check_interrupt(&interrupt)?;
                let hash = hash_path(HashAlgo::Sha256, Path::new(path))?;
                set_hash(&txn, tables, path, &hash)?;
            }
            txn.commit()?;
        }

        let closures: Vec<String> = all_paths
            .iter()
            .filter(|p| p.ends_with(CLOSURE_SUFFIX))
            .cloned()
            .collect();

        for batch in closures.chunks(UPGRADE_BATCH) {
            let interrupt = self.interrupt.clone();
            let Self { db, tables, dirs, .. } = self;
            let txn = db.transaction()?;
            for closure_path in batch {
                crate::check_interrupt(&interrupt)?;

                let content = match fs::read_to_string(closure_path) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(path = %closure_path, error = %e, "cannot read legacy closure");
                        continue;
                    }
                };
                let parsed: std::collections::BTreeMap<String, Vec<String>> =
                    match serde_json::from_str(&content) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(path = %closure_path, error = %e, "cannot parse legacy closure");
                            continue;
                        }
                    };

                for (path, references) in parsed {
                    // invalid member paths are normal in old closures
                    if !valid.contains(&path) {
                        continue;
                    }
                    let references: BTreeSet<String> = references.into_iter().collect();
                    for reference in &references {
                        if !valid.contains(reference) {
                            warn!(closure = %closure_path, path = %path, reference = %reference, "legacy closure references an invalid path");
                        }
                    }

                    let previous: BTreeSet<String> =
                        txn.get_list(tables.refs_cc, &path)?.into_iter().collect();
                    if !previous.is_empty() && previous != references {
                        warn!(path = %path, "conflicting references between legacy closures");
                    }
                    if previous != references {
                        set_references(&txn, tables, dirs, &path, &references, &BTreeSet::new(), 0)?;
                    }
                }
            }
            txn.commit()?;
        }

        Ok(())
    }

    /// Schema 3: the reverse-reference index is gone; inverse queries
    /// scan the forward tables.
    fn upgrade_to_schema_3(&mut self) -> Result<()> {
        if self.db.table_exists("referrers")? {
            info!("dropping legacy referrers table");
            self.db.delete_table("referrers")?;
        }
        Ok(())
    }
}
