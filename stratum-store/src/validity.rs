//! The validity and deriver registry.
//!
//! A component path is valid when the `valid` table holds its content
//! hash; a state path is valid when `valid-state` maps it to the
//! derivation that produced it. A path is *realisable* when it is valid
//! or at least one substitute knows how to produce it. Only realisable
//! paths may carry references, derivers or substitutes; that is the
//! cleanup invariant the verifier re-establishes.

use std::collections::BTreeSet;
use std::fs;

use stratum_store_core::derivation::Derivation;
use stratum_store_core::hash::Hash;
use stratum_store_core::store_path::StoreDirs;
use stratum_store_db::{ReadTxn, Txn};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::references::set_references;
use crate::{LocalStore, Tables};

/// Everything registered along with a newly valid path.
#[derive(Debug, Clone, Default)]
pub struct ValidPathInfo {
    pub path: String,
    /// Content hash; required for component paths, absent for state paths.
    pub hash: Option<Hash>,
    pub references: BTreeSet<String>,
    pub state_references: BTreeSet<String>,
    /// Producing derivation, or empty.
    pub deriver: String,
    /// Revision to record state references under; 0 = new commit.
    pub revision: u64,
}

/// A fallback command that can materialise a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitute {
    pub deriver: String,
    pub program: String,
    pub args: Vec<String>,
}

const SUBSTITUTE_VERSION: &str = "2";

pub(crate) fn is_valid_path<R: ReadTxn>(r: &R, t: &Tables, path: &str) -> Result<bool> {
    Ok(r.contains(t.valid, path)?)
}

pub(crate) fn is_valid_state_path<R: ReadTxn>(r: &R, t: &Tables, path: &str) -> Result<bool> {
    Ok(r.contains(t.valid_state, path)?)
}

/// Substitutes are stored flattened: for each record a version tag, the
/// deriver, the program, the argument count and then the arguments.
pub(crate) fn read_substitutes<R: ReadTxn>(
    r: &R,
    t: &Tables,
    path: &str,
) -> Result<Vec<Substitute>> {
    let fields = r.get_list(t.substitutes, path)?;
    let corrupt = || {
        StoreError::Db(stratum_store_db::Error::Corrupt(format!(
            "malformed substitute list for `{path}`"
        )))
    };

    let mut subs = Vec::new();
    let mut i = 0;
    while i < fields.len() {
        if fields[i] != SUBSTITUTE_VERSION || i + 4 > fields.len() {
            return Err(corrupt());
        }
        let argc: usize = fields[i + 3].parse().map_err(|_| corrupt())?;
        if i + 4 + argc > fields.len() {
            return Err(corrupt());
        }
        subs.push(Substitute {
            deriver: fields[i + 1].clone(),
            program: fields[i + 2].clone(),
            args: fields[i + 4..i + 4 + argc].to_vec(),
        });
        i += 4 + argc;
    }
    Ok(subs)
}

fn write_substitutes(txn: &Txn<'_>, t: &Tables, path: &str, subs: &[Substitute]) -> Result<()> {
    let mut fields = Vec::new();
    for sub in subs {
        fields.push(SUBSTITUTE_VERSION.to_string());
        fields.push(sub.deriver.clone());
        fields.push(sub.program.clone());
        fields.push(sub.args.len().to_string());
        fields.extend(sub.args.iter().cloned());
    }
    txn.put_list(t.substitutes, path, &fields)?;
    Ok(())
}

pub(crate) fn is_realisable<R: ReadTxn>(r: &R, t: &Tables, path: &str) -> Result<bool> {
    Ok(is_valid_path(r, t, path)? || !read_substitutes(r, t, path)?.is_empty())
}

pub(crate) fn is_realisable_state<R: ReadTxn>(r: &R, t: &Tables, path: &str) -> Result<bool> {
    Ok(is_valid_state_path(r, t, path)? || !read_substitutes(r, t, path)?.is_empty())
}

pub(crate) fn is_realisable_any<R: ReadTxn>(r: &R, t: &Tables, path: &str) -> Result<bool> {
    Ok(is_valid_path(r, t, path)?
        || is_valid_state_path(r, t, path)?
        || !read_substitutes(r, t, path)?.is_empty())
}

pub(crate) fn query_hash_txn<R: ReadTxn>(r: &R, t: &Tables, path: &str) -> Result<Hash> {
    let stored = r
        .get_string(t.valid, path)?
        .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
    Ok(Hash::parse(&stored)?)
}

pub(crate) fn set_hash(txn: &Txn<'_>, t: &Tables, path: &str, hash: &Hash) -> Result<()> {
    txn.put_string(t.valid, path, &hash.to_db_string())?;
    Ok(())
}

fn set_state_valid(txn: &Txn<'_>, t: &Tables, state_path: &str, deriver: &str) -> Result<()> {
    txn.put_string(t.valid_state, state_path, deriver)?;
    Ok(())
}

pub(crate) fn query_state_path_drv_txn<R: ReadTxn>(
    r: &R,
    t: &Tables,
    state_path: &str,
) -> Result<String> {
    r.get_string(t.valid_state, state_path)?
        .ok_or_else(|| StoreError::InvalidPath(state_path.to_string()))
}

pub(crate) fn is_state_component<R: ReadTxn>(r: &R, t: &Tables, path: &str) -> Result<bool> {
    Ok(r.contains(t.state_info, path)?)
}

pub(crate) fn query_deriver_txn<R: ReadTxn>(r: &R, t: &Tables, path: &str) -> Result<String> {
    let derivers = r.get_list(t.derivers, path)?;
    if is_state_component(r, t, path)? {
        return Err(StoreError::Config(format!(
            "`{path}` is a stateful component; use query_derivers with an identifier and user"
        )));
    }
    Ok(derivers.into_iter().next().unwrap_or_default())
}

/// Derivers of a stateful component, filtered on state identifier and
/// user. `"*"` matches any value.
pub(crate) fn query_derivers_txn<R: ReadTxn>(
    r: &R,
    t: &Tables,
    path: &str,
    identifier: &str,
    user: &str,
) -> Result<Vec<String>> {
    if user.is_empty() {
        return Err(StoreError::Config(
            "the user argument is empty; use query_deriver for stateless components".into(),
        ));
    }
    let mut matching = Vec::new();
    for drv_path in r.get_list(t.derivers, path)? {
        let drv = Derivation::read(&drv_path)?;
        let state = drv.state_output(&drv_path)?;
        if (state.state_identifier == identifier || identifier == "*")
            && (state.username == user || user == "*")
        {
            matching.push(drv_path);
        }
    }
    Ok(matching)
}

/// Record the deriver of `path`. Stateful derivations are merged into the
/// deriver list instead of overwriting it.
pub(crate) fn set_deriver(
    txn: &Txn<'_>,
    t: &Tables,
    dirs: &StoreDirs,
    path: &str,
    deriver: &str,
) -> Result<()> {
    dirs.assert_store_path(path)?;
    if deriver.is_empty() {
        return Ok(());
    }
    dirs.assert_store_path(deriver)?;
    if !is_realisable(txn, t, path)? {
        return Err(StoreError::InvalidPath(path.to_string()));
    }

    let drv = Derivation::read(deriver)?;
    if drv.is_stateful() {
        add_state_deriver(txn, t, dirs, path, deriver, &drv)
    } else {
        txn.put_list(t.derivers, path, &[deriver])?;
        Ok(())
    }
}

/// Merge a stateful deriver into the deriver list of `path`.
///
/// At most one deriver may exist per `(state identifier, user)` pair: a
/// colliding older entry is evicted and its derivation file deleted from
/// disk. Also marks `path` as a stateful component.
pub(crate) fn add_state_deriver(
    txn: &Txn<'_>,
    t: &Tables,
    dirs: &StoreDirs,
    path: &str,
    deriver: &str,
    drv: &Derivation,
) -> Result<()> {
    dirs.assert_store_path(path)?;
    dirs.assert_store_path(deriver)?;
    if !is_realisable(txn, t, path)? {
        return Err(StoreError::InvalidPath(path.to_string()));
    }

    let state = drv.state_output(deriver)?;
    let mut kept = Vec::new();
    for existing in txn.get_list(t.derivers, path)? {
        if existing == deriver {
            continue;
        }
        let existing_drv = Derivation::read(&existing)?;
        let existing_state = existing_drv.state_output(&existing)?;
        if existing_state.state_identifier == state.state_identifier
            && existing_state.username == state.username
        {
            debug!(old = %existing, new = deriver, "evicting superseded state deriver");
            match fs::remove_file(&existing) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(format!("deleting `{existing}`"), e)),
            }
        } else {
            kept.push(existing);
        }
    }
    kept.push(deriver.to_string());

    txn.put_list(t.derivers, path, &kept)?;
    txn.put_string(t.state_info, path, "")?;
    Ok(())
}

/// Register a batch of paths as valid, atomically.
///
/// Every component reference of a registered path must already be valid
/// or be part of the same batch.
pub(crate) fn register_valid_paths(
    txn: &Txn<'_>,
    t: &Tables,
    dirs: &StoreDirs,
    infos: &[ValidPathInfo],
) -> Result<()> {
    let batch: BTreeSet<&str> = infos.iter().map(|i| i.path.as_str()).collect();

    for info in infos {
        let is_component = dirs.is_store_path(&info.path);
        if !is_component {
            dirs.assert_state_path(&info.path)?;
        }

        debug!(path = %info.path, "registering path");

        if is_component {
            let hash = info
                .hash
                .as_ref()
                .ok_or_else(|| StoreError::InvalidPath(info.path.clone()))?;
            set_hash(txn, t, &info.path, hash)?;
        } else {
            set_state_valid(txn, t, &info.path, &info.deriver)?;
        }

        set_references(
            txn,
            t,
            dirs,
            &info.path,
            &info.references,
            &info.state_references,
            info.revision,
        )?;

        for reference in &info.references {
            if !is_valid_path(txn, t, reference)? && !batch.contains(reference.as_str()) {
                return Err(StoreError::InvalidPath(reference.clone()));
            }
        }

        if is_component && !info.deriver.is_empty() {
            set_deriver(txn, t, dirs, &info.path, &info.deriver)?;
        }
    }
    Ok(())
}

/// Unregister a path. The caller is responsible for checking referrers.
///
/// References and the deriver entry are only cleared when no substitutes
/// remain, preserving the cleanup invariant for substitutable paths.
pub(crate) fn invalidate_path(
    txn: &Txn<'_>,
    t: &Tables,
    dirs: &StoreDirs,
    path: &str,
) -> Result<()> {
    debug!(path, "unregistering path");

    if read_substitutes(txn, t, path)?.is_empty() {
        set_references(txn, t, dirs, path, &BTreeSet::new(), &BTreeSet::new(), 0)?;
        txn.delete(t.derivers, path)?;
    }

    txn.delete(t.valid, path)?;
    txn.delete(t.valid_state, path)?;
    Ok(())
}

/// Put a substitute at the front of the list, demoting any duplicate.
pub(crate) fn register_substitute(
    txn: &Txn<'_>,
    t: &Tables,
    dirs: &StoreDirs,
    path: &str,
    sub: &Substitute,
) -> Result<()> {
    dirs.assert_store_path(path)?;

    let mut subs = read_substitutes(txn, t, path)?;
    subs.retain(|existing| existing != sub);
    subs.insert(0, sub.clone());
    write_substitutes(txn, t, path, &subs)
}

impl LocalStore {
    pub fn is_valid(&self, path: &str) -> Result<bool> {
        is_valid_path(&self.db, &self.tables, path)
    }

    pub fn is_valid_state(&self, path: &str) -> Result<bool> {
        is_valid_state_path(&self.db, &self.tables, path)
    }

    /// The stored content hash of a valid component path.
    pub fn query_hash(&self, path: &str) -> Result<Hash> {
        if !self.is_valid(path)? {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        query_hash_txn(&self.db, &self.tables, path)
    }

    /// The derivation recorded for a valid state path.
    pub fn query_state_path_drv(&self, state_path: &str) -> Result<String> {
        if !self.is_valid_state(state_path)? {
            return Err(StoreError::InvalidPath(state_path.to_string()));
        }
        query_state_path_drv_txn(&self.db, &self.tables, state_path)
    }

    /// Is this component marked as keeping state?
    pub fn is_state_component(&self, path: &str) -> Result<bool> {
        is_state_component(&self.db, &self.tables, path)
    }

    pub fn query_deriver(&self, path: &str) -> Result<String> {
        if !is_realisable(&self.db, &self.tables, path)? {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        query_deriver_txn(&self.db, &self.tables, path)
    }

    pub fn query_derivers(&self, path: &str, identifier: &str, user: &str) -> Result<Vec<String>> {
        if !is_realisable(&self.db, &self.tables, path)? {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        query_derivers_txn(&self.db, &self.tables, path, identifier, user)
    }

    pub fn query_substitutes(&self, path: &str) -> Result<Vec<Substitute>> {
        read_substitutes(&self.db, &self.tables, path)
    }

    pub fn register_substitute(&mut self, path: &str, sub: &Substitute) -> Result<()> {
        self.check_writable()?;
        let Self { db, tables, dirs, .. } = self;
        let txn = db.transaction()?;
        register_substitute(&txn, tables, dirs, path, sub)?;
        txn.commit()?;
        Ok(())
    }

    /// Drop every substitute and re-establish the cleanup invariant for
    /// paths left unrealisable.
    pub fn clear_substitutes(&mut self) -> Result<()> {
        self.check_writable()?;
        let Self { db, tables, dirs, .. } = self;
        let txn = db.transaction()?;
        for path in txn.enumerate_keys(tables.substitutes)? {
            txn.delete(tables.substitutes, &path)?;
            if !is_valid_path(&txn, tables, &path)? {
                invalidate_path(&txn, tables, dirs, &path)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn register_valid_path(&mut self, info: &ValidPathInfo) -> Result<()> {
        self.register_valid_paths(std::slice::from_ref(info))
    }

    pub fn register_valid_paths(&mut self, infos: &[ValidPathInfo]) -> Result<()> {
        self.check_writable()?;
        let Self { db, tables, dirs, .. } = self;
        let txn = db.transaction()?;
        register_valid_paths(&txn, tables, dirs, infos)?;
        txn.commit()?;
        Ok(())
    }

    /// All valid component and state paths.
    pub fn query_all_valid_paths(&self) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let components = self.db.enumerate_keys(self.tables.valid)?.into_iter().collect();
        let state = self
            .db
            .enumerate_keys(self.tables.valid_state)?
            .into_iter()
            .collect();
        Ok((components, state))
    }
}
