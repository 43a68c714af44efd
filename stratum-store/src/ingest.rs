//! Ingestion: adding file trees and text artifacts to the store.

use std::collections::BTreeSet;
use std::fs;
use std::io::Write as _;
use std::path::Path;

use stratum_store_core::hash::{Hash, HashAlgo, HashSink};
use stratum_store_core::store_path::StoreDirs;
use tracing::debug;

use crate::canonicalize::canonicalize_path_metadata;
use crate::error::{IoContext as _, Result, StoreError};
use crate::pathlocks::PathLock;
use crate::validity::{register_valid_paths, ValidPathInfo};
use crate::LocalStore;

/// Hash of a path: the digest of its archive serialisation.
pub fn hash_path(algo: HashAlgo, path: &Path) -> Result<Hash> {
    let mut sink = HashSink::new(algo);
    stratum_archive::dump(path, &mut sink)?;
    Ok(sink.finish())
}

/// Hash of a file's raw contents (the flat fixed-output flavour).
fn hash_file(algo: HashAlgo, path: &Path) -> Result<Hash> {
    let mut sink = HashSink::new(algo);
    let mut file = fs::File::open(path).io_context(|| format!("opening `{}`", path.display()))?;
    std::io::copy(&mut file, &mut sink)
        .io_context(|| format!("reading `{}`", path.display()))?;
    Ok(sink.finish())
}

/// Copy a tree by dumping and restoring it, which canonicalises entry
/// order, permissions and timestamps along the way.
pub(crate) fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    debug!(src = %src.display(), dst = %dst.display(), "copying path");
    let archive = stratum_archive::dump_to_vec(src)?;
    stratum_archive::restore_from_slice(&archive, dst)?;
    Ok(())
}

/// The destination path and tree hash ingestion will use for `src_path`,
/// without touching the store.
pub fn compute_store_path_for_path(
    dirs: &StoreDirs,
    src_path: &Path,
    fixed: bool,
    recursive: bool,
    hash_algo: HashAlgo,
) -> Result<(String, Hash)> {
    let tree_hash = hash_path(HashAlgo::Sha256, src_path)?;

    let name = src_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::Config(format!("`{}` has no name", src_path.display())))?;

    let dst_path = if fixed {
        let inner = if recursive {
            hash_path(hash_algo, src_path)?
        } else {
            hash_file(hash_algo, src_path)?
        };
        dirs.make_fixed_output_path(recursive, hash_algo, &inner, name)?
    } else {
        dirs.make_store_path("source", &tree_hash, name)?
    };

    Ok((dst_path, tree_hash))
}

impl LocalStore {
    /// Register a path as a temporary root so cleanup leaves it alone
    /// while ingestion is still in flight.
    pub(crate) fn add_temp_root(&self, path: &str) -> Result<()> {
        let roots = self.config.temp_roots_path();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&roots)
            .io_context(|| format!("opening `{}`", roots.display()))?;
        writeln!(file, "{path}").io_context(|| format!("writing `{}`", roots.display()))?;
        Ok(())
    }

    /// Copy `src_path` into the store under its content-addressed name.
    ///
    /// Idempotent: if the destination is already valid the call returns
    /// it untouched. The copy, rehash and registration happen under an
    /// exclusive per-path lock, double-checked against the validity
    /// table.
    pub fn add_to_store(
        &mut self,
        src_path: &Path,
        fixed: bool,
        recursive: bool,
        hash_algo: HashAlgo,
    ) -> Result<String> {
        self.check_writable()?;
        debug!(src = %src_path.display(), "adding path to the store");

        let (dst_path, hash) =
            compute_store_path_for_path(&self.dirs, src_path, fixed, recursive, hash_algo)?;

        self.add_temp_root(&dst_path)?;

        // cheap pre-check before taking the lock
        if self.is_valid(&dst_path)? {
            return Ok(dst_path);
        }

        let _lock = PathLock::lock(Path::new(&dst_path))
            .io_context(|| format!("locking `{dst_path}`"))?;

        if self.is_valid(&dst_path)? {
            return Ok(dst_path);
        }

        if Path::new(&dst_path).exists() {
            crate::state::remove_any_path(Path::new(&dst_path))?;
        }

        copy_path(src_path, Path::new(&dst_path))?;

        let rehashed = hash_path(HashAlgo::Sha256, Path::new(&dst_path))?;
        if rehashed != hash {
            return Err(StoreError::HashMismatch {
                path: dst_path,
                expected: hash.to_db_string(),
                actual: rehashed.to_db_string(),
            });
        }

        canonicalize_path_metadata(Path::new(&dst_path))?;

        let info = ValidPathInfo {
            path: dst_path.clone(),
            hash: Some(hash),
            ..Default::default()
        };
        let Self { db, tables, dirs, .. } = self;
        let txn = db.transaction()?;
        register_valid_paths(&txn, tables, dirs, &[info])?;
        txn.commit()?;

        Ok(dst_path)
    }

    /// Write `contents` verbatim into the store as a single file whose
    /// identity also covers `references`.
    pub fn add_text_to_store(
        &mut self,
        suffix: &str,
        contents: &str,
        references: &BTreeSet<String>,
    ) -> Result<String> {
        self.check_writable()?;

        let dst_path = self
            .dirs
            .compute_store_path_for_text(suffix, contents, references)?;

        self.add_temp_root(&dst_path)?;

        if self.is_valid(&dst_path)? {
            return Ok(dst_path);
        }

        let _lock = PathLock::lock(Path::new(&dst_path))
            .io_context(|| format!("locking `{dst_path}`"))?;

        if self.is_valid(&dst_path)? {
            return Ok(dst_path);
        }

        if Path::new(&dst_path).exists() {
            crate::state::remove_any_path(Path::new(&dst_path))?;
        }

        fs::write(&dst_path, contents).io_context(|| format!("writing `{dst_path}`"))?;
        canonicalize_path_metadata(Path::new(&dst_path))?;

        let info = ValidPathInfo {
            path: dst_path.clone(),
            hash: Some(hash_path(HashAlgo::Sha256, Path::new(&dst_path))?),
            references: references.clone(),
            ..Default::default()
        };
        let Self { db, tables, dirs, .. } = self;
        let txn = db.transaction()?;
        register_valid_paths(&txn, tables, dirs, &[info])?;
        txn.commit()?;

        Ok(dst_path)
    }

    /// Delete a path from store and database. Refuses with `InUse` while
    /// any other valid path still refers to it.
    pub fn delete_from_store(&mut self, path: &str) -> Result<u64> {
        self.check_writable()?;
        self.dirs.assert_store_path(path)?;

        if self.is_valid(path)? {
            let referrers = self.query_referrers(path, 0)?;
            for referrer in referrers {
                if referrer != path && self.is_valid(&referrer)? {
                    return Err(StoreError::InUse {
                        path: path.to_string(),
                        referrer,
                    });
                }
            }
            let Self { db, tables, dirs, .. } = self;
            let txn = db.transaction()?;
            crate::validity::invalidate_path(&txn, tables, dirs, path)?;
            txn.commit()?;
        }

        let bytes_freed = dir_size(Path::new(path)).unwrap_or(0);
        if Path::new(path).exists() {
            crate::state::remove_any_path(Path::new(path))?;
        }
        Ok(bytes_freed)
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += dir_size(&entry?.path())?;
    }
    Ok(total)
}
