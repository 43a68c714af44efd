//! The local stratum store.
//!
//! A content-addressed store of immutable component paths plus a
//! parallel store of mutable, versioned state paths, governed by a
//! transactional metadata database. [`LocalStore`] is the process-wide
//! handle: one per process, constructed with [`LocalStore::open`], torn
//! down on drop.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stratum_store_core::store_path::StoreDirs;
use stratum_store_db::{Db, TableId};
use tracing::{debug, warn};

mod canonicalize;
mod closure;
mod config;
mod error;
mod export;
mod ingest;
mod migrate;
mod pathlocks;
mod references;
mod scan;
mod sharing;
mod state;
mod validity;
mod verify;

pub use config::StoreConfig;
pub use error::{IoContext, Result, StoreError};
pub use export::EXPORT_MAGIC;
pub use ingest::{compute_store_path_for_path, hash_path};
pub use migrate::SCHEMA_VERSION;
pub use pathlocks::PathLock;
pub use scan::RefScanSink;
pub use validity::{Substitute, ValidPathInfo};
pub use verify::VerifyIssue;

pub use stratum_store_db::{RevisionClosure, RevisionInfo, Snapshots, StateRevision};

/// Environment variable disabling the symlinked-store check.
const IGNORE_SYMLINK_STORE_ENV: &str = "STRATUM_IGNORE_SYMLINK_STORE";

/// Handles to every metadata table.
pub(crate) struct Tables {
    pub valid: TableId,
    pub valid_state: TableId,
    pub substitutes: TableId,
    pub derivers: TableId,
    pub state_info: TableId,
    pub state_counters: TableId,
    pub refs_cc: TableId,
    pub refs_cs: TableId,
    pub refs_sc: TableId,
    pub refs_ss: TableId,
    pub solid_cs: TableId,
    pub revisions: TableId,
    pub revision_comments: TableId,
    pub snapshots: TableId,
    pub shared_state: TableId,
}

impl Tables {
    fn open(db: &mut Db) -> Result<Self> {
        Ok(Tables {
            valid: db.open_table("validpaths")?,
            valid_state: db.open_table("validpaths_state")?,
            substitutes: db.open_table("substitutes")?,
            derivers: db.open_table("derivers")?,
            state_info: db.open_table("stateinfo")?,
            state_counters: db.open_table("statecounters")?,
            refs_cc: db.open_table("references")?,
            refs_cs: db.open_table("references_c_s")?,
            refs_sc: db.open_table("references_s_c")?,
            refs_ss: db.open_table("references_s_s")?,
            solid_cs: db.open_table("references_solid_c_s")?,
            revisions: db.open_table("staterevisions")?,
            revision_comments: db.open_table("staterevisions_comments")?,
            snapshots: db.open_table("statesnapshots")?,
            shared_state: db.open_table("sharedstate")?,
        })
    }
}

/// The store and its parent directories must not be symlinks: a moved
/// store would silently change every path's identity.
fn check_store_not_symlink(store_dir: &str) -> Result<()> {
    if std::env::var(IGNORE_SYMLINK_STORE_ENV).as_deref() == Ok("1") {
        return Ok(());
    }
    let mut path = Path::new(store_dir);
    loop {
        let metadata = fs::symlink_metadata(path)
            .map_err(|e| StoreError::io(format!("getting status of `{}`", path.display()), e))?;
        if metadata.is_symlink() {
            return Err(StoreError::Config(format!(
                "the path `{}` is a symlink; this is not allowed for the store and its parent directories",
                path.display()
            )));
        }
        match path.parent() {
            Some(parent) if parent != path => path = parent,
            _ => return Ok(()),
        }
    }
}

/// Is `dir` writable by the current process?
fn dir_writable(dir: &Path) -> bool {
    let probe = dir.join(".write-probe");
    match fs::OpenOptions::new().write(true).create(true).open(&probe) {
        Ok(_) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

pub(crate) fn check_interrupt(flag: &AtomicBool) -> Result<()> {
    if flag.load(Ordering::Relaxed) {
        Err(StoreError::Interrupted)
    } else {
        Ok(())
    }
}

/// The process-wide store handle.
pub struct LocalStore {
    pub(crate) config: StoreConfig,
    pub(crate) dirs: StoreDirs,
    pub(crate) db: Db,
    pub(crate) tables: Tables,
    pub(crate) read_only: bool,
    pub(crate) interrupt: Arc<AtomicBool>,
}

impl LocalStore {
    /// Open the store described by `config`.
    ///
    /// Creates the directory layout on first use, enforces the
    /// no-symlink rule for the store root, manages the reserved space
    /// file, opens every table and runs schema upgrades. If the database
    /// directory is not writable the store degrades to read-only.
    pub fn open(config: StoreConfig, reserve_space: bool) -> Result<Self> {
        for dir in [
            &config.store_dir,
            &config.state_dir,
            &config.db_dir,
            &config.conf_dir,
        ] {
            fs::create_dir_all(dir)
                .or_else(|e| {
                    // a pre-existing but unwritable tree is handled below
                    if Path::new(dir).is_dir() {
                        Ok(())
                    } else {
                        Err(e)
                    }
                })
                .map_err(|e| StoreError::io(format!("creating `{dir}`"), e))?;
        }

        if !config.ignore_symlink_store {
            check_store_not_symlink(&config.store_dir)?;
        }

        // Reserved space lets cleanup free disk even when the volume is
        // full; failures here are not fatal.
        let reserved = config.reserved_path();
        if reserve_space {
            let needs_write = fs::metadata(&reserved)
                .map(|m| m.len() != config.gc_reserved_space)
                .unwrap_or(true);
            if needs_write {
                let _ = fs::write(&reserved, vec![b'X'; config.gc_reserved_space as usize]);
            }
        } else {
            let _ = fs::remove_file(&reserved);
        }

        let db_path = config.db_path();
        let (mut db, read_only) = if dir_writable(Path::new(&config.db_dir)) {
            (Db::open(&db_path)?, false)
        } else {
            warn!(db_dir = %config.db_dir, "cannot write the database directory; continuing read-only");
            match Db::open_read_only(&db_path) {
                Ok(db) => (db, true),
                Err(_) => (Db::open_memory()?, true),
            }
        };

        let tables = Tables::open(&mut db)?;
        let dirs = config.dirs();

        debug!(store_dir = %config.store_dir, read_only, "opened local store");

        let mut store = LocalStore {
            config,
            dirs,
            db,
            tables,
            read_only,
            interrupt: Arc::new(AtomicBool::new(false)),
        };
        store.check_schema()?;
        Ok(store)
    }

    /// The store's directory roots.
    pub fn store_dirs(&self) -> &StoreDirs {
        &self.dirs
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// A flag long-running operations poll; setting it makes them abort
    /// with [`StoreError::Interrupted`] at the next iteration.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.read_only {
            Err(StoreError::ReadOnly)
        } else {
            Ok(())
        }
    }
}
