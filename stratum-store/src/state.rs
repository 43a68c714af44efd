//! State path lifecycle: interval counters, commits, snapshot storage,
//! revision queries, reference scanning and reverts.
//!
//! Committing a state path walks its top-level subpaths in sorted order,
//! decides per subpath whether this run is due (interval counters), and
//! dumps each due subpath into snapshot storage keyed by its snapshot
//! timestamp. The resulting `subpath → timestamp` map is what
//! `set_state_revisions` records; `revert_to_revision` plays the stored
//! archives back.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use stratum_store_core::base32;
use stratum_store_core::hash::HashAlgo;
use stratum_store_db::{
    query_available_state_revisions, query_state_revisions, set_state_revisions, ReadTxn,
    RevisionClosure, RevisionInfo, Snapshots, StateRevision, Txn,
};
use tracing::{debug, info};

use crate::error::{IoContext as _, Result, StoreError};
use crate::references::{
    query_references_txn, query_solid_state_references, set_references,
};
use crate::scan::RefScanSink;
use crate::sharing::to_non_shared_path;
use crate::{LocalStore, Tables};

/// File name for the snapshot of a state path that is itself a file.
const ROOT_SUBPATH_NAME: &str = "@root";

/// Suffix separating the run counter from the configured interval in the
/// counters table.
const RUNS_SUFFIX: &str = "#runs";

fn snapshot_archive_name(subpath: &str) -> String {
    if subpath.is_empty() {
        ROOT_SUBPATH_NAME.to_string()
    } else {
        subpath.to_string()
    }
}

/// Directory holding the snapshot archives of one state path.
fn snapshot_dir(snapshots_root: &Path, state_path: &str) -> PathBuf {
    let digest = HashAlgo::Sha256.digest(state_path);
    snapshots_root.join(base32::to_base32(&digest.truncate(20)))
}

fn archive_path(snapshots_root: &Path, state_path: &str, subpath: &str, ts: u64) -> PathBuf {
    snapshot_dir(snapshots_root, state_path)
        .join(ts.to_string())
        .join(snapshot_archive_name(subpath))
}

/// The sorted top-level subpaths of a state path. A plain file has the
/// single subpath `""`.
fn subpaths_of(state_path: &str) -> Result<Vec<String>> {
    let metadata = fs::symlink_metadata(state_path)
        .io_context(|| format!("getting attributes of `{state_path}`"))?;
    if !metadata.is_dir() {
        return Ok(vec![String::new()]);
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(state_path).io_context(|| format!("reading `{state_path}`"))? {
        let entry = entry.io_context(|| format!("reading `{state_path}`"))?;
        names.push(
            entry
                .file_name()
                .into_string()
                .map_err(|_| StoreError::Config(format!("non-UTF-8 entry in `{state_path}`")))?,
        );
    }
    names.sort();
    Ok(names)
}

fn counter_key(state_path: &str, subpath: &str) -> String {
    format!("{state_path}/{subpath}")
}

fn read_counter<R: ReadTxn>(r: &R, t: &Tables, key: &str) -> Result<u64> {
    match r.get_string(t.state_counters, key)? {
        Some(s) => s
            .parse()
            .map_err(|_| StoreError::Config(format!("bad interval counter for `{key}`"))),
        None => Ok(0),
    }
}

/// Commit the on-disk contents of a state path.
///
/// Each due subpath is dumped into snapshot storage under a freshly
/// allocated snapshot timestamp; subpaths whose interval is not yet due
/// keep the timestamp of the previous revision. Returns the snapshot map
/// to be recorded with `set_state_revisions`.
pub(crate) fn commit_state_path(
    txn: &Txn<'_>,
    t: &Tables,
    snapshots_root: &Path,
    state_path: &str,
) -> Result<Snapshots> {
    let ts = txn.alloc_timestamp()?;

    let previous: Snapshots = query_state_revisions(txn, t.revisions, t.snapshots, state_path, 0)?
        .and_then(|rev| rev.members.get(state_path).cloned())
        .unwrap_or_default();

    let mut snapshots = Snapshots::new();
    for subpath in subpaths_of(state_path)? {
        let key = counter_key(state_path, &subpath);
        let interval = read_counter(txn, t, &key)?;
        let runs_key = format!("{key}{RUNS_SUFFIX}");
        let runs = read_counter(txn, t, &runs_key)?;
        txn.put_string(t.state_counters, &runs_key, &(runs + 1).to_string())?;

        let due = interval == 0 || runs % interval == 0;
        if !due {
            if let Some(&prev_ts) = previous.get(&subpath) {
                snapshots.insert(subpath, prev_ts);
            }
            continue;
        }

        let source = if subpath.is_empty() {
            PathBuf::from(state_path)
        } else {
            Path::new(state_path).join(&subpath)
        };
        let target = archive_path(snapshots_root, state_path, &subpath, ts);
        fs::create_dir_all(target.parent().expect("archive path has a parent"))
            .io_context(|| format!("creating `{}`", target.display()))?;

        let mut sink = fs::File::create(&target)
            .io_context(|| format!("creating `{}`", target.display()))?;
        stratum_archive::dump(&source, &mut sink)?;

        debug!(path = state_path, subpath = %subpath, ts, "snapshotted subpath");
        snapshots.insert(subpath, ts);
    }

    Ok(snapshots)
}

struct ScanWriter<'a>(&'a mut RefScanSink);

impl io::Write for ScanWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.feed(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Scan a state path's tree for references to known paths and record the
/// result as its current references.
pub(crate) fn scan_and_update_references(
    txn: &Txn<'_>,
    t: &Tables,
    dirs: &stratum_store_core::store_path::StoreDirs,
    state_path: &str,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut candidates: Vec<String> = txn.enumerate_keys(t.valid)?;
    candidates.extend(txn.enumerate_keys(t.valid_state)?);

    let mut sink = RefScanSink::new(dirs, candidates.iter().map(|s| s.as_str()));
    stratum_archive::dump(Path::new(state_path), &mut ScanWriter(&mut sink))?;
    let found = sink.found_paths();

    let mut references: BTreeSet<String> = found
        .iter()
        .filter(|p| dirs.is_store_path(p))
        .cloned()
        .collect();
    let state_references: BTreeSet<String> = found
        .iter()
        .filter(|p| dirs.is_state_path(p))
        .cloned()
        .collect();

    // solid references are reported even when never seen in the tree
    let ns = to_non_shared_path(txn, t, state_path)?;
    references.extend(query_solid_state_references(txn, t, &ns)?);

    info!(
        path = state_path,
        components = references.len(),
        state = state_references.len(),
        "scanned state path references"
    );

    set_references(txn, t, dirs, state_path, &references, &state_references, 0)?;
    Ok((references, state_references))
}

/// Delete a file or tree, restoring owner write permission on
/// directories first (store trees are canonicalised to read-only).
pub(crate) fn remove_any_path(target: &Path) -> Result<()> {
    fn remove_tree(path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt as _;

        let metadata = fs::symlink_metadata(path)?;
        if metadata.is_dir() {
            let mode = metadata.permissions().mode();
            if mode & 0o700 != 0o700 {
                fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))?;
            }
            for entry in fs::read_dir(path)? {
                remove_tree(&entry?.path())?;
            }
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        }
    }

    match remove_tree(target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).io_context(|| format!("removing `{}`", target.display())),
    }
}

/// Restore one member of a revision from snapshot storage.
fn restore_member(snapshots_root: &Path, member: &str, snapshots: &Snapshots) -> Result<()> {
    // wipe live subpaths that the snapshot does not know about
    if Path::new(member).is_dir() && !snapshots.contains_key("") {
        for current in subpaths_of(member)? {
            if !snapshots.contains_key(&current) {
                remove_any_path(&Path::new(member).join(&current))?;
            }
        }
    }

    for (subpath, &sub_ts) in snapshots {
        let archive = archive_path(snapshots_root, member, subpath, sub_ts);
        if !archive.exists() {
            return Err(StoreError::io(
                format!("missing snapshot archive `{}`", archive.display()),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        let target = if subpath.is_empty() {
            PathBuf::from(member)
        } else {
            Path::new(member).join(subpath)
        };
        remove_any_path(&target)?;
        let mut source = fs::File::open(&archive)
            .io_context(|| format!("opening `{}`", archive.display()))?;
        stratum_archive::restore(&mut source, &target)?;
    }
    Ok(())
}

impl LocalStore {
    /// Configure the commit interval of state subpaths. An interval of 0
    /// (the default) snapshots on every commit; `k` snapshots on every
    /// k-th.
    pub fn set_state_paths_interval(&mut self, intervals: &[(String, u64)]) -> Result<()> {
        self.check_writable()?;
        let Self { db, tables, .. } = self;
        let txn = db.transaction()?;
        for (subpath, interval) in intervals {
            txn.put_string(tables.state_counters, subpath, &interval.to_string())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Read back configured intervals. Fails for subpaths that were never
    /// configured.
    pub fn get_state_paths_interval(&self, subpaths: &[String]) -> Result<Vec<u64>> {
        let mut intervals = Vec::with_capacity(subpaths.len());
        for subpath in subpaths {
            let value = self
                .db
                .get_string(self.tables.state_counters, subpath)?
                .ok_or_else(|| {
                    StoreError::Config(format!("no interval recorded for `{subpath}`"))
                })?;
            intervals.push(value.parse().map_err(|_| {
                StoreError::Config(format!("bad interval recorded for `{subpath}`"))
            })?);
        }
        Ok(intervals)
    }

    /// Snapshot the current contents of a state path. Returns the
    /// snapshot map; recording it as a revision is a separate
    /// [`set_state_revisions`](Self::set_state_revisions) call.
    pub fn commit_state_path(&mut self, state_path: &str) -> Result<Snapshots> {
        self.check_writable()?;
        self.dirs.assert_state_path(state_path)?;
        let snapshots_root = self.config.snapshots_dir();

        let Self { db, tables, .. } = self;
        let txn = db.transaction()?;
        let ns = to_non_shared_path(&txn, tables, state_path)?;
        let snapshots = commit_state_path(&txn, tables, &snapshots_root, &ns)?;
        txn.commit()?;
        Ok(snapshots)
    }

    /// Record a closure of snapshot maps as one atomically committed
    /// revision rooted at `root_state_path`.
    pub fn set_state_revisions(
        &mut self,
        closure: &RevisionClosure,
        root_state_path: &str,
        comment: &str,
    ) -> Result<(u64, u64)> {
        self.check_writable()?;
        let Self { db, tables, .. } = self;
        let txn = db.transaction()?;
        let root = to_non_shared_path(&txn, tables, root_state_path)?;
        let result = set_state_revisions(
            &txn,
            tables.revisions,
            tables.revision_comments,
            tables.snapshots,
            closure,
            &root,
            comment,
        )?;
        txn.commit()?;
        Ok(result)
    }

    /// Resolve a revision of a state path into its closure members and
    /// snapshot maps. `None` when the revision does not exist.
    pub fn query_state_revisions(
        &self,
        state_path: &str,
        revision: u64,
    ) -> Result<Option<StateRevision>> {
        let ns = to_non_shared_path(&self.db, &self.tables, state_path)?;
        Ok(query_state_revisions(
            &self.db,
            self.tables.revisions,
            self.tables.snapshots,
            &ns,
            revision,
        )?)
    }

    /// List the revisions of a state path with their comments.
    pub fn query_available_state_revisions(&self, state_path: &str) -> Result<Vec<RevisionInfo>> {
        let ns = to_non_shared_path(&self.db, &self.tables, state_path)?;
        Ok(query_available_state_revisions(
            &self.db,
            self.tables.revisions,
            self.tables.revision_comments,
            &ns,
        )?)
    }

    /// Rescan a state path's tree and record the discovered references
    /// as a new commit. With `recursive`, every state path reachable
    /// through state edges is rescanned too.
    pub fn scan_and_update_all_references(
        &mut self,
        state_path: &str,
        recursive: bool,
    ) -> Result<()> {
        self.check_writable()?;
        self.dirs.assert_state_path(state_path)?;

        let targets: BTreeSet<String> = if recursive {
            let mut set = BTreeSet::new();
            set.insert(state_path.to_string());
            self.compute_closure(&set, false, true, 0)?
                .into_iter()
                .filter(|p| self.dirs.is_state_path(p))
                .collect()
        } else {
            [state_path.to_string()].into()
        };

        let Self { db, tables, dirs, .. } = self;
        let txn = db.transaction()?;
        for target in &targets {
            scan_and_update_references(&txn, tables, dirs, target)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Restore a state path (and with `recursive` its whole snapshot
    /// closure) to the on-disk contents of an earlier revision. The
    /// revert itself is committed as a new revision; history is never
    /// rewritten.
    pub fn revert_to_revision(
        &mut self,
        state_path: &str,
        revision: u64,
        recursive: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let ns = self.to_non_shared_path(state_path)?;
        let resolved = self
            .query_state_revisions(&ns, revision)?
            .ok_or_else(|| StoreError::UnknownRevision {
                path: ns.clone(),
                revision,
            })?;

        let members: RevisionClosure = if recursive {
            resolved.members.clone()
        } else {
            let snapshots = resolved.members.get(&ns).cloned().unwrap_or_default();
            [(ns.clone(), snapshots)].into()
        };

        let snapshots_root = self.config.snapshots_dir();
        for (member, snapshots) in &members {
            restore_member(&snapshots_root, member, snapshots)?;
        }

        info!(path = %ns, revision = resolved.revision, members = members.len(), "reverted state path");

        let Self { db, tables, dirs, .. } = self;
        let txn = db.transaction()?;
        for member in members.keys() {
            let references =
                query_references_txn(&txn, tables, member, true, 0, resolved.timestamp)?;
            let state_references =
                query_references_txn(&txn, tables, member, false, 0, resolved.timestamp)?;
            set_references(&txn, tables, dirs, member, &references, &state_references, 0)?;
        }
        set_state_revisions(
            &txn,
            tables.revisions,
            tables.revision_comments,
            tables.snapshots,
            &members,
            &ns,
            &format!("revert to revision {}", resolved.revision),
        )?;
        txn.commit()?;
        Ok(())
    }
}
