//! The revision index for state paths.
//!
//! Each state path accumulates an ordered list of `(revision, timestamp)`
//! pairs. The timestamp is the physical key: the snapshot map of a
//! revision and the reference lists of a state path are stored under
//! composite `(path, timestamp)` keys. A whole closure of state paths is
//! committed at one shared timestamp, which is globally unique, so the
//! membership of a commit can be recovered from the timestamp alone.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::kv::{merge_db_key, split_db_key, ReadTxn, TableId, Txn};

/// Snapshot map of one state path: subpath → subpath timestamp, ordered
/// by subpath name.
pub type Snapshots = BTreeMap<String, u64>;

/// A closure of state paths committed together.
pub type RevisionClosure = BTreeMap<String, Snapshots>;

/// One entry of a state path's revision list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    pub revision: u64,
    pub timestamp: u64,
    pub comment: String,
}

/// A resolved revision: its closure members and their snapshot maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRevision {
    pub revision: u64,
    pub timestamp: u64,
    pub members: RevisionClosure,
}

fn parse_revision_entry(entry: &str) -> Result<(u64, u64)> {
    let (rev, ts) = entry
        .split_once(':')
        .ok_or_else(|| Error::Corrupt(format!("bad revision entry `{entry}`")))?;
    let rev = rev
        .parse()
        .map_err(|_| Error::Corrupt(format!("bad revision number in `{entry}`")))?;
    let ts = ts
        .parse()
        .map_err(|_| Error::Corrupt(format!("bad timestamp in `{entry}`")))?;
    Ok((rev, ts))
}

/// The `(revision, timestamp)` list of a state path, oldest first.
pub fn revision_list<R: ReadTxn>(
    r: &R,
    rev_table: TableId,
    state_path: &str,
) -> Result<Vec<(u64, u64)>> {
    r.get_list(rev_table, state_path)?
        .iter()
        .map(|e| parse_revision_entry(e))
        .collect()
}

/// Resolve a revision number to its commit timestamp. Revision `0` means
/// the latest. Returns `None` when the revision does not exist.
pub fn revision_to_timestamp<R: ReadTxn>(
    r: &R,
    rev_table: TableId,
    state_path: &str,
    revision: u64,
) -> Result<Option<u64>> {
    let list = revision_list(r, rev_table, state_path)?;
    if revision == 0 {
        return Ok(list.last().map(|&(_, ts)| ts));
    }
    Ok(list
        .binary_search_by_key(&revision, |&(rev, _)| rev)
        .ok()
        .map(|idx| list[idx].1))
}

fn append_revision(
    txn: &Txn<'_>,
    rev_table: TableId,
    state_path: &str,
    timestamp: u64,
) -> Result<u64> {
    let mut entries = txn.get_list(rev_table, state_path)?;
    let next = match entries.last() {
        Some(last) => parse_revision_entry(last)?.0 + 1,
        None => 1,
    };
    entries.push(format!("{next}:{timestamp}"));
    txn.put_list(rev_table, state_path, &entries)?;
    Ok(next)
}

fn pack_snapshots(snapshots: &Snapshots) -> Vec<String> {
    let mut flat = Vec::with_capacity(snapshots.len() * 2);
    for (subpath, ts) in snapshots {
        flat.push(subpath.clone());
        flat.push(ts.to_string());
    }
    flat
}

fn unpack_snapshots(flat: &[String]) -> Result<Snapshots> {
    if flat.len() % 2 != 0 {
        return Err(Error::Corrupt("odd-length snapshot list".into()));
    }
    let mut snapshots = Snapshots::new();
    for pair in flat.chunks(2) {
        let ts = pair[1]
            .parse()
            .map_err(|_| Error::Corrupt(format!("bad snapshot timestamp `{}`", pair[1])))?;
        snapshots.insert(pair[0].clone(), ts);
    }
    Ok(snapshots)
}

/// Commit a closure of state paths as one revision at a fresh shared
/// timestamp. Every member gets the next revision number of its own
/// list; the comment is attached to the root's new revision. Returns the
/// root's `(revision, timestamp)`.
pub fn set_state_revisions(
    txn: &Txn<'_>,
    rev_table: TableId,
    comments_table: TableId,
    snapshots_table: TableId,
    closure: &RevisionClosure,
    root_state_path: &str,
    comment: &str,
) -> Result<(u64, u64)> {
    let timestamp = txn.alloc_timestamp()?;

    let mut root_revision = None;
    for (member, snapshots) in closure {
        let revision = append_revision(txn, rev_table, member, timestamp)?;
        txn.put_list(
            snapshots_table,
            &merge_db_key(member, timestamp),
            &pack_snapshots(snapshots),
        )?;
        if member == root_state_path {
            root_revision = Some(revision);
        }
    }

    // A root outside its own closure still gets a revision entry.
    let root_revision = match root_revision {
        Some(rev) => rev,
        None => {
            let rev = append_revision(txn, rev_table, root_state_path, timestamp)?;
            txn.put_list(
                snapshots_table,
                &merge_db_key(root_state_path, timestamp),
                &Vec::<String>::new(),
            )?;
            rev
        }
    };

    if !comment.is_empty() {
        txn.put_string(
            comments_table,
            &merge_db_key(root_state_path, root_revision),
            comment,
        )?;
    }

    debug!(
        root = root_state_path,
        revision = root_revision,
        timestamp,
        members = closure.len(),
        "committed state revision"
    );
    Ok((root_revision, timestamp))
}

/// Resolve a revision of `state_path` into its closure: every state path
/// committed at the same timestamp, with its snapshot map.
pub fn query_state_revisions<R: ReadTxn>(
    r: &R,
    rev_table: TableId,
    snapshots_table: TableId,
    state_path: &str,
    revision: u64,
) -> Result<Option<StateRevision>> {
    let Some(timestamp) = revision_to_timestamp(r, rev_table, state_path, revision)? else {
        return Ok(None);
    };
    let resolved = if revision == 0 {
        revision_list(r, rev_table, state_path)?
            .last()
            .map(|&(rev, _)| rev)
            .unwrap_or(0)
    } else {
        revision
    };

    let mut members = RevisionClosure::new();
    for member in r.enumerate_keys(rev_table)? {
        if revision_list(r, rev_table, &member)?
            .iter()
            .any(|&(_, ts)| ts == timestamp)
        {
            let flat = r.get_list(snapshots_table, &merge_db_key(&member, timestamp))?;
            members.insert(member, unpack_snapshots(&flat)?);
        }
    }

    Ok(Some(StateRevision {
        revision: resolved,
        timestamp,
        members,
    }))
}

/// All revisions of a state path with their comments, oldest first.
pub fn query_available_state_revisions<R: ReadTxn>(
    r: &R,
    rev_table: TableId,
    comments_table: TableId,
    state_path: &str,
) -> Result<Vec<RevisionInfo>> {
    let mut out = Vec::new();
    for (revision, timestamp) in revision_list(r, rev_table, state_path)? {
        let comment = r
            .get_string(comments_table, &merge_db_key(state_path, revision))?
            .unwrap_or_default();
        out.push(RevisionInfo {
            revision,
            timestamp,
            comment,
        });
    }
    Ok(out)
}

/// Write the timestamped reference list of a state path.
///
/// `timestamp != 0` targets that exact timestamp. Otherwise revision `0`
/// allocates a fresh commit timestamp and any other revision resolves
/// through the revision list.
pub fn set_state_reference_list(
    txn: &Txn<'_>,
    table: TableId,
    rev_table: TableId,
    state_path: &str,
    references: &[String],
    revision: u64,
    timestamp: u64,
) -> Result<()> {
    let ts = if timestamp != 0 {
        timestamp
    } else if revision == 0 {
        txn.alloc_timestamp()?
    } else {
        revision_to_timestamp(txn, rev_table, state_path, revision)?.ok_or_else(|| {
            Error::Corrupt(format!(
                "no timestamp for revision {revision} of `{state_path}`"
            ))
        })?
    };
    txn.put_list(table, &merge_db_key(state_path, ts), references)
}

/// The greatest stored timestamp for `state_path` that is ≤ `target`.
fn latest_timestamp_at_or_before<R: ReadTxn>(
    r: &R,
    table: TableId,
    state_path: &str,
    target: u64,
) -> Result<Option<u64>> {
    let prefix = merge_db_key(state_path, 0);
    let prefix = &prefix[..prefix.len() - 1];
    let mut best = None;
    for key in r.keys_with_prefix(table, prefix)? {
        let (path, ts) = split_db_key(&key)?;
        if path == state_path && ts <= target && best.map_or(true, |b| ts > b) {
            best = Some(ts);
        }
    }
    Ok(best)
}

/// Read the reference list of a state path as of a revision or an exact
/// timestamp.
///
/// References written at an earlier commit and unchanged since remain
/// visible: the read resolves to the greatest stored timestamp not after
/// the requested point (no upper bound when both `revision` and
/// `timestamp` are zero).
pub fn query_state_reference_list<R: ReadTxn>(
    r: &R,
    table: TableId,
    rev_table: TableId,
    state_path: &str,
    revision: u64,
    timestamp: u64,
) -> Result<Option<Vec<String>>> {
    let target = if timestamp != 0 {
        timestamp
    } else if revision == 0 {
        u64::MAX
    } else {
        match revision_to_timestamp(r, rev_table, state_path, revision)? {
            Some(ts) => ts,
            None => return Ok(None),
        }
    };

    match latest_timestamp_at_or_before(r, table, state_path, target)? {
        Some(ts) => Ok(Some(r.get_list(table, &merge_db_key(state_path, ts))?)),
        None => Ok(Some(Vec::new())),
    }
}
