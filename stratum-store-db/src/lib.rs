//! Transactional metadata engine for the stratum store.
//!
//! This crate provides the table layer the local store is built on: named
//! string→string and string→list tables over SQLite, all-or-nothing
//! transactions, composite `(path, timestamp)` keys, and the revision
//! index that gives state paths their history.

mod error;
mod kv;
mod revisions;

pub use error::{Error, Result};
pub use kv::{merge_db_key, split_db_key, Db, ReadTxn, TableId, Txn};
pub use revisions::{
    query_available_state_revisions, query_state_reference_list, query_state_revisions,
    revision_list, revision_to_timestamp, set_state_reference_list, set_state_revisions,
    RevisionClosure, RevisionInfo, Snapshots, StateRevision,
};
