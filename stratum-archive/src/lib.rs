//! Deterministic file-tree serialisation for the stratum store.
//!
//! Copying a tree through `dump` + `restore` canonicalises it: entry order,
//! permissions (down to the executable bit) and timestamps are all
//! normalised, so the archive bytes (and therefore the content hash) are
//! a pure function of the tree's logical contents.

use thiserror::Error;

pub mod wire;

mod dump;
mod restore;

pub use dump::{dump, dump_contents, dump_to_vec};
pub use restore::{restore, restore_from_slice};

/// Leading tag of every archive stream.
pub const ARCHIVE_MAGIC: &str = "stratum-archive-1";

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad archive: {0}")]
    BadArchive(String),

    #[error("unsupported file type at `{0}`")]
    UnsupportedFileType(String),
}
