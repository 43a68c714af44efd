use thiserror::Error;

use stratum_store_core::derivation::DerivationError;
use stratum_store_core::hash::ParseHashError;
use stratum_store_core::signature::SignatureError;
use stratum_store_core::signing::SigningError;
use stratum_store_core::store_path::PathNameError;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Reference to a path that is neither valid nor substitutable.
    #[error("path `{0}` is not valid and has no substitutes")]
    InvalidPath(String),

    #[error(transparent)]
    InvalidName(#[from] PathNameError),

    #[error("contents of `{path}` changed: expected hash {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("imported archive lacks a signature")]
    MissingSignature,

    #[error("bad signature on imported archive: {0}")]
    BadSignature(String),

    #[error("cannot delete path `{path}`: it is in use by `{referrer}`")]
    InUse { path: String, referrer: String },

    #[error("state path `{path}` has no revision {revision}")]
    UnknownRevision { path: String, revision: u64 },

    #[error("sharing chain starting at `{0}` does not terminate")]
    SharingChainTooLong(String),

    #[error("incomplete closure: `{path}` needs missing `{missing}`")]
    IncompleteClosure { path: String, missing: String },

    #[error("database schema is version {found}, but only versions up to {supported} are supported")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("schema file is corrupt: {0}")]
    SchemaCorrupt(String),

    #[error("the store is open in read-only mode")]
    ReadOnly,

    #[error("interrupted")]
    Interrupted,

    #[error("{message}: {source}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Db(#[from] stratum_store_db::Error),

    #[error(transparent)]
    Archive(#[from] stratum_archive::ArchiveError),

    #[error(transparent)]
    Hash(#[from] ParseHashError),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            message: message.into(),
            source,
        }
    }
}

/// Helper trait for wrapping IO errors with the operation and path.
pub trait IoContext<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| StoreError::io(f(), e))
    }
}

impl<T> IoContext<T> for std::result::Result<T, nix::errno::Errno> {
    fn io_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| StoreError::io(f(), std::io::Error::from(e)))
    }
}
