//! Signed export and import of store paths.
//!
//! An export stream is the archive of the tree followed by an envelope:
//! magic, the path, its component references, its deriver and a
//! signature flag. When signing, only the tree portion of the stream is
//! hashed and signed with the store's key.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use stratum_archive::wire::{read_string, read_string_set, read_u64, write_string,
    write_string_set, write_u64};
use stratum_archive::ArchiveError;
use stratum_store_core::hash::{HashAlgo, HashSink};
use stratum_store_core::signature::{PathSignature, PublicKey};
use stratum_store_core::signing::SigningKey;
use tracing::debug;

use crate::canonicalize::canonicalize_path_metadata;
use crate::error::{IoContext as _, Result, StoreError};
use crate::ingest::hash_path;
use crate::pathlocks::PathLock;
use crate::state::remove_any_path;
use crate::validity::{register_valid_paths, ValidPathInfo};
use crate::LocalStore;

/// Export stream magic, written after the tree bytes.
pub const EXPORT_MAGIC: u64 = 0x4558494e;

/// A secret key file must be unreadable to group and others.
fn check_secrecy(path: &Path) -> Result<()> {
    let metadata =
        fs::metadata(path).io_context(|| format!("getting status of `{}`", path.display()))?;
    if metadata.permissions().mode() & 0o077 != 0 {
        return Err(StoreError::Config(format!(
            "file `{}` should be secret (inaccessible to everybody else)",
            path.display()
        )));
    }
    Ok(())
}

/// A writer tee that hashes everything passed through while enabled.
struct HashingWriter<'a, W: Write> {
    inner: &'a mut W,
    hash: HashSink,
}

impl<W: Write> Write for HashingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hash.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct HashingReader<'a, R: Read> {
    inner: &'a mut R,
    hash: HashSink,
}

impl<R: Read> Read for HashingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hash.update(&buf[..n]);
        Ok(n)
    }
}

impl LocalStore {
    /// Serialise a valid path into `sink`, optionally signing the tree
    /// hash with the store's secret key.
    pub fn export_path(&self, path: &str, sign: bool, sink: &mut impl Write) -> Result<()> {
        self.dirs.assert_store_path(path)?;
        self.add_temp_root(path)?;
        if !self.is_valid(path)? {
            return Err(StoreError::InvalidPath(path.to_string()));
        }

        debug!(path, sign, "exporting path");

        let mut tee = HashingWriter {
            inner: sink,
            hash: HashSink::new(HashAlgo::Sha256),
        };
        stratum_archive::dump(Path::new(path), &mut tee)?;
        let tree_hash = tee.hash.finish();
        let sink = tee.inner;

        write_u64(sink, EXPORT_MAGIC)?;
        write_string(sink, path)?;

        let references = self.query_references(path, 0)?;
        write_string_set(sink, references.iter())?;

        let deriver = if self.is_state_component(path)? {
            // stateful components have per-(identifier, user) derivers;
            // the envelope carries none
            String::new()
        } else {
            self.query_deriver(path)?
        };
        write_string(sink, &deriver)?;

        if sign {
            let key_path = self.config.secret_key_path();
            check_secrecy(&key_path)?;
            let key = SigningKey::from_file(&key_path)?;
            let signature = key.sign(tree_hash.to_db_string().as_bytes());

            write_u64(sink, 1)?;
            write_string(sink, &signature.to_string())?;
        } else {
            write_u64(sink, 0)?;
        }

        Ok(())
    }

    /// Read an export stream, verify it, and register the contained path.
    ///
    /// The tree is restored into a scratch directory first; only after
    /// the envelope and signature check out is it renamed into place
    /// under the per-path lock. A declared deriver that is not itself
    /// valid is dropped.
    pub fn import_path(&mut self, require_signature: bool, source: &mut impl Read) -> Result<String> {
        self.check_writable()?;

        let scratch = tempfile::Builder::new()
            .prefix(".import-")
            .tempdir_in(&self.config.store_dir)
            .io_context(|| format!("creating scratch directory in `{}`", self.config.store_dir))?;
        let unpacked = scratch.path().join("unpacked");

        let mut tee = HashingReader {
            inner: source,
            hash: HashSink::new(HashAlgo::Sha256),
        };
        stratum_archive::restore(&mut tee, &unpacked)?;
        let tree_hash = tee.hash.finish();
        let source = tee.inner;

        let magic = read_u64(source)?;
        if magic != EXPORT_MAGIC {
            return Err(StoreError::Archive(ArchiveError::BadArchive(format!(
                "wrong export magic: {magic:#x}"
            ))));
        }

        let dst_path = read_string(source)?;
        self.dirs.assert_store_path(&dst_path)?;

        let references: std::collections::BTreeSet<String> =
            read_string_set(source)?.into_iter().collect();

        let mut deriver = read_string(source)?;
        if !deriver.is_empty() {
            self.dirs.assert_store_path(&deriver)?;
        }

        let have_signature = read_u64(source)? == 1;
        if require_signature && !have_signature {
            return Err(StoreError::MissingSignature);
        }
        if have_signature {
            let signature_text = read_string(source)?;
            if require_signature {
                let signature = PathSignature::parse(&signature_text)?;
                let key = PublicKey::from_file(&self.config.public_key_path())?;
                signature
                    .verify(tree_hash.to_db_string().as_bytes(), &key)
                    .map_err(|_| {
                        StoreError::BadSignature(format!(
                            "signature by `{}` does not match archive contents",
                            signature.key_name
                        ))
                    })?;
            }
        }

        debug!(path = %dst_path, "importing path");

        self.add_temp_root(&dst_path)?;

        if !self.is_valid(&dst_path)? {
            let _lock = PathLock::lock(Path::new(&dst_path))
                .io_context(|| format!("locking `{dst_path}`"))?;

            if !self.is_valid(&dst_path)? {
                if Path::new(&dst_path).exists() {
                    remove_any_path(Path::new(&dst_path))?;
                }

                fs::rename(&unpacked, &dst_path)
                    .io_context(|| format!("moving `{}` to `{dst_path}`", unpacked.display()))?;

                canonicalize_path_metadata(Path::new(&dst_path))?;

                if !deriver.is_empty() && !self.is_valid(&deriver)? {
                    deriver = String::new();
                }

                let info = ValidPathInfo {
                    path: dst_path.clone(),
                    hash: Some(hash_path(HashAlgo::Sha256, Path::new(&dst_path))?),
                    references,
                    // the envelope carries no state references
                    deriver,
                    ..Default::default()
                };
                let Self { db, tables, dirs, .. } = self;
                let txn = db.transaction()?;
                register_valid_paths(&txn, tables, dirs, &[info])?;
                txn.commit()?;
            }
        }

        Ok(dst_path)
    }
}
