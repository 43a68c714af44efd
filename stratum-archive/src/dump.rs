//! Serialising a file tree into the archive stream.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use crate::wire::write_string;
use crate::{ArchiveError, Result, ARCHIVE_MAGIC};

/// Dump the tree rooted at `path` into `sink`.
///
/// The serialisation is canonical: directory entries are emitted in
/// lexicographic order and only the executable bit of the permission set
/// survives, so two trees with equal contents produce identical bytes.
pub fn dump<W: Write>(path: &Path, sink: &mut W) -> Result<()> {
    write_string(sink, ARCHIVE_MAGIC)?;
    dump_node(path, sink)
}

/// Dump into a fresh buffer.
pub fn dump_to_vec(path: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    dump(path, &mut buf)?;
    Ok(buf)
}

fn dump_node<W: Write>(path: &Path, sink: &mut W) -> Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    write_string(sink, "(")?;

    if metadata.file_type().is_symlink() {
        let target = fs::read_link(path)?;
        write_string(sink, "type")?;
        write_string(sink, "symlink")?;
        write_string(sink, "target")?;
        write_string(
            sink,
            target
                .to_str()
                .ok_or_else(|| ArchiveError::BadArchive("non-UTF-8 symlink target".into()))?,
        )?;
    } else if metadata.is_file() {
        write_string(sink, "type")?;
        write_string(sink, "regular")?;
        if metadata.permissions().mode() & 0o100 != 0 {
            write_string(sink, "executable")?;
            write_string(sink, "")?;
        }
        write_string(sink, "contents")?;
        let contents = fs::read(path)?;
        crate::wire::write_bytes(sink, &contents)?;
    } else if metadata.is_dir() {
        write_string(sink, "type")?;
        write_string(sink, "directory")?;

        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let name = entry
                .file_name()
                .into_string()
                .map_err(|_| ArchiveError::BadArchive("non-UTF-8 file name".into()))?;
            names.push(name);
        }
        names.sort();

        for name in names {
            write_string(sink, "entry")?;
            write_string(sink, "(")?;
            write_string(sink, "name")?;
            write_string(sink, &name)?;
            write_string(sink, "node")?;
            dump_node(&path.join(&name), sink)?;
            write_string(sink, ")")?;
        }
    } else {
        return Err(ArchiveError::UnsupportedFileType(path.display().to_string()));
    }

    write_string(sink, ")")?;
    Ok(())
}

/// Dump a string as if it were the contents of a regular file. Used for
/// hashing text artifacts consistently with trees.
pub fn dump_contents<W: Write>(contents: &[u8], sink: &mut W) -> Result<()> {
    write_string(sink, ARCHIVE_MAGIC)?;
    write_string(sink, "(")?;
    write_string(sink, "type")?;
    write_string(sink, "regular")?;
    write_string(sink, "contents")?;
    crate::wire::write_bytes(sink, contents)?;
    write_string(sink, ")")?;
    Ok(())
}
