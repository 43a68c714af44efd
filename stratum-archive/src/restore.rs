//! Reconstructing a file tree from the archive stream.

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use crate::wire::{read_bytes, read_string};
use crate::{ArchiveError, Result, ARCHIVE_MAGIC};

/// Restore an archive from `source` to the (not yet existing) path `dst`.
pub fn restore<R: Read>(source: &mut R, dst: &Path) -> Result<()> {
    let magic = read_string(source)?;
    if magic != ARCHIVE_MAGIC {
        return Err(ArchiveError::BadArchive(format!(
            "unexpected archive magic `{magic}`"
        )));
    }
    restore_node(source, dst)
}

/// Restore from an in-memory archive.
pub fn restore_from_slice(bytes: &[u8], dst: &Path) -> Result<()> {
    let mut source = bytes;
    restore(&mut source, dst)?;
    if !source.is_empty() {
        return Err(ArchiveError::BadArchive(
            "trailing bytes after archive".into(),
        ));
    }
    Ok(())
}

fn expect(source: &mut impl Read, token: &str) -> Result<()> {
    let got = read_string(source)?;
    if got != token {
        return Err(ArchiveError::BadArchive(format!(
            "expected `{token}`, got `{got}`"
        )));
    }
    Ok(())
}

fn restore_node<R: Read>(source: &mut R, dst: &Path) -> Result<()> {
    expect(source, "(")?;
    expect(source, "type")?;

    match read_string(source)?.as_str() {
        "regular" => {
            let mut executable = false;
            let mut tag = read_string(source)?;
            if tag == "executable" {
                expect(source, "")?;
                executable = true;
                tag = read_string(source)?;
            }
            if tag != "contents" {
                return Err(ArchiveError::BadArchive(format!(
                    "expected `contents`, got `{tag}`"
                )));
            }
            let contents = read_bytes(source)?;
            fs::write(dst, contents)?;
            let mode = if executable { 0o755 } else { 0o644 };
            fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
            expect(source, ")")?;
        }
        "symlink" => {
            expect(source, "target")?;
            let target = read_string(source)?;
            std::os::unix::fs::symlink(&target, dst)?;
            expect(source, ")")?;
        }
        "directory" => {
            fs::create_dir(dst)?;
            let mut prev_name: Option<String> = None;
            loop {
                match read_string(source)?.as_str() {
                    ")" => break,
                    "entry" => {
                        expect(source, "(")?;
                        expect(source, "name")?;
                        let name = read_string(source)?;
                        if name.is_empty()
                            || name == "."
                            || name == ".."
                            || name.contains('/')
                            || name.contains('\0')
                        {
                            return Err(ArchiveError::BadArchive(format!(
                                "illegal entry name `{name}`"
                            )));
                        }
                        // canonical archives are sorted; enforce it so the
                        // dump of a restored tree is bit-identical
                        if let Some(prev) = &prev_name {
                            if *prev >= name {
                                return Err(ArchiveError::BadArchive(format!(
                                    "entry `{name}` out of order"
                                )));
                            }
                        }
                        prev_name = Some(name.clone());
                        expect(source, "node")?;
                        restore_node(source, &dst.join(&name))?;
                        expect(source, ")")?;
                    }
                    other => {
                        return Err(ArchiveError::BadArchive(format!(
                            "expected `entry` or `)`, got `{other}`"
                        )));
                    }
                }
            }
        }
        other => {
            return Err(ArchiveError::BadArchive(format!(
                "unknown node type `{other}`"
            )));
        }
    }
    Ok(())
}
