//! Framing primitives shared by the archive format, the export envelope
//! and the database's packed string lists.
//!
//! Integers are 64-bit little-endian. Byte strings are length-prefixed and
//! zero-padded to an 8-byte boundary.

use std::io::{Read, Write};

use crate::{ArchiveError, Result};

/// Upper bound on any single length field, to keep corrupt input from
/// driving allocations.
const MAX_LEN: u64 = 1 << 40;

pub fn write_u64<W: Write>(sink: &mut W, value: u64) -> Result<()> {
    sink.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u64<R: Read>(source: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    source.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn pad_len(len: usize) -> usize {
    (8 - len % 8) % 8
}

pub fn write_bytes<W: Write>(sink: &mut W, bytes: &[u8]) -> Result<()> {
    write_u64(sink, bytes.len() as u64)?;
    sink.write_all(bytes)?;
    let pad = [0u8; 8];
    sink.write_all(&pad[..pad_len(bytes.len())])?;
    Ok(())
}

pub fn read_bytes<R: Read>(source: &mut R) -> Result<Vec<u8>> {
    let len = read_u64(source)?;
    if len > MAX_LEN {
        return Err(ArchiveError::BadArchive(format!(
            "implausible length field: {len}"
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    source.read_exact(&mut bytes)?;
    let mut pad = [0u8; 8];
    source.read_exact(&mut pad[..pad_len(len as usize)])?;
    if pad.iter().any(|&b| b != 0) {
        return Err(ArchiveError::BadArchive("non-zero padding".into()));
    }
    Ok(bytes)
}

pub fn write_string<W: Write>(sink: &mut W, s: &str) -> Result<()> {
    write_bytes(sink, s.as_bytes())
}

pub fn read_string<R: Read>(source: &mut R) -> Result<String> {
    let bytes = read_bytes(source)?;
    String::from_utf8(bytes).map_err(|e| ArchiveError::BadArchive(e.to_string()))
}

pub fn write_string_set<W, I, S>(sink: &mut W, strings: I) -> Result<()>
where
    W: Write,
    I: ExactSizeIterator<Item = S>,
    S: AsRef<str>,
{
    write_u64(sink, strings.len() as u64)?;
    for s in strings {
        write_string(sink, s.as_ref())?;
    }
    Ok(())
}

pub fn read_string_set<R: Read>(source: &mut R) -> Result<Vec<String>> {
    let count = read_u64(source)?;
    if count > MAX_LEN {
        return Err(ArchiveError::BadArchive(format!(
            "implausible set size: {count}"
        )));
    }
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        out.push(read_string(source)?);
    }
    Ok(out)
}

/// Pack a string list into a single value, for storage under one key.
pub fn pack_strings<I, S>(strings: I) -> Vec<u8>
where
    I: ExactSizeIterator<Item = S>,
    S: AsRef<str>,
{
    let mut buf = Vec::new();
    write_string_set(&mut buf, strings).expect("writing to a Vec cannot fail");
    buf
}

/// Inverse of [`pack_strings`].
pub fn unpack_strings(bytes: &[u8]) -> Result<Vec<String>> {
    let mut source = bytes;
    let strings = read_string_set(&mut source)?;
    if !source.is_empty() {
        return Err(ArchiveError::BadArchive(
            "trailing bytes after packed string list".into(),
        ));
    }
    Ok(strings)
}
