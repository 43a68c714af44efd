//! Path metadata canonicalisation.
//!
//! Everything entering the store is normalised so that on-disk metadata
//! carries no information beyond the archive serialisation: files become
//! mode 0444 (0555 when user-executable), mtimes are zeroed, and ownership
//! moves to the effective uid. Symlinks only get their ownership fixed;
//! their permissions and timestamps are not independent on Linux.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::fs::{MetadataExt as _, PermissionsExt as _};
use std::path::Path;

use nix::unistd::geteuid;

use crate::error::{IoContext as _, Result, StoreError};

/// Set atime and mtime without following symlinks.
#[allow(unsafe_code)]
fn set_timestamp(path: &Path, seconds: i64) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let times = [
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
        libc::timespec {
            tv_sec: seconds,
            tv_nsec: 0,
        },
    ];
    // SAFETY: c_path is a valid null-terminated string and times is a
    // 2-element array on the stack. AT_SYMLINK_NOFOLLOW keeps symlinks
    // themselves untouched.
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Change ownership without following symlinks.
#[allow(unsafe_code)]
fn lchown_to_euid(path: &Path) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid null-terminated string; gid -1 leaves the
    // group unchanged.
    let ret = unsafe { libc::lchown(c_path.as_ptr(), geteuid().as_raw(), u32::MAX) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn canonicalize_entry(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)
        .io_context(|| format!("getting attributes of `{}`", path.display()))?;

    if metadata.uid() != geteuid().as_raw() {
        lchown_to_euid(path).io_context(|| format!("changing owner of `{}`", path.display()))?;
    }

    if !metadata.is_symlink() {
        let mode = metadata.permissions().mode() & 0o7777;
        if mode != 0o444 && mode != 0o555 {
            let new_mode = 0o444 | if mode & 0o100 != 0 { 0o111 } else { 0 };
            fs::set_permissions(path, fs::Permissions::from_mode(new_mode))
                .io_context(|| format!("changing mode of `{}`", path.display()))?;
        }

        if metadata.mtime() != 0 {
            set_timestamp(path, 0)
                .io_context(|| format!("changing modification time of `{}`", path.display()))?;
        }
    }

    if metadata.is_dir() {
        let mut names: Vec<_> = fs::read_dir(path)
            .io_context(|| format!("reading directory `{}`", path.display()))?
            .collect::<io::Result<Vec<_>>>()
            .io_context(|| format!("reading directory `{}`", path.display()))?
            .into_iter()
            .map(|e| e.file_name())
            .collect();
        names.sort();
        for name in names {
            canonicalize_entry(&path.join(name))?;
        }
    }

    Ok(())
}

/// Canonicalise all metadata under `path` recursively.
///
/// Fails if the top-level path still belongs to a foreign user afterwards
/// (possible when the top level is a symlink we could not chown).
pub fn canonicalize_path_metadata(path: &Path) -> Result<()> {
    canonicalize_entry(path)?;

    let metadata = fs::symlink_metadata(path)
        .io_context(|| format!("getting attributes of `{}`", path.display()))?;
    if metadata.uid() != geteuid().as_raw() {
        return Err(StoreError::io(
            format!("wrong ownership of top-level path `{}`", path.display()),
            io::Error::from(io::ErrorKind::PermissionDenied),
        ));
    }
    Ok(())
}
