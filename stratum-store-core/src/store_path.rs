//! Deterministic store and state path naming.
//!
//! A component path is `<storeDir>/<h>-<name>` where `h` is the base32
//! encoding of a 20-byte fold of a SHA-256 digest over everything that
//! determines the path's identity: its type, content hash, the store
//! location itself and the human-readable name. State paths additionally
//! bind the state identifier and the calling user.

use std::collections::BTreeSet;

use nix::unistd::{geteuid, User};
use thiserror::Error;

use crate::base32;
use crate::hash::{Hash, HashAlgo};

/// Length in bytes of the folded path digest.
pub const PATH_DIGEST_SIZE: usize = 20;

/// Encoded length of the digest part of a path (32 characters).
pub const PATH_HASH_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum PathNameError {
    #[error("illegal name: `{0}`")]
    InvalidName(String),

    #[error("path `{0}` is not in the store")]
    NotInStore(String),

    #[error("path `{0}` is not in the state store")]
    NotInStateStore(String),
}

/// Characters permitted in a store name besides alphanumerics.
const VALID_NAME_CHARS: &str = "+-._?=";

/// Validate a store name: no leading dot, alphanumerics and `+-._?=` only.
pub fn check_store_name(name: &str) -> Result<(), PathNameError> {
    if name.is_empty() || name.starts_with('.') {
        return Err(PathNameError::InvalidName(name.to_string()));
    }
    for c in name.chars() {
        if !(c.is_ascii_alphanumeric() || VALID_NAME_CHARS.contains(c)) {
            return Err(PathNameError::InvalidName(name.to_string()));
        }
    }
    Ok(())
}

/// The user name of the effective uid. Resolved from the OS so a caller
/// cannot spoof another user's state paths through input.
pub fn calling_username() -> String {
    let uid = geteuid();
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => format!("uid-{}", uid.as_raw()),
    }
}

/// The two roots every path in the system lives under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDirs {
    pub store_dir: String,
    pub state_dir: String,
}

impl StoreDirs {
    pub fn new(store_dir: impl Into<String>, state_dir: impl Into<String>) -> Self {
        StoreDirs {
            store_dir: store_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    fn is_in_dir(dir: &str, path: &str) -> bool {
        path.starts_with('/')
            && path.starts_with(dir)
            && path.len() >= dir.len() + 2
            && path.as_bytes()[dir.len()] == b'/'
    }

    /// Is `path` below the component store root?
    pub fn is_in_store(&self, path: &str) -> bool {
        Self::is_in_dir(&self.store_dir, path)
    }

    /// Is `path` below the state store root?
    pub fn is_in_state_store(&self, path: &str) -> bool {
        Self::is_in_dir(&self.state_dir, path)
    }

    /// Is `path` a direct child of the component store root?
    pub fn is_store_path(&self, path: &str) -> bool {
        self.is_in_store(path) && !path[self.store_dir.len() + 1..].contains('/')
    }

    /// Is `path` a direct child of the state store root?
    pub fn is_state_path(&self, path: &str) -> bool {
        self.is_in_state_store(path) && !path[self.state_dir.len() + 1..].contains('/')
    }

    pub fn assert_store_path(&self, path: &str) -> Result<(), PathNameError> {
        if self.is_store_path(path) {
            Ok(())
        } else {
            Err(PathNameError::NotInStore(path.to_string()))
        }
    }

    pub fn assert_state_path(&self, path: &str) -> Result<(), PathNameError> {
        if self.is_state_path(path) {
            Ok(())
        } else {
            Err(PathNameError::NotInStateStore(path.to_string()))
        }
    }

    /// Strip a path inside the store down to the store path containing it.
    pub fn to_store_path(&self, path: &str) -> Result<String, PathNameError> {
        if !self.is_in_store(path) {
            return Err(PathNameError::NotInStore(path.to_string()));
        }
        match path[self.store_dir.len() + 1..].find('/') {
            Some(slash) => Ok(path[..self.store_dir.len() + 1 + slash].to_string()),
            None => Ok(path.to_string()),
        }
    }

    /// The base32 digest part of a store or state path, used for
    /// reference scanning.
    pub fn hash_part<'a>(&self, path: &'a str) -> Option<&'a str> {
        let base = if self.is_store_path(path) {
            &path[self.store_dir.len() + 1..]
        } else if self.is_state_path(path) {
            &path[self.state_dir.len() + 1..]
        } else {
            return None;
        };
        if base.len() > PATH_HASH_LEN
            && base.as_bytes()[PATH_HASH_LEN] == b'-'
            && base.bytes().take(PATH_HASH_LEN).all(base32::is_base32_char)
        {
            Some(&base[..PATH_HASH_LEN])
        } else {
            None
        }
    }

    fn path_digest(preimage: &str) -> String {
        let h = HashAlgo::Sha256.digest(preimage);
        base32::to_base32(&h.truncate(PATH_DIGEST_SIZE))
    }

    /// `makeStorePath`: `<storeDir>/<h>-<name>` with
    /// `h = base32(fold20(sha256("<type>:sha256:<hex>:<storeDir>:<name>")))`.
    pub fn make_store_path(
        &self,
        path_type: &str,
        content_hash: &Hash,
        name: &str,
    ) -> Result<String, PathNameError> {
        check_store_name(name)?;
        let preimage = format!(
            "{}:sha256:{}:{}:{}",
            path_type,
            content_hash.to_hex(),
            self.store_dir,
            name
        );
        Ok(format!(
            "{}/{}-{}",
            self.store_dir,
            Self::path_digest(&preimage),
            name
        ))
    }

    /// `makeStatePath`: `<stateDir>/<h>-<name>-<identifier>`, bound to the
    /// calling user resolved from the OS.
    pub fn make_state_path(
        &self,
        component_hash: &str,
        name: &str,
        state_identifier: &str,
    ) -> Result<String, PathNameError> {
        self.make_state_path_for_user(component_hash, name, state_identifier, &calling_username())
    }

    pub(crate) fn make_state_path_for_user(
        &self,
        component_hash: &str,
        name: &str,
        state_identifier: &str,
        user: &str,
    ) -> Result<String, PathNameError> {
        check_store_name(name)?;
        check_store_name(state_identifier)?;
        let preimage = format!(
            ":sha256:{}:{}:{}:{}:{}",
            component_hash, self.state_dir, name, state_identifier, user
        );
        Ok(format!(
            "{}/{}-{}-{}",
            self.state_dir,
            Self::path_digest(&preimage),
            name,
            state_identifier
        ))
    }

    /// Fixed-output path: the outer digest absorbs the inner algorithm,
    /// recursiveness and hash.
    pub fn make_fixed_output_path(
        &self,
        recursive: bool,
        hash_algo: HashAlgo,
        hash: &Hash,
        name: &str,
    ) -> Result<String, PathNameError> {
        let preimage = format!(
            "fixed:out:{}{}:{}:",
            if recursive { "r:" } else { "" },
            hash_algo,
            hash.to_hex()
        );
        let h2 = HashAlgo::Sha256.digest(&preimage);
        self.make_store_path("output:out", &h2, name)
    }

    /// Path for a text artifact. References are embedded in the type
    /// string so that two texts with equal contents but different
    /// reference sets get distinct paths.
    pub fn compute_store_path_for_text(
        &self,
        suffix: &str,
        contents: &str,
        references: &BTreeSet<String>,
    ) -> Result<String, PathNameError> {
        let hash = HashAlgo::Sha256.digest(contents);
        let mut path_type = String::from("text");
        for r in references {
            path_type.push(':');
            path_type.push_str(r);
        }
        self.make_store_path(&path_type, &hash, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs() -> StoreDirs {
        StoreDirs::new("/stratum/store", "/stratum/state")
    }

    #[test]
    fn name_legality() {
        assert!(check_store_name("a").is_ok());
        assert!(check_store_name("-x").is_ok());
        assert!(check_store_name("foo-1.2+b_c?d=e").is_ok());
        assert!(check_store_name(".").is_err());
        assert!(check_store_name(".x").is_err());
        assert!(check_store_name("").is_err());
        assert!(check_store_name("has space").is_err());
        assert!(check_store_name("sla/sh").is_err());
    }

    #[test]
    fn store_path_is_deterministic() {
        let h = HashAlgo::Sha256.digest("contents");
        let p1 = dirs().make_store_path("source", &h, "foo").unwrap();
        let p2 = dirs().make_store_path("source", &h, "foo").unwrap();
        assert_eq!(p1, p2);
        assert!(p1.starts_with("/stratum/store/"));
        assert!(p1.ends_with("-foo"));
    }

    #[test]
    fn type_string_separates_paths() {
        let h = HashAlgo::Sha256.digest("contents");
        let src = dirs().make_store_path("source", &h, "foo").unwrap();
        let out = dirs().make_store_path("output:out", &h, "foo").unwrap();
        assert_ne!(src, out);
    }

    #[test]
    fn text_references_change_the_path() {
        let no_refs = dirs()
            .compute_store_path_for_text("greet", "hi\n", &BTreeSet::new())
            .unwrap();
        let mut refs = BTreeSet::new();
        refs.insert("/stratum/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-dep".to_string());
        let with_refs = dirs()
            .compute_store_path_for_text("greet", "hi\n", &refs)
            .unwrap();
        assert_ne!(no_refs, with_refs);
    }

    #[test]
    fn state_path_binds_identifier_and_user() {
        let d = dirs();
        let a = d
            .make_state_path_for_user("abcd", "app", "primary", "alice")
            .unwrap();
        let b = d
            .make_state_path_for_user("abcd", "app", "secondary", "alice")
            .unwrap();
        let c = d
            .make_state_path_for_user("abcd", "app", "primary", "bob")
            .unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/stratum/state/"));
        assert!(a.ends_with("-app-primary"));
    }

    #[test]
    fn path_classification() {
        let d = dirs();
        assert!(d.is_store_path("/stratum/store/abc-foo"));
        assert!(!d.is_store_path("/stratum/store/abc-foo/bar"));
        assert!(d.is_in_store("/stratum/store/abc-foo/bar"));
        assert!(!d.is_store_path("/stratum/state/abc-foo"));
        assert_eq!(
            d.to_store_path("/stratum/store/abc-foo/bin/x").unwrap(),
            "/stratum/store/abc-foo"
        );
    }

    #[test]
    fn hash_part_extraction() {
        let d = dirs();
        let h = HashAlgo::Sha256.digest("x");
        let p = d.make_store_path("source", &h, "foo").unwrap();
        let part = d.hash_part(&p).unwrap();
        assert_eq!(part.len(), PATH_HASH_LEN);
        assert!(part.bytes().all(crate::base32::is_base32_char));
    }
}
