//! Store configuration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use stratum_store_core::store_path::StoreDirs;

use crate::error::{Result, StoreError};

fn default_store_dir() -> String {
    "/stratum/store".to_string()
}

fn default_state_dir() -> String {
    "/stratum/state".to_string()
}

fn default_db_dir() -> String {
    "/stratum/var/db".to_string()
}

fn default_conf_dir() -> String {
    "/stratum/etc".to_string()
}

/// Space reserved so cleanup can still run on a full disk.
fn default_reserved_space() -> u64 {
    1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    #[serde(default = "default_db_dir")]
    pub db_dir: String,

    #[serde(default = "default_conf_dir")]
    pub conf_dir: String,

    #[serde(default = "default_reserved_space")]
    pub gc_reserved_space: u64,

    /// Skip the symlinked-store check. Also enabled by setting
    /// `STRATUM_IGNORE_SYMLINK_STORE=1` in the environment.
    #[serde(default)]
    pub ignore_symlink_store: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            store_dir: default_store_dir(),
            state_dir: default_state_dir(),
            db_dir: default_db_dir(),
            conf_dir: default_conf_dir(),
            gc_reserved_space: default_reserved_space(),
            ignore_symlink_store: false,
        }
    }
}

impl StoreConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("cannot read `{}`: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| StoreError::Config(format!("cannot parse `{}`: {e}", path.display())))
    }

    /// Configuration with every directory under one root. Used by tests
    /// and scratch deployments.
    pub fn under_root(root: &Path) -> Self {
        let sub = |name: &str| root.join(name).to_string_lossy().into_owned();
        StoreConfig {
            store_dir: sub("store"),
            state_dir: sub("state"),
            db_dir: sub("db"),
            conf_dir: sub("etc"),
            gc_reserved_space: default_reserved_space(),
            ignore_symlink_store: false,
        }
    }

    pub fn dirs(&self) -> StoreDirs {
        StoreDirs::new(self.store_dir.clone(), self.state_dir.clone())
    }

    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.db_dir).join("store.sqlite")
    }

    pub fn schema_path(&self) -> PathBuf {
        Path::new(&self.db_dir).join("schema")
    }

    pub fn reserved_path(&self) -> PathBuf {
        Path::new(&self.db_dir).join("reserved")
    }

    pub fn secret_key_path(&self) -> PathBuf {
        Path::new(&self.conf_dir).join("signing-key.sec")
    }

    pub fn public_key_path(&self) -> PathBuf {
        Path::new(&self.conf_dir).join("signing-key.pub")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        Path::new(&self.db_dir).join("snapshots")
    }

    pub fn temp_roots_path(&self) -> PathBuf {
        Path::new(&self.db_dir).join("temproots")
    }
}
