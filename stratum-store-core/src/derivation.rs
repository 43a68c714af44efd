//! The build-recipe model.
//!
//! Derivations are stored in the component store as JSON documents. A
//! derivation is *stateful* when it declares at least one state output;
//! stateful derivations carry the state identifier and the user they were
//! instantiated for, which together determine their state path.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Suffix marking a component path as a derivation.
pub const DRV_EXTENSION: &str = ".drv";

#[derive(Error, Debug)]
pub enum DerivationError {
    #[error("cannot read derivation `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse derivation `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("derivation `{0}` has no state output")]
    NotStateful(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationOutput {
    pub path: String,
}

/// A mutable output: where the component keeps its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateOutput {
    pub state_path: String,
    pub state_identifier: String,
    pub username: String,
    /// Hash of the producing component, bound into the state path digest.
    pub component_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    #[serde(default)]
    pub outputs: BTreeMap<String, DerivationOutput>,
    #[serde(default)]
    pub state_outputs: BTreeMap<String, StateOutput>,
    #[serde(default)]
    pub input_sources: BTreeSet<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Derivation {
    /// Parse a derivation from its on-disk path.
    pub fn read(path: &str) -> Result<Self, DerivationError> {
        let bytes = std::fs::read(Path::new(path)).map_err(|source| DerivationError::Io {
            path: path.to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| DerivationError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Serialize for writing into the store via `add_text_to_store`.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("derivation serialization cannot fail")
    }

    pub fn is_stateful(&self) -> bool {
        !self.state_outputs.is_empty()
    }

    /// The canonical `"state"` output of a stateful derivation.
    pub fn state_output(&self, drv_path: &str) -> Result<&StateOutput, DerivationError> {
        self.state_outputs
            .get("state")
            .ok_or_else(|| DerivationError::NotStateful(drv_path.to_string()))
    }

    pub fn output_paths(&self) -> impl Iterator<Item = &str> {
        self.outputs.values().map(|o| o.path.as_str())
    }
}

/// Is `path` a derivation path by naming convention?
pub fn is_derivation(path: &str) -> bool {
    path.ends_with(DRV_EXTENSION)
}
