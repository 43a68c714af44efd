use std::path::Path;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signer as _, SigningKey as DalekSigningKey};
use thiserror::Error;

use crate::signature::PathSignature;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("failed to read signing key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("failed to parse signing key: {0}")]
    ParseKey(String),

    #[error("invalid signing key length: expected 32 or 64 bytes, got {0}")]
    InvalidKeyLength(usize),
}

/// A named ed25519 signing key, stored on disk as `name:base64`. The key
/// part is either the 32-byte secret key or the full 64-byte keypair.
#[derive(Clone, Debug)]
pub struct SigningKey {
    pub name: String,
    key: Vec<u8>,
}

impl SigningKey {
    pub fn from_file(path: &Path) -> Result<Self, SigningError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(s: &str) -> Result<Self, SigningError> {
        let (name, key_base64) = s
            .split_once(':')
            .ok_or_else(|| SigningError::ParseKey("signing key does not contain a ':'".into()))?;
        if name.is_empty() {
            return Err(SigningError::ParseKey("empty key name".into()));
        }

        let key = general_purpose::STANDARD.decode(key_base64.trim())?;

        // Validate eagerly so signing itself cannot fail.
        match key.len() {
            32 => {
                let bytes: [u8; 32] = key.as_slice().try_into().unwrap();
                let _ = DalekSigningKey::from_bytes(&bytes);
            }
            64 => {
                let bytes: [u8; 64] = key.as_slice().try_into().unwrap();
                DalekSigningKey::from_keypair_bytes(&bytes)
                    .map_err(|e| SigningError::ParseKey(format!("invalid keypair: {e}")))?;
            }
            n => return Err(SigningError::InvalidKeyLength(n)),
        }

        Ok(SigningKey {
            name: name.to_string(),
            key,
        })
    }

    fn to_dalek(&self) -> DalekSigningKey {
        match self.key.len() {
            32 => {
                let bytes: [u8; 32] = self.key.as_slice().try_into().unwrap();
                DalekSigningKey::from_bytes(&bytes)
            }
            _ => {
                let bytes: [u8; 64] = self.key.as_slice().try_into().unwrap();
                DalekSigningKey::from_keypair_bytes(&bytes).expect("validated at parse time")
            }
        }
    }

    pub fn sign(&self, msg: &[u8]) -> PathSignature {
        let signature = self.to_dalek().sign(msg);
        PathSignature::new(self.name.clone(), signature.to_bytes())
    }

    /// The matching verifying key, in the on-disk `name:base64` form.
    pub fn public_key_string(&self) -> String {
        let verifying = self.to_dalek().verifying_key();
        format!(
            "{}:{}",
            self.name,
            general_purpose::STANDARD.encode(verifying.to_bytes())
        )
    }
}
