use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Verifier as _, VerifyingKey};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("signature does not contain a ':'")]
    MissingColon,

    #[error("empty key name in signature")]
    EmptyKeyName,

    #[error("failed to decode base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("invalid signature length: expected 64 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("signature verification failed")]
    VerificationFailed,
}

/// A named ed25519 signature, rendered as `name:base64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSignature {
    pub key_name: String,
    pub bytes: [u8; 64],
}

impl PathSignature {
    pub fn new(key_name: String, bytes: [u8; 64]) -> Self {
        PathSignature { key_name, bytes }
    }

    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        let (name, sig_base64) = s.split_once(':').ok_or(SignatureError::MissingColon)?;
        if name.is_empty() {
            return Err(SignatureError::EmptyKeyName);
        }
        let decoded = general_purpose::STANDARD.decode(sig_base64.trim())?;
        let bytes: [u8; 64] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidLength(decoded.len()))?;
        Ok(PathSignature {
            key_name: name.to_string(),
            bytes,
        })
    }

    /// Check this signature over `msg` against a verifying key.
    pub fn verify(&self, msg: &[u8], key: &PublicKey) -> Result<(), SignatureError> {
        let sig = ed25519_dalek::Signature::from_bytes(&self.bytes);
        key.key
            .verify(msg, &sig)
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

impl fmt::Display for PathSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.key_name,
            general_purpose::STANDARD.encode(self.bytes)
        )
    }
}

/// A named ed25519 verifying key, stored on disk as `name:base64`.
#[derive(Debug, Clone)]
pub struct PublicKey {
    pub name: String,
    key: VerifyingKey,
}

impl PublicKey {
    pub fn parse(s: &str) -> Result<Self, SignatureError> {
        let (name, key_base64) = s.split_once(':').ok_or(SignatureError::MissingColon)?;
        if name.is_empty() {
            return Err(SignatureError::EmptyKeyName);
        }
        let decoded = general_purpose::STANDARD.decode(key_base64.trim())?;
        let bytes: [u8; 32] = decoded
            .as_slice()
            .try_into()
            .map_err(|_| SignatureError::InvalidPublicKey(format!("{} bytes", decoded.len())))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
        Ok(PublicKey {
            name: name.to_string(),
            key,
        })
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, SignatureError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SignatureError::InvalidPublicKey(e.to_string()))?;
        Self::parse(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_malformed() {
        assert!(matches!(
            PathSignature::parse("no-colon"),
            Err(SignatureError::MissingColon)
        ));
        assert!(matches!(
            PathSignature::parse(":no-name"),
            Err(SignatureError::EmptyKeyName)
        ));
        assert!(PathSignature::parse("k:!!!").is_err());
    }

    #[test]
    fn display_roundtrip() {
        let sig = PathSignature::new("store-1".to_string(), [7u8; 64]);
        let text = sig.to_string();
        assert!(text.starts_with("store-1:"));
        assert_eq!(PathSignature::parse(&text).unwrap(), sig);
    }
}
