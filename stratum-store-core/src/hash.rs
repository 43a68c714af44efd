use std::fmt;

use base64::{engine::general_purpose, Engine as _};
use ring::digest;
use thiserror::Error;

use crate::base32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgo {
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        }
    }

    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn base16_len(&self) -> usize {
        self.digest_size() * 2
    }

    pub fn base32_len(&self) -> usize {
        base32::encode_len(self.digest_size())
    }

    pub fn base64_len(&self) -> usize {
        (self.digest_size() + 2) / 3 * 4
    }

    fn ring_algorithm(&self) -> &'static digest::Algorithm {
        match self {
            HashAlgo::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            HashAlgo::Sha256 => &digest::SHA256,
            HashAlgo::Sha512 => &digest::SHA512,
        }
    }

    /// Digest `data` in one shot.
    pub fn digest<B: AsRef<[u8]>>(&self, data: B) -> Hash {
        let d = digest::digest(self.ring_algorithm(), data.as_ref());
        Hash {
            algo: *self,
            digest: d.as_ref().to_vec(),
        }
    }
}

impl std::str::FromStr for HashAlgo {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha1" => Ok(HashAlgo::Sha1),
            "sha256" => Ok(HashAlgo::Sha256),
            "sha512" => Ok(HashAlgo::Sha512),
            _ => Err(ParseHashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A streaming digest context, for hashing archive streams without
/// buffering them.
pub struct HashSink {
    algo: HashAlgo,
    ctx: digest::Context,
}

impl HashSink {
    pub fn new(algo: HashAlgo) -> Self {
        HashSink {
            algo,
            ctx: digest::Context::new(algo.ring_algorithm()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.update(data);
    }

    pub fn finish(self) -> Hash {
        Hash {
            algo: self.algo,
            digest: self.ctx.finish().as_ref().to_vec(),
        }
    }
}

impl std::io::Write for HashSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hash {
    pub algo: HashAlgo,
    pub digest: Vec<u8>,
}

impl Hash {
    pub fn new(algo: HashAlgo, digest: Vec<u8>) -> Result<Self, ParseHashError> {
        if digest.len() != algo.digest_size() {
            return Err(ParseHashError::InvalidDigestSize {
                expected: algo.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(Hash { algo, digest })
    }

    /// Parse a hash in the format `algo:digest`, where the digest may be
    /// hex, base32 or base64 (distinguished by length).
    pub fn parse(s: &str) -> Result<Self, ParseHashError> {
        let (algo_str, digest_str) = s
            .split_once(':')
            .ok_or_else(|| ParseHashError::InvalidFormat(s.to_string()))?;

        let algo: HashAlgo = algo_str.parse()?;

        let digest = if digest_str.len() == algo.base16_len() {
            hex::decode(digest_str).map_err(|e| ParseHashError::HexDecodeError(e.to_string()))?
        } else if digest_str.len() == algo.base32_len() {
            base32::from_base32(digest_str.as_bytes()).map_err(ParseHashError::Base32DecodeError)?
        } else if digest_str.len() == algo.base64_len() {
            general_purpose::STANDARD
                .decode(digest_str)
                .map_err(|e| ParseHashError::Base64DecodeError(e.to_string()))?
        } else {
            return Err(ParseHashError::InvalidDigestLength {
                algo: algo.name().to_string(),
                actual: digest_str.len(),
            });
        };

        Hash::new(algo, digest)
    }

    /// Hex encoding of the digest.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }

    /// Base32 encoding of the digest.
    pub fn to_base32(&self) -> String {
        base32::to_base32(&self.digest)
    }

    /// The `algo:hex` form stored in the validity table.
    pub fn to_db_string(&self) -> String {
        format!("{}:{}", self.algo, self.to_hex())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.digest
    }

    /// Truncate the digest to `len` bytes by cyclic xor-folding, the
    /// compression used for store path digests.
    pub fn truncate(&self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        for (i, &b) in self.digest.iter().enumerate() {
            out[i % len] ^= b;
        }
        out
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.to_hex())
    }
}

#[derive(Error, Debug)]
pub enum ParseHashError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid hash format: {0}")]
    InvalidFormat(String),

    #[error("invalid digest size: expected {expected}, got {actual}")]
    InvalidDigestSize { expected: usize, actual: usize },

    #[error("invalid digest length for {algo}: got {actual}")]
    InvalidDigestLength { algo: String, actual: usize },

    #[error("hex decode error: {0}")]
    HexDecodeError(String),

    #[error("base32 decode error: {0}")]
    Base32DecodeError(String),

    #[error("base64 decode error: {0}")]
    Base64DecodeError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_and_roundtrip() {
        let h = HashAlgo::Sha256.digest("hello world");
        assert_eq!(
            h.to_hex(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        let parsed = Hash::parse(&h.to_db_string()).unwrap();
        assert_eq!(parsed, h);

        let from_base32 = Hash::parse(&format!("sha256:{}", h.to_base32())).unwrap();
        assert_eq!(from_base32, h);
    }

    #[test]
    fn known_base32_encoding() {
        let digest =
            hex::decode("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
                .unwrap();
        let h = Hash::new(HashAlgo::Sha256, digest).unwrap();
        assert_eq!(
            h.to_base32(),
            "1sfdxziarxw8j3p80lvswgpq9i7smdyxmmsj5sjhhgjdjfwjfkdr"
        );
    }

    #[test]
    fn parse_rejects_missing_colon() {
        assert!(matches!(
            Hash::parse("sha256-deadbeef"),
            Err(ParseHashError::InvalidFormat(_))
        ));
    }

    #[test]
    fn truncation_folds_all_bytes() {
        let h = HashAlgo::Sha256.digest("x");
        let t = h.truncate(20);
        assert_eq!(t.len(), 20);
        // xor-fold of the tail differs from a plain prefix
        assert_ne!(t, h.digest[..20].to_vec());
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut sink = HashSink::new(HashAlgo::Sha256);
        sink.update(b"hello ");
        sink.update(b"world");
        assert_eq!(sink.finish(), HashAlgo::Sha256.digest("hello world"));
    }
}
