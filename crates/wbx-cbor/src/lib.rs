//! Content digests used as cache keys plus canonical CBOR helpers for tool envelopes.

use serde::{Deserialize, Serialize};
use serde_cbor::{ser::Write as CborWrite, value::Value as CborValue};
use sha2::{Digest as _, Sha256};
use std::fmt;

/// Shortest accepted digest, in raw bytes (MD5).
pub const MIN_DIGEST_BYTES: usize = 16;
/// Longest accepted digest, in raw bytes (SHA-512).
pub const MAX_DIGEST_BYTES: usize = 64;

/// Serialize a value into canonical CBOR bytes using RFC 8949 deterministic rules.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    let mut buf = Vec::with_capacity(256);
    write_canonical_cbor(value, &mut buf)?;
    Ok(buf)
}

/// Serialize a value directly into an arbitrary CBOR writer using canonical settings.
pub fn write_canonical_cbor<T: Serialize, W>(value: &T, writer: W) -> Result<(), serde_cbor::Error>
where
    W: CborWrite,
{
    let canonical_value: CborValue = serde_cbor::value::to_value(value)?;
    let mut serializer = serde_cbor::ser::Serializer::new(writer);
    canonical_value.serialize(&mut serializer)
}

/// Fixed-size fingerprint of a byte buffer, kept as normalized lowercase hex.
///
/// The algorithm is not recorded: asset indexes ship whatever hash their
/// producer used, and the cache only needs a stable key. An optional
/// `algo:` prefix is accepted on parse and dropped.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Compute the SHA-256 digest of the provided bytes.
    pub fn sha256_of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(hex::encode(hasher.finalize()))
    }

    /// Parse a hex digest, optionally prefixed with `algo:`.
    pub fn parse(s: &str) -> Result<Self, DigestParseError> {
        let hex_part = match s.split_once(':') {
            Some((algo, rest)) if !algo.is_empty() && algo.chars().all(|c| c.is_ascii_alphanumeric()) => rest,
            Some(_) => return Err(DigestParseError::InvalidPrefix(s.to_string())),
            None => s,
        };
        let len = hex_part.len();
        if len % 2 != 0 || len < MIN_DIGEST_BYTES * 2 || len > MAX_DIGEST_BYTES * 2 {
            return Err(DigestParseError::InvalidLength(len));
        }
        let normalized = hex_part.to_ascii_lowercase();
        hex::decode(&normalized)?;
        Ok(Digest(normalized))
    }

    /// Borrow the normalized hex form, which doubles as the cache file name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of raw bytes the digest encodes.
    pub fn byte_len(&self) -> usize {
        self.0.len() / 2
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Digest").field(&self.0).finish()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Digest::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = DigestParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl TryFrom<&str> for Digest {
    type Error = DigestParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Digest::parse(value)
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.0
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Error returned when a digest string is malformed.
#[derive(Debug, thiserror::Error)]
pub enum DigestParseError {
    #[error("invalid digest prefix in '{0}'")]
    InvalidPrefix(String),
    #[error(
        "digest hex length must be even and between {min} and {max}, got {0}",
        min = MIN_DIGEST_BYTES * 2,
        max = MAX_DIGEST_BYTES * 2
    )]
    InvalidLength(usize),
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}
