//! Content-addressed storage for artifact manifests.
//!
//! Manifests are stored as blobs named by their SHA-256 digest. A ref maps a
//! build key (`<layer kind>/<key digest>`) to the blob holding that key's
//! current manifest, which is how READY artifacts survive a restart.

pub mod fs;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

/// A SHA-256 value, printed and serialized as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn compute(data: &[u8]) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&Sha256::digest(data));
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl FromStr for Digest {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| CasError::InvalidDigest(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum CasError {
    #[error("blob {0} is not in the store")]
    NotFound(Digest),

    #[error("blob {expected} is corrupt (content hashes to {actual})")]
    Corrupt { expected: Digest, actual: Digest },

    #[error("not a sha256 hex digest: {0:?}")]
    InvalidDigest(String),

    #[error("invalid ref name: {0:?}")]
    InvalidRef(String),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Blob and ref storage behind the artifact cache.
pub trait CasStore: Send + Sync {
    /// Store `data`, returning its digest. Storing the same bytes twice is a no-op.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    /// Read a blob back, verifying it still hashes to `digest`.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Point `name` at `digest`, replacing any previous target.
    fn write_ref(&self, name: &str, digest: &Digest) -> Result<()>;

    fn read_ref(&self, name: &str) -> Result<Option<Digest>>;

    /// Returns whether the ref existed.
    fn delete_ref(&self, name: &str) -> Result<bool>;

    /// Every `(name, digest)` ref directly under the `kind` namespace, sorted.
    fn list_refs(&self, kind: &str) -> Result<Vec<(String, Digest)>>;

    /// Delete blobs no ref points at. Returns how many were removed.
    fn prune(&self) -> Result<usize>;
}

/// Ref names are `/`-joined segments of `[A-Za-z0-9_.-]`; `.` and `..` are not segments.
pub(crate) fn check_ref_name(name: &str) -> Result<()> {
    let segment_ok = |seg: &str| {
        !matches!(seg, "" | "." | "..")
            && seg
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b"_.-".contains(&b))
    };
    if name.split('/').all(segment_ok) {
        Ok(())
    } else {
        Err(CasError::InvalidRef(name.to_string()))
    }
}
