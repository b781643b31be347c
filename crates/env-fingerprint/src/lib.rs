//! Env-Fingerprint: Dependency Fingerprinting for patchcheck
//!
//! This crate provides the identity layer for environment artifacts.
//! Two requests that resolve to the same repository revision and the same
//! install recipe must map to the same fingerprint, and any change to the
//! recipe or to the dependency manifests must change it.
//!
//! ## Key Components
//!
//! - [`fingerprint_recipe`]: canonical hash of an install recipe (part of the build key)
//! - [`fingerprint_manifests`]: hash of dependency manifests found in a checked-out tree
//! - [`Fingerprint`]: content-addressable identifier with its [`FingerprintSource`]

pub mod error;
pub mod manifest;
pub mod recipe;

pub use error::FingerprintError;
pub use manifest::{fingerprint_manifests, is_manifest_file, ManifestFingerprint};
pub use recipe::{fingerprint_recipe, normalize_text};

use serde::{Deserialize, Serialize};

/// Result type for env-fingerprint operations
pub type Result<T> = std::result::Result<T, FingerprintError>;

/// Content-addressable fingerprint of an environment input
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// The SHA256 hash (hex)
    pub hash: String,
    /// What the hash was computed from
    pub source: FingerprintSource,
}

/// Source of a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintSource {
    /// Canonical JSON encoding of an install recipe
    Recipe,
    /// Dependency manifests discovered in a source tree
    Manifests,
    /// Tree had no recognizable manifests
    Empty,
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl Fingerprint {
    /// Create a new Fingerprint
    pub fn new(hash: String, source: FingerprintSource) -> Self {
        Fingerprint { hash, source }
    }

    /// Get short hash (first 12 characters)
    pub fn short(&self) -> &str {
        &self.hash[..12.min(self.hash.len())]
    }
}
