//! Recipe hashing - canonical fingerprints of install recipes
//!
//! A recipe is any serializable description of how an environment is
//! built (runtime, install steps, test command). It is hashed through a
//! canonical JSON form so that field order and formatting never leak into
//! the fingerprint.

use crate::error::FingerprintError;
use crate::{Fingerprint, FingerprintSource, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Generate the fingerprint of an install recipe
///
/// The value is converted to a `serde_json::Value` first; object keys are
/// then emitted in sorted order, which makes the encoding independent of
/// struct field order and map iteration order.
pub fn fingerprint_recipe<T: Serialize>(recipe: &T) -> Result<Fingerprint> {
    let value =
        serde_json::to_value(recipe).map_err(|e| FingerprintError::InvalidRecipe(e.to_string()))?;
    let canonical = serde_json::to_vec(&value)?;

    let mut hasher = Sha256::new();
    hasher.update(b"recipe:v1\0");
    hasher.update(&canonical);
    let hash = hex::encode(hasher.finalize());

    debug!("Recipe fingerprint: {}", &hash[..12]);
    Ok(Fingerprint::new(hash, FingerprintSource::Recipe))
}

/// Normalize text content for consistent hashing
///
/// - Convert CRLF to LF
/// - Remove trailing whitespace
/// - Ensure single newline at end
pub fn normalize_text(content: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(content);

    let normalized: String = text
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");

    let mut result = normalized.into_bytes();
    if !result.is_empty() && result.last() != Some(&b'\n') {
        result.push(b'\n');
    }

    result
}
