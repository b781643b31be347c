//! Error types for env-fingerprint

use thiserror::Error;

/// Errors that can occur while fingerprinting an environment
#[derive(Error, Debug)]
pub enum FingerprintError {
    /// Tree to fingerprint does not exist
    #[error("Tree not found at path: {0}")]
    TreeNotFound(String),

    /// Recipe could not be canonicalized
    #[error("Recipe is not canonicalizable: {0}")]
    InvalidRecipe(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
