//! Execution backends: where layers are materialized and commands run.

pub mod local;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::{Artifact, BuildKey, ImageRef};
use crate::domain::RepositoryRef;
use crate::layer::{BuildError, EnvironmentRecipe, FoundationSpec};

pub use local::LocalBackend;

/// Identifier of a live execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub String);

impl ContextId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Infrastructure failures. Any of these aborts the current test batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("execution context {0} not found")]
    ContextNotFound(ContextId),

    #[error("image missing: {0}")]
    ImageMissing(String),

    #[error("invalid path in context: {0}")]
    InvalidPath(String),

    #[error("backend io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(err.to_string())
    }
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    Exited(i32),
    /// Killed by a signal.
    Signaled,
    /// Killed after exceeding its timeout.
    TimedOut,
    /// The program could not be started.
    SpawnFailed(String),
}

/// Captured result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub status: ExecStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == ExecStatus::Exited(0)
    }

    /// Last `max_bytes` of stdout followed by stderr, lossily decoded.
    pub fn combined_tail(&self, max_bytes: usize) -> String {
        let mut combined = Vec::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.extend_from_slice(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() && !self.stdout.ends_with(b"\n") {
            combined.push(b'\n');
        }
        combined.extend_from_slice(&self.stderr);
        let start = combined.len().saturating_sub(max_bytes);
        String::from_utf8_lossy(&combined[start..]).into_owned()
    }
}

/// Seam between the engine and whatever materializes images and contexts.
///
/// Build methods return [`BuildError`] so backends can classify step
/// failures (transient vs dependency resolution) where the output is seen.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Provision the foundation layer described by `spec`.
    async fn build_foundation(
        &self,
        key: &BuildKey,
        spec: &FoundationSpec,
    ) -> Result<ImageRef, BuildError>;

    /// Check out `repo` and run the recipe's install steps.
    async fn build_environment(
        &self,
        key: &BuildKey,
        foundation: &Artifact,
        repo: &RepositoryRef,
        recipe: &EnvironmentRecipe,
    ) -> Result<ImageRef, BuildError>;

    /// Whether a previously built image is still available.
    async fn image_exists(&self, image: &ImageRef) -> bool;

    /// Derive a fresh, isolated context from an environment artifact.
    async fn instantiate(&self, environment: &Artifact) -> Result<ContextId, BackendError>;

    /// Read a file relative to the context root. `None` if absent.
    async fn read_file(&self, ctx: &ContextId, path: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Write a file relative to the context root, creating parent directories.
    async fn write_file(&self, ctx: &ContextId, path: &str, contents: &[u8])
        -> Result<(), BackendError>;

    async fn remove_file(&self, ctx: &ContextId, path: &str) -> Result<(), BackendError>;

    /// Run `argv` inside the context, killing it after `timeout`.
    async fn exec(
        &self,
        ctx: &ContextId,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, BackendError>;

    /// Tear a context down. Idempotent; safe to call from `Drop`.
    fn destroy(&self, ctx: &ContextId) -> Result<(), BackendError>;

    /// Number of contexts created and not yet destroyed.
    fn live_contexts(&self) -> usize;
}

/// Reject absolute paths and anything that escapes the context root.
pub(crate) fn validate_relative_path(path: &str) -> Result<(), BackendError> {
    use std::path::{Component, Path};

    if path.is_empty() {
        return Err(BackendError::InvalidPath(path.to_string()));
    }
    let ok = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(BackendError::InvalidPath(path.to_string()))
    }
}
