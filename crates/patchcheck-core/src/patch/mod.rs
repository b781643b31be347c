//! Patch application onto fresh execution contexts.

pub mod apply;
pub mod parse;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::backend::{Backend, BackendError};
use crate::cache::Artifact;
use crate::cas::Digest;
use crate::context::ExecutionContext;
use crate::obs;

pub use apply::{apply_hunks, plan_section, TextFile};
pub use parse::{parse_patch, FileChange, FilePatch, Hunk, HunkLine, PatchSet};

/// Why a patch could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApplyError {
    #[error("malformed patch: {reason}")]
    Malformed { reason: String },

    #[error("patch conflict in {path}: {reason}")]
    Conflict { path: String, reason: String },

    #[error("patch target missing: {path}")]
    TargetMissing { path: String },

    #[error("backend failure while applying patch: {detail}")]
    Backend { detail: String },
}

impl From<BackendError> for ApplyError {
    fn from(err: BackendError) -> Self {
        ApplyError::Backend {
            detail: err.to_string(),
        }
    }
}

/// Staged file states keyed by path; `None` means removed.
type Overlay = BTreeMap<String, Option<Vec<u8>>>;

/// Applies unified diffs to contexts derived from environment artifacts.
#[derive(Clone)]
pub struct PatchApplier {
    backend: Arc<dyn Backend>,
}

impl PatchApplier {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Instantiate a context from `environment` and apply `patch` to it.
    ///
    /// The patch is parsed before any context exists. Every edit is
    /// computed before the first write, and a failed apply destroys the
    /// context it created.
    pub async fn apply(
        &self,
        environment: Arc<Artifact>,
        patch: &str,
    ) -> Result<ExecutionContext, ApplyError> {
        let digest = Digest::compute(patch.as_bytes());
        let set = match parse_patch(patch) {
            Ok(set) => set,
            Err(err) => {
                obs::emit_patch_rejected(&digest, &err);
                return Err(err);
            }
        };

        let mut ctx = ExecutionContext::instantiate(self.backend.clone(), environment).await?;
        let result = match stage(&ctx, &set).await {
            Ok(overlay) => commit(&ctx, &overlay).await.map(|()| overlay.len()),
            Err(err) => Err(err),
        };

        match result {
            Ok(touched) => {
                ctx.set_applied_patch(digest.clone());
                obs::emit_patch_applied(ctx.id().as_str(), &digest, touched);
                Ok(ctx)
            }
            Err(err) => {
                obs::emit_patch_rejected(&digest, &err);
                if let Err(destroy_err) = ctx.destroy() {
                    warn!(error = %destroy_err, "failed to destroy context after rejected patch");
                }
                Err(err)
            }
        }
    }
}

async fn current(
    ctx: &ExecutionContext,
    overlay: &Overlay,
    path: &str,
) -> Result<Option<Vec<u8>>, ApplyError> {
    match overlay.get(path) {
        Some(staged) => Ok(staged.clone()),
        None => Ok(ctx.read_file(path).await?),
    }
}

async fn stage(ctx: &ExecutionContext, set: &PatchSet) -> Result<Overlay, ApplyError> {
    let mut overlay = Overlay::new();
    for section in &set.files {
        let source = current(ctx, &overlay, section.source_path()).await?;
        let target_exists = if section.change == FileChange::Rename
            && section.source_path() != section.target_path()
        {
            current(ctx, &overlay, section.target_path()).await?.is_some()
        } else {
            false
        };
        for (path, contents) in plan_section(section, source.as_deref(), target_exists)? {
            overlay.insert(path, contents);
        }
    }
    Ok(overlay)
}

async fn commit(ctx: &ExecutionContext, overlay: &Overlay) -> Result<(), ApplyError> {
    // Removals first so a rename onto a freed path never trips over it.
    for (path, contents) in overlay {
        if contents.is_none() {
            ctx.remove_file(path).await?;
        }
    }
    for (path, contents) in overlay {
        if let Some(bytes) = contents {
            ctx.write_file(path, bytes).await?;
        }
    }
    Ok(())
}
