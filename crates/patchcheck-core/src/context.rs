//! Ephemeral execution contexts.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::backend::{Backend, BackendError, ContextId, ExecOutput};
use crate::cache::Artifact;
use crate::cas::Digest;
use crate::metrics::METRICS;
use crate::obs;

/// An isolated runtime derived from one environment artifact.
///
/// Owned by exactly one run. Dropping an undestroyed context destroys it,
/// so every exit path (errors, timeouts, cancellation) tears it down.
pub struct ExecutionContext {
    id: ContextId,
    backend: Arc<dyn Backend>,
    environment: Arc<Artifact>,
    applied_patch: Option<Digest>,
    destroyed: bool,
}

impl ExecutionContext {
    /// Instantiate a fresh context from a READY environment artifact.
    pub async fn instantiate(
        backend: Arc<dyn Backend>,
        environment: Arc<Artifact>,
    ) -> Result<Self, BackendError> {
        let id = backend.instantiate(&environment).await?;
        METRICS.inc_contexts_created();
        obs::emit_context_created(id.as_str(), &environment.key.label());
        Ok(Self {
            id,
            backend,
            environment,
            applied_patch: None,
            destroyed: false,
        })
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn environment(&self) -> &Arc<Artifact> {
        &self.environment
    }

    /// Digest of the patch applied to this context, if any.
    pub fn applied_patch(&self) -> Option<&Digest> {
        self.applied_patch.as_ref()
    }

    pub(crate) fn set_applied_patch(&mut self, digest: Digest) {
        self.applied_patch = Some(digest);
    }

    pub async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.backend.read_file(&self.id, path).await
    }

    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), BackendError> {
        self.backend.write_file(&self.id, path, contents).await
    }

    pub async fn remove_file(&self, path: &str) -> Result<(), BackendError> {
        self.backend.remove_file(&self.id, path).await
    }

    pub async fn exec(&self, argv: &[String], timeout: Duration) -> Result<ExecOutput, BackendError> {
        self.backend.exec(&self.id, argv, timeout).await
    }

    /// Tear the context down now.
    pub fn destroy(mut self) -> Result<(), BackendError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), BackendError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        METRICS.inc_contexts_destroyed();
        obs::emit_context_destroyed(self.id.as_str());
        self.backend.destroy(&self.id)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            warn!(context = %self.id, error = %err, "failed to destroy execution context");
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("environment", &self.environment.key.label())
            .field("applied_patch", &self.applied_patch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BuildKey, ImageRef};
    use crate::domain::RepositoryRef;
    use crate::fakes::MemoryBackend;
    use crate::layer::{EnvironmentRecipe, FoundationSpec};

    async fn setup() -> (Arc<MemoryBackend>, Arc<Artifact>) {
        let backend = Arc::new(MemoryBackend::new().with_repo("mem://r", "c1", &[("a.txt", "A")]));
        let repo = RepositoryRef::new("mem://r", "c1");
        let key = BuildKey::environment(&repo, "fp");
        let foundation = Artifact::new(
            BuildKey::foundation(&FoundationSpec::default()),
            ImageRef::new("mem://f"),
        );
        let image = backend
            .build_environment(&key, &foundation, &repo, &EnvironmentRecipe::default())
            .await
            .unwrap();
        (backend, Arc::new(Artifact::new(key, image)))
    }

    #[tokio::test]
    async fn drop_destroys_context() {
        let (backend, env) = setup().await;
        {
            let ctx = ExecutionContext::instantiate(backend.clone(), env.clone()).await.unwrap();
            assert_eq!(ctx.read_file("a.txt").await.unwrap().unwrap(), b"A");
            assert_eq!(backend.live_contexts(), 1);
        }
        assert_eq!(backend.live_contexts(), 0);
    }

    #[tokio::test]
    async fn explicit_destroy_is_final() {
        let (backend, env) = setup().await;
        let ctx = ExecutionContext::instantiate(backend.clone(), env).await.unwrap();
        assert!(ctx.applied_patch().is_none());
        ctx.destroy().unwrap();
        assert_eq!(backend.live_contexts(), 0);
    }
}
