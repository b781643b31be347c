//! Layer builder: foundation and environment layers, resolved through the cache.
//!
//! Instance layers are never cached; they are derived from a READY
//! environment artifact by the patch applier.

pub mod error;
pub mod recipe;
pub mod retry;

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::backend::Backend;
use crate::cache::{Artifact, ArtifactCache, BuildKey};
use crate::domain::RepositoryRef;

pub use error::BuildError;
pub use recipe::{EnvironmentRecipe, FoundationSpec, RecipeBook, TestCommand};
pub use retry::{with_retry, RetryPolicy};

type BuildFn =
    Box<dyn FnOnce(Option<Artifact>) -> BoxFuture<'static, Result<Artifact, BuildError>> + Send>;

/// Builds foundation and environment layers on cache miss.
#[derive(Clone)]
pub struct LayerBuilder {
    cache: ArtifactCache,
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
}

impl LayerBuilder {
    pub fn new(cache: ArtifactCache, backend: Arc<dyn Backend>, retry: RetryPolicy) -> Self {
        Self {
            cache,
            backend,
            retry,
        }
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Resolve the foundation layer for `spec`.
    pub async fn foundation(&self, spec: &FoundationSpec) -> Result<Arc<Artifact>, BuildError> {
        let key = BuildKey::foundation(spec);
        let build = self.foundation_build(key.clone(), spec.clone());
        self.cache.resolve(&key, build).await
    }

    /// Cache key of the environment layer for `repo` built with `recipe`.
    pub fn environment_key(
        repo: &RepositoryRef,
        recipe: &EnvironmentRecipe,
    ) -> Result<BuildKey, BuildError> {
        let fingerprint = recipe.fingerprint()?;
        Ok(BuildKey::environment(repo, fingerprint.hash))
    }

    /// Resolve the environment layer for `repo` at its revision.
    ///
    /// The foundation is resolved first, so a foundation failure is
    /// reported without ever entering the environment's cache slot.
    pub async fn environment(
        &self,
        repo: &RepositoryRef,
        recipe: &EnvironmentRecipe,
    ) -> Result<Arc<Artifact>, BuildError> {
        let (key, build) = self.prepare_environment(repo, recipe).await?;
        self.cache.resolve(&key, build).await
    }

    /// Drop any READY or FAILED environment entry and build it again.
    pub async fn rebuild_environment(
        &self,
        repo: &RepositoryRef,
        recipe: &EnvironmentRecipe,
    ) -> Result<Arc<Artifact>, BuildError> {
        let (key, build) = self.prepare_environment(repo, recipe).await?;
        self.cache.force_rebuild(&key, build).await
    }

    async fn prepare_environment(
        &self,
        repo: &RepositoryRef,
        recipe: &EnvironmentRecipe,
    ) -> Result<(BuildKey, BuildFn), BuildError> {
        recipe.validate()?;
        let foundation = self.foundation(&recipe.foundation).await?;
        let key = Self::environment_key(repo, recipe)?;
        let build = self.environment_build(key.clone(), foundation, repo.clone(), recipe.clone());
        Ok((key, build))
    }

    fn foundation_build(&self, key: BuildKey, spec: FoundationSpec) -> BuildFn {
        let backend = Arc::clone(&self.backend);
        let retry = self.retry.clone();
        Box::new(move |prior| {
            async move {
                if let Some(artifact) = reusable(backend.as_ref(), prior).await {
                    return Ok(artifact);
                }
                let image =
                    with_retry(&retry, "foundation", || backend.build_foundation(&key, &spec))
                        .await?;
                Ok(Artifact::new(key, image))
            }
            .boxed()
        })
    }

    fn environment_build(
        &self,
        key: BuildKey,
        foundation: Arc<Artifact>,
        repo: RepositoryRef,
        recipe: EnvironmentRecipe,
    ) -> BuildFn {
        let backend = Arc::clone(&self.backend);
        let retry = self.retry.clone();
        Box::new(move |prior| {
            async move {
                if let Some(artifact) = reusable(backend.as_ref(), prior).await {
                    return Ok(artifact);
                }
                let image = with_retry(&retry, "environment", || {
                    backend.build_environment(&key, &foundation, &repo, &recipe)
                })
                .await?
                .with_metadata("foundation", foundation.content_hash.to_hex());
                Ok(Artifact::new(key, image))
            }
            .boxed()
        })
    }
}

/// A persisted artifact is reused only while the backend still has its image.
async fn reusable(backend: &dyn Backend, prior: Option<Artifact>) -> Option<Artifact> {
    let prior = prior?;
    if backend.image_exists(&prior.image).await {
        debug!(key = %prior.key, "reusing persisted artifact");
        Some(prior)
    } else {
        debug!(key = %prior.key, "persisted artifact image is gone, rebuilding");
        None
    }
}
