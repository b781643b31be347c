//! Artifact cache: build key to built image, one build in flight per key.
//!
//! Every slot transition happens under one mutex with no await inside the
//! critical section. Builds run on detached tasks, so a resolver that is
//! cancelled only drops its own subscription.

pub mod key;

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use crate::cas::{CasError, CasStore, Digest};
use crate::layer::BuildError;
use crate::metrics::METRICS;
use crate::obs;

pub use key::{Artifact, BuildKey, ImageRef, LayerKind};

/// Errors from cache administration and persistence.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot evict {0}: a build is in flight")]
    Busy(String),

    #[error("persisted manifest {digest} is corrupt: {reason}")]
    CorruptManifest { digest: Digest, reason: String },

    #[error(transparent)]
    Store(#[from] CasError),
}

type BuildOutcome = Result<Arc<Artifact>, BuildError>;

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactState {
    Pending,
    Building,
    Ready,
    Failed,
}

/// Snapshot of one in-memory entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub key: BuildKey,
    pub state: ArtifactState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BuildError>,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub failures: u64,
}

enum Slot {
    Building(watch::Receiver<Option<BuildOutcome>>),
    Ready(Arc<Artifact>),
    Failed(BuildError),
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    failures: AtomicU64,
}

struct CacheInner {
    slots: Mutex<HashMap<BuildKey, Slot>>,
    store: Option<Arc<dyn CasStore>>,
    permits: Semaphore,
    counters: Counters,
}

/// Shared, cloneable handle to the artifact cache.
#[derive(Clone)]
pub struct ArtifactCache {
    inner: Arc<CacheInner>,
}

impl ArtifactCache {
    /// Process-local cache with no persistence.
    pub fn new(max_concurrent_builds: usize) -> Self {
        Self::build(None, max_concurrent_builds)
    }

    /// Cache whose READY manifests persist in `store`.
    pub fn with_store(store: Arc<dyn CasStore>, max_concurrent_builds: usize) -> Self {
        Self::build(Some(store), max_concurrent_builds)
    }

    fn build(store: Option<Arc<dyn CasStore>>, max_concurrent_builds: usize) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slots: Mutex::new(HashMap::new()),
                store,
                permits: Semaphore::new(max_concurrent_builds.max(1)),
                counters: Counters::default(),
            }),
        }
    }

    /// Return the artifact for `key`, building it with `build` on a miss.
    ///
    /// READY and FAILED entries are returned as-is. A BUILDING entry is
    /// joined. On a miss `build` receives the persisted artifact for this
    /// key, if one exists, and decides whether it can be reused.
    pub async fn resolve<F, Fut>(&self, key: &BuildKey, build: F) -> BuildOutcome
    where
        F: FnOnce(Option<Artifact>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Artifact, BuildError>> + Send + 'static,
    {
        let rx = {
            let mut slots = self.inner.lock();
            match slots.get(key) {
                Some(Slot::Ready(artifact)) => {
                    self.record_hit(key);
                    return Ok(Arc::clone(artifact));
                }
                Some(Slot::Failed(err)) => {
                    self.record_hit(key);
                    return Err(err.clone());
                }
                Some(Slot::Building(rx)) => {
                    debug!(key = %key, "joining in-flight build");
                    rx.clone()
                }
                None => {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    METRICS.inc_cache_misses();
                    obs::emit_cache_miss(&key.label());
                    self.start_build(&mut slots, key.clone(), build, true)
                }
            }
        };
        wait_for(rx).await
    }

    /// Discard any READY or FAILED entry and build again from scratch.
    ///
    /// If a build is already in flight it is joined instead.
    pub async fn force_rebuild<F, Fut>(&self, key: &BuildKey, build: F) -> BuildOutcome
    where
        F: FnOnce(Option<Artifact>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Artifact, BuildError>> + Send + 'static,
    {
        let rx = {
            let mut slots = self.inner.lock();
            match slots.get(key) {
                Some(Slot::Building(rx)) => rx.clone(),
                _ => {
                    slots.remove(key);
                    self.inner.delete_persisted(key);
                    self.start_build(&mut slots, key.clone(), build, false)
                }
            }
        };
        wait_for(rx).await
    }

    fn record_hit(&self, key: &BuildKey) {
        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        METRICS.inc_cache_hits();
        obs::emit_cache_hit(&key.label());
    }

    fn start_build<F, Fut>(
        &self,
        slots: &mut HashMap<BuildKey, Slot>,
        key: BuildKey,
        build: F,
        consult_store: bool,
    ) -> watch::Receiver<Option<BuildOutcome>>
    where
        F: FnOnce(Option<Artifact>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Artifact, BuildError>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        slots.insert(key.clone(), Slot::Building(rx.clone()));
        self.inner.counters.builds.fetch_add(1, Ordering::Relaxed);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = inner.run_build(&key, build, consult_store).await;
            {
                let mut slots = inner.lock();
                let slot = match &outcome {
                    Ok(artifact) => Slot::Ready(Arc::clone(artifact)),
                    Err(err) => Slot::Failed(err.clone()),
                };
                slots.insert(key, slot);
            }
            // No receivers left is fine: the slot already holds the result.
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    /// Current lifecycle state of `key`.
    pub fn state(&self, key: &BuildKey) -> ArtifactState {
        match self.inner.lock().get(key) {
            None => ArtifactState::Pending,
            Some(Slot::Building(_)) => ArtifactState::Building,
            Some(Slot::Ready(_)) => ArtifactState::Ready,
            Some(Slot::Failed(_)) => ArtifactState::Failed,
        }
    }

    /// Snapshot of every in-memory entry.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let slots = self.inner.lock();
        let mut entries: Vec<CacheEntry> = slots
            .iter()
            .map(|(key, slot)| {
                let (state, artifact, error) = match slot {
                    Slot::Building(_) => (ArtifactState::Building, None, None),
                    Slot::Ready(a) => (ArtifactState::Ready, Some(Artifact::clone(a)), None),
                    Slot::Failed(e) => (ArtifactState::Failed, None, Some(e.clone())),
                };
                CacheEntry {
                    key: key.clone(),
                    state,
                    artifact,
                    error,
                }
            })
            .collect();
        entries.sort_by_key(|e| e.key.ref_name());
        entries
    }

    /// Remove a READY or FAILED entry and its persisted ref.
    ///
    /// Returns whether anything was removed.
    pub fn evict(&self, key: &BuildKey) -> Result<bool, CacheError> {
        let mut slots = self.inner.lock();
        if let Some(Slot::Building(_)) = slots.get(key) {
            return Err(CacheError::Busy(key.label()));
        }
        let in_memory = slots.remove(key).is_some();
        let persisted = match &self.inner.store {
            Some(store) => store.delete_ref(&key.ref_name())?,
            None => false,
        };
        if in_memory || persisted {
            obs::emit_cache_evicted(&key.label());
        }
        Ok(in_memory || persisted)
    }

    /// Evict whichever key has the given key digest.
    pub fn evict_by_digest(&self, digest: &Digest) -> Result<bool, CacheError> {
        let in_memory = {
            let slots = self.inner.lock();
            slots.keys().find(|k| k.digest() == *digest).cloned()
        };
        if let Some(key) = in_memory {
            return self.evict(&key);
        }

        let Some(store) = &self.inner.store else {
            return Ok(false);
        };
        let mut removed = false;
        for kind in [LayerKind::Foundation, LayerKind::Environment] {
            let name = format!("{}/{}", kind, digest.to_hex());
            removed |= store.delete_ref(&name)?;
        }
        Ok(removed)
    }

    /// Drop persisted manifests that no ref points at any more.
    pub fn prune_manifests(&self) -> Result<usize, CacheError> {
        match &self.inner.store {
            Some(store) => Ok(store.prune()?),
            None => Ok(0),
        }
    }

    /// Every artifact manifest reachable from a persisted ref.
    pub fn persisted_artifacts(&self) -> Result<Vec<Artifact>, CacheError> {
        let Some(store) = &self.inner.store else {
            return Ok(Vec::new());
        };
        let mut artifacts = Vec::new();
        for kind in [LayerKind::Foundation, LayerKind::Environment] {
            for (_, digest) in store.list_refs(kind.as_str())? {
                artifacts.push(load_manifest(store.as_ref(), &digest)?);
            }
        }
        Ok(artifacts)
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            builds: c.builds.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<BuildKey, Slot>> {
        // A panic while holding the lock cannot leave a slot half-written.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_build<F, Fut>(&self, key: &BuildKey, build: F, consult_store: bool) -> BuildOutcome
    where
        F: FnOnce(Option<Artifact>) -> Fut,
        Fut: Future<Output = Result<Artifact, BuildError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BuildError::Aborted("build semaphore closed".into()))?;

        let prior = if consult_store {
            self.load_persisted(key)
        } else {
            None
        };

        let label = key.label();
        obs::emit_build_started(&label, prior.is_some());
        METRICS.inc_builds_started();
        let started = std::time::Instant::now();

        let result = AssertUnwindSafe(async move { build(prior).await })
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(artifact)) if artifact.key != *key => Err(BuildError::Aborted(format!(
                "build for {} returned an artifact for {}",
                label,
                artifact.key.label()
            ))),
            Ok(Ok(artifact)) => {
                self.persist(&artifact);
                Ok(Arc::new(artifact))
            }
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(BuildError::Aborted(panic_message(panic.as_ref()))),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(artifact) => obs::emit_build_finished(&label, &artifact.content_hash, duration_ms),
            Err(err) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                METRICS.inc_builds_failed();
                obs::emit_build_failed(&label, err, duration_ms);
            }
        }
        outcome
    }

    fn load_persisted(&self, key: &BuildKey) -> Option<Artifact> {
        let store = self.store.as_ref()?;
        let digest = match store.read_ref(&key.ref_name()) {
            Ok(Some(digest)) => digest,
            Ok(None) => return None,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to read persisted ref");
                return None;
            }
        };
        match load_manifest(store.as_ref(), &digest) {
            Ok(artifact) if artifact.key == *key => Some(artifact),
            Ok(_) => {
                warn!(key = %key, "persisted ref points at a manifest for another key");
                None
            }
            Err(err) => {
                warn!(key = %key, error = %err, "ignoring unreadable persisted manifest");
                None
            }
        }
    }

    fn persist(&self, artifact: &Artifact) {
        let Some(store) = &self.store else {
            return;
        };
        let result = serde_json::to_vec_pretty(artifact)
            .map_err(|e| CasError::Io(std::io::Error::other(e)))
            .and_then(|bytes| store.put(&bytes))
            .and_then(|digest| store.write_ref(&artifact.key.ref_name(), &digest));
        if let Err(err) = result {
            warn!(key = %artifact.key, error = %err, "failed to persist artifact manifest");
        }
    }

    fn delete_persisted(&self, key: &BuildKey) {
        if let Some(store) = &self.store {
            if let Err(err) = store.delete_ref(&key.ref_name()) {
                warn!(key = %key, error = %err, "failed to delete persisted ref");
            }
        }
    }
}

fn load_manifest(store: &dyn CasStore, digest: &Digest) -> Result<Artifact, CacheError> {
    let bytes = store.get(digest)?;
    let artifact: Artifact =
        serde_json::from_slice(&bytes).map_err(|e| CacheError::CorruptManifest {
            digest: *digest,
            reason: e.to_string(),
        })?;
    if !artifact.verify() {
        return Err(CacheError::CorruptManifest {
            digest: *digest,
            reason: "content hash mismatch".into(),
        });
    }
    Ok(artifact)
}

async fn wait_for(mut rx: watch::Receiver<Option<BuildOutcome>>) -> BuildOutcome {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(outcome) = current {
            return outcome;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or_else(|| Err(BuildError::Aborted("build task dropped".into())));
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    format!("build panicked: {}", detail)
}
