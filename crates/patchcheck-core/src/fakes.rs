//! In-memory backend for tests.
//!
//! Repositories are maps of path to content, images and contexts are
//! copies of those maps, and "running a test" looks the test id up in a
//! script of [`TestBehavior`]s. Counters and fault injection let tests
//! observe build deduplication and failure handling.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::backend::{validate_relative_path, Backend, BackendError, ContextId, ExecOutput, ExecStatus};
use crate::cache::{Artifact, BuildKey, ImageRef};
use crate::domain::RepositoryRef;
use crate::layer::{BuildError, EnvironmentRecipe, FoundationSpec};

type Files = BTreeMap<String, Vec<u8>>;

/// Scripted result of running one test id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestBehavior {
    Pass,
    Fail,
    /// Exits with a code outside the failure set.
    Error,
    /// Never finishes; hits the timeout.
    Hang,
    /// Passes iff `path` contains `needle`, fails otherwise.
    PassWhenContains { path: String, needle: String },
    /// Fails iff `path` contains `needle`, passes otherwise.
    FailWhenContains { path: String, needle: String },
    /// The context disappears mid-run.
    Vanish,
}

/// Exit code for tests with no scripted behavior (pytest: usage error).
pub const UNKNOWN_TEST_EXIT_CODE: i32 = 4;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory [`Backend`].
#[derive(Default)]
pub struct MemoryBackend {
    repos: Mutex<HashMap<(String, String), Files>>,
    tests: Mutex<HashMap<String, TestBehavior>>,
    images: Mutex<HashMap<String, Files>>,
    contexts: Mutex<HashMap<ContextId, Files>>,
    foundation_builds: AtomicUsize,
    environment_builds: AtomicUsize,
    contexts_created: AtomicUsize,
    execs: AtomicUsize,
    build_delay: Mutex<Option<Duration>>,
    foundation_failures: Mutex<VecDeque<BuildError>>,
    environment_failures: Mutex<VecDeque<BuildError>>,
    panic_next_environment: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository revision with its files.
    pub fn with_repo(self, location: &str, revision: &str, files: &[(&str, &str)]) -> Self {
        self.add_repo(location, revision, files);
        self
    }

    pub fn add_repo(&self, location: &str, revision: &str, files: &[(&str, &str)]) {
        let files = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect();
        lock(&self.repos).insert((location.to_string(), revision.to_string()), files);
    }

    /// Script the behavior of one test id.
    pub fn with_test(self, test_id: &str, behavior: TestBehavior) -> Self {
        self.set_test(test_id, behavior);
        self
    }

    pub fn set_test(&self, test_id: &str, behavior: TestBehavior) {
        lock(&self.tests).insert(test_id.to_string(), behavior);
    }

    /// Make every build sleep for `delay` first.
    pub fn set_build_delay(&self, delay: Duration) {
        *lock(&self.build_delay) = Some(delay);
    }

    pub fn fail_next_foundation(&self, err: BuildError) {
        lock(&self.foundation_failures).push_back(err);
    }

    pub fn fail_next_environment(&self, err: BuildError) {
        lock(&self.environment_failures).push_back(err);
    }

    pub fn panic_next_environment(&self) {
        self.panic_next_environment.store(true, Ordering::SeqCst);
    }

    /// Drop a built image, as if it were garbage-collected.
    pub fn forget_image(&self, location: &str) {
        lock(&self.images).remove(location);
    }

    pub fn foundation_builds(&self) -> usize {
        self.foundation_builds.load(Ordering::SeqCst)
    }

    pub fn environment_builds(&self) -> usize {
        self.environment_builds.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn execs(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    /// Contents of a file in the environment image, for isolation checks.
    pub fn image_file(&self, location: &str, path: &str) -> Option<Vec<u8>> {
        lock(&self.images)
            .get(location)
            .and_then(|files| files.get(path).cloned())
    }

    async fn simulate_build_delay(&self) {
        let delay = *lock(&self.build_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn with_context<T>(
        &self,
        ctx: &ContextId,
        f: impl FnOnce(&mut Files) -> T,
    ) -> Result<T, BackendError> {
        let mut contexts = lock(&self.contexts);
        let files = contexts
            .get_mut(ctx)
            .ok_or_else(|| BackendError::ContextNotFound(ctx.clone()))?;
        Ok(f(files))
    }

    fn file_contains(&self, ctx: &ContextId, path: &str, needle: &str) -> Result<bool, BackendError> {
        self.with_context(ctx, |files| {
            files
                .get(path)
                .map(|c| String::from_utf8_lossy(c).contains(needle))
                .unwrap_or(false)
        })
    }
}

fn output(status: ExecStatus, text: String, started: Instant) -> ExecOutput {
    ExecOutput {
        status,
        stdout: text.into_bytes(),
        stderr: Vec::new(),
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn build_foundation(
        &self,
        key: &BuildKey,
        spec: &FoundationSpec,
    ) -> Result<ImageRef, BuildError> {
        self.foundation_builds.fetch_add(1, Ordering::SeqCst);
        self.simulate_build_delay().await;
        if let Some(err) = lock(&self.foundation_failures).pop_front() {
            return Err(err);
        }
        let location = format!("mem://foundation/{}", key.digest().short());
        lock(&self.images).insert(location.clone(), Files::new());
        Ok(ImageRef::new(location).with_metadata(format!("version.{}", spec.runtime), "memory"))
    }

    async fn build_environment(
        &self,
        key: &BuildKey,
        _foundation: &Artifact,
        repo: &RepositoryRef,
        _recipe: &EnvironmentRecipe,
    ) -> Result<ImageRef, BuildError> {
        self.environment_builds.fetch_add(1, Ordering::SeqCst);
        self.simulate_build_delay().await;
        if self.panic_next_environment.swap(false, Ordering::SeqCst) {
            panic!("injected environment build panic");
        }
        if let Some(err) = lock(&self.environment_failures).pop_front() {
            return Err(err);
        }

        let files = lock(&self.repos)
            .get(&(repo.location.clone(), repo.revision.clone()))
            .cloned()
            .ok_or_else(|| BuildError::StepFailed {
                step: "checkout".into(),
                exit_code: Some(128),
                detail: format!("unknown revision {} in {}", repo.revision, repo.location),
            })?;

        let location = format!("mem://environment/{}", key.digest().short());
        lock(&self.images).insert(location.clone(), files);
        Ok(ImageRef::new(location).with_metadata("revision", repo.revision.clone()))
    }

    async fn image_exists(&self, image: &ImageRef) -> bool {
        lock(&self.images).contains_key(&image.location)
    }

    async fn instantiate(&self, environment: &Artifact) -> Result<ContextId, BackendError> {
        let files = lock(&self.images)
            .get(&environment.image.location)
            .cloned()
            .ok_or_else(|| BackendError::ImageMissing(environment.image.location.clone()))?;
        let id = ContextId::generate();
        lock(&self.contexts).insert(id.clone(), files);
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn read_file(&self, ctx: &ContextId, path: &str) -> Result<Option<Vec<u8>>, BackendError> {
        validate_relative_path(path)?;
        self.with_context(ctx, |files| files.get(path).cloned())
    }

    async fn write_file(
        &self,
        ctx: &ContextId,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError> {
        validate_relative_path(path)?;
        self.with_context(ctx, |files| {
            files.insert(path.to_string(), contents.to_vec());
        })
    }

    async fn remove_file(&self, ctx: &ContextId, path: &str) -> Result<(), BackendError> {
        validate_relative_path(path)?;
        self.with_context(ctx, |files| {
            files.remove(path);
        })
    }

    async fn exec(
        &self,
        ctx: &ContextId,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, BackendError> {
        let started = Instant::now();
        self.execs.fetch_add(1, Ordering::SeqCst);
        // Fail fast if the context is gone.
        self.with_context(ctx, |_| ())?;

        let test_id = argv.last().cloned().unwrap_or_default();
        let behavior = lock(&self.tests).get(&test_id).cloned();

        let passed = |ok: bool| {
            if ok {
                (ExecStatus::Exited(0), format!("{} PASSED", test_id))
            } else {
                (ExecStatus::Exited(1), format!("{} FAILED", test_id))
            }
        };

        let (status, text) = match behavior {
            Some(TestBehavior::Pass) => passed(true),
            Some(TestBehavior::Fail) => passed(false),
            Some(TestBehavior::Error) => (ExecStatus::Exited(2), format!("{} ERROR", test_id)),
            Some(TestBehavior::Hang) => {
                let _ = tokio::time::timeout(timeout, std::future::pending::<()>()).await;
                (ExecStatus::TimedOut, format!("{} TIMEOUT", test_id))
            }
            Some(TestBehavior::PassWhenContains { path, needle }) => {
                passed(self.file_contains(ctx, &path, &needle)?)
            }
            Some(TestBehavior::FailWhenContains { path, needle }) => {
                passed(!self.file_contains(ctx, &path, &needle)?)
            }
            Some(TestBehavior::Vanish) => {
                lock(&self.contexts).remove(ctx);
                return Err(BackendError::ContextNotFound(ctx.clone()));
            }
            None => (
                ExecStatus::Exited(UNKNOWN_TEST_EXIT_CODE),
                format!("ERROR: not found: {}", test_id),
            ),
        };
        Ok(output(status, text, started))
    }

    fn destroy(&self, ctx: &ContextId) -> Result<(), BackendError> {
        lock(&self.contexts).remove(ctx);
        Ok(())
    }

    fn live_contexts(&self) -> usize {
        lock(&self.contexts).len()
    }
}
