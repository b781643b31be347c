//! Test runner: one isolated invocation per test id inside a context.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{ExecOutput, ExecStatus};
use crate::context::ExecutionContext;
use crate::domain::{TestOutcome, TestStatus};
use crate::layer::TestCommand;
use crate::metrics::METRICS;
use crate::obs;

/// Bytes of combined stdout/stderr kept per outcome.
pub const OUTPUT_TAIL_BYTES: usize = 4096;

/// Runs test ids one at a time and classifies each exit.
#[derive(Debug, Clone)]
pub struct TestRunner {
    per_test_timeout: Duration,
    deadline: Option<Instant>,
}

impl TestRunner {
    pub fn new(per_test_timeout: Duration) -> Self {
        Self {
            per_test_timeout,
            deadline: None,
        }
    }

    /// Stop starting tests once `deadline` passes; later ids are `SKIPPED`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn per_test_timeout(&self) -> Duration {
        self.per_test_timeout
    }

    /// Run every id in `tests` inside `ctx`, consuming it.
    ///
    /// The context is destroyed on return, and dropping the future mid-run
    /// destroys it too. A backend failure marks the current test `ERROR`
    /// and every later one `SKIPPED`.
    pub async fn run(
        &self,
        ctx: ExecutionContext,
        command: &TestCommand,
        tests: &BTreeSet<String>,
    ) -> BTreeMap<String, TestOutcome> {
        let mut outcomes = BTreeMap::new();
        let mut aborted: Option<String> = None;

        for test_id in tests {
            if let Some(reason) = &aborted {
                outcomes.insert(test_id.clone(), TestOutcome::skipped(test_id, reason.clone()));
                continue;
            }

            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                let reason = "skipped: run deadline exceeded".to_string();
                outcomes.insert(test_id.clone(), TestOutcome::skipped(test_id, reason.clone()));
                aborted = Some(reason);
                continue;
            }

            let argv = command.render(test_id);
            debug!(test_id = %test_id, argv = ?argv, "running test");
            let outcome = match ctx.exec(&argv, self.per_test_timeout).await {
                Ok(output) => classify(test_id, command, &output),
                Err(err) => {
                    warn!(test_id = %test_id, error = %err, "backend failure; aborting test batch");
                    aborted = Some(format!("skipped: batch aborted after backend failure: {}", err));
                    TestOutcome::new(test_id, TestStatus::Error, 0, err.to_string())
                }
            };
            METRICS.inc_tests_executed();
            obs::emit_test_finished(test_id, outcome.status, outcome.duration_ms);
            outcomes.insert(test_id.clone(), outcome);
        }

        if let Err(err) = ctx.destroy() {
            warn!(error = %err, "failed to destroy execution context after test run");
        }
        outcomes
    }
}

/// Map one command result onto a [`TestStatus`].
pub fn classify(test_id: &str, command: &TestCommand, output: &ExecOutput) -> TestOutcome {
    let status = match &output.status {
        ExecStatus::Exited(0) => TestStatus::Pass,
        ExecStatus::Exited(code) if command.is_failure_code(*code) => TestStatus::Fail,
        ExecStatus::Exited(_) | ExecStatus::Signaled | ExecStatus::SpawnFailed(_) => {
            TestStatus::Error
        }
        ExecStatus::TimedOut => TestStatus::Timeout,
    };
    let mut tail = output.combined_tail(OUTPUT_TAIL_BYTES);
    if let ExecStatus::SpawnFailed(reason) = &output.status {
        if tail.is_empty() {
            tail = format!("failed to start test command: {}", reason);
        }
    }
    TestOutcome::new(test_id, status, output.duration_ms, tail)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::Backend;
    use crate::cache::{Artifact, BuildKey, ImageRef};
    use crate::domain::RepositoryRef;
    use crate::fakes::{MemoryBackend, TestBehavior};
    use crate::layer::{EnvironmentRecipe, FoundationSpec};

    async fn context(backend: &Arc<MemoryBackend>) -> ExecutionContext {
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
        ExecutionContext::instantiate(backend.clone(), Arc::new(Artifact::new(key, image)))
            .await
            .unwrap()
    }

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn output(status: ExecStatus) -> ExecOutput {
        ExecOutput {
            status,
            stdout: b"out".to_vec(),
            stderr: Vec::new(),
            duration_ms: 3,
        }
    }

    #[test]
    fn classifies_exit_statuses() {
        let cmd = TestCommand::pytest();
        let status = |s| classify("t", &cmd, &output(s)).status;
        assert_eq!(status(ExecStatus::Exited(0)), TestStatus::Pass);
        assert_eq!(status(ExecStatus::Exited(1)), TestStatus::Fail);
        assert_eq!(status(ExecStatus::Exited(2)), TestStatus::Error);
        assert_eq!(status(ExecStatus::Signaled), TestStatus::Error);
        assert_eq!(status(ExecStatus::TimedOut), TestStatus::Timeout);
        assert_eq!(
            status(ExecStatus::SpawnFailed("no python".into())),
            TestStatus::Error
        );
    }

    #[tokio::test]
    async fn runs_each_test_and_destroys_context() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_repo("mem://r", "c1", &[("a.txt", "A")])
                .with_test("t::pass", TestBehavior::Pass)
                .with_test("t::fail", TestBehavior::Fail)
                .with_test("t::err", TestBehavior::Error),
        );
        let ctx = context(&backend).await;
        let runner = TestRunner::new(Duration::from_secs(5));
        let out = runner
            .run(ctx, &TestCommand::pytest(), &ids(&["t::pass", "t::fail", "t::err"]))
            .await;

        assert_eq!(out["t::pass"].status, TestStatus::Pass);
        assert_eq!(out["t::fail"].status, TestStatus::Fail);
        assert_eq!(out["t::err"].status, TestStatus::Error);
        assert_eq!(backend.live_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_test_times_out() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_repo("mem://r", "c1", &[])
                .with_test("t::hang", TestBehavior::Hang)
                .with_test("t::pass", TestBehavior::Pass),
        );
        let ctx = context(&backend).await;
        let runner = TestRunner::new(Duration::from_secs(2));
        let out = runner
            .run(ctx, &TestCommand::pytest(), &ids(&["t::hang", "t::pass"]))
            .await;
        assert_eq!(out["t::hang"].status, TestStatus::Timeout);
        assert_eq!(out["t::pass"].status, TestStatus::Pass);
        assert_eq!(backend.live_contexts(), 0);
    }

    #[tokio::test]
    async fn backend_failure_skips_the_rest() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_repo("mem://r", "c1", &[])
                .with_test("a::vanish", TestBehavior::Vanish)
                .with_test("b::pass", TestBehavior::Pass),
        );
        let ctx = context(&backend).await;
        let runner = TestRunner::new(Duration::from_secs(5));
        let out = runner
            .run(ctx, &TestCommand::pytest(), &ids(&["a::vanish", "b::pass"]))
            .await;
        assert_eq!(out["a::vanish"].status, TestStatus::Error);
        assert_eq!(out["b::pass"].status, TestStatus::Skipped);
        assert!(out["b::pass"].output_tail.contains("batch aborted"));
        assert_eq!(backend.live_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_skips_everything() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_repo("mem://r", "c1", &[])
                .with_test("t::pass", TestBehavior::Pass),
        );
        let ctx = context(&backend).await;
        let runner = TestRunner::new(Duration::from_secs(5)).with_deadline(Instant::now());
        let out = runner
            .run(ctx, &TestCommand::pytest(), &ids(&["t::pass"]))
            .await;
        assert_eq!(out["t::pass"].status, TestStatus::Skipped);
        assert_eq!(backend.execs(), 0);
    }
}
