//! Per-request orchestration and batch evaluation.
//!
//! Each request moves through `Validated → Built → Applied → Executed →
//! Decided`. Requests are independent futures: dropping one (timeout,
//! cancellation) destroys its contexts without touching other requests or
//! the builds they share.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, Instrument};

use crate::backend::Backend;
use crate::cache::{ArtifactCache, CacheError};
use crate::cas::fs::FsCasStore;
use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::domain::EvaluationRequest;
use crate::layer::LayerBuilder;
use crate::metrics::METRICS;
use crate::obs;
use crate::patch::PatchApplier;
use crate::runner::TestRunner;
use crate::verdict::{Verdict, VerdictEngine};

/// Where a request currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validated,
    Built,
    Applied,
    Executed,
    Decided,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Validated => "validated",
            Stage::Built => "built",
            Stage::Applied => "applied",
            Stage::Executed => "executed",
            Stage::Decided => "decided",
        };
        f.write_str(s)
    }
}

/// Last stage a request reached, readable after its future is dropped.
#[derive(Debug, Default)]
struct StageTracker(Mutex<Option<Stage>>);

impl StageTracker {
    fn advance(&self, stage: Stage) {
        debug!(stage = %stage, "stage reached");
        if let Ok(mut current) = self.0.lock() {
            *current = Some(stage);
        }
    }

    fn describe(&self) -> String {
        match self.0.lock().ok().and_then(|s| *s) {
            Some(stage) => format!("after stage '{}'", stage),
            None => "before validation".to_string(),
        }
    }
}

/// Evaluates requests against environments resolved through one cache.
#[derive(Clone)]
pub struct Evaluator {
    builder: LayerBuilder,
    applier: PatchApplier,
    per_test_timeout: Duration,
    overall_timeout: Duration,
    max_workers: usize,
    continue_on_error: bool,
}

impl Evaluator {
    pub fn new(builder: LayerBuilder, config: &EngineConfig) -> Self {
        let applier = PatchApplier::new(Arc::clone(builder.backend()));
        Self {
            builder,
            applier,
            per_test_timeout: config.per_test_timeout(),
            overall_timeout: config.overall_timeout(),
            max_workers: config.max_workers.max(1),
            continue_on_error: config.continue_on_error,
        }
    }

    /// Evaluator whose artifact manifests persist under `cache_root/cas`.
    pub fn from_config(
        config: &EngineConfig,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, CacheError> {
        let store = FsCasStore::new(config.cache_root.join("cas"))?;
        let cache = ArtifactCache::with_store(Arc::new(store), config.max_concurrent_builds);
        let builder = LayerBuilder::new(cache, backend, config.build_retry.clone());
        Ok(Self::new(builder, config))
    }

    pub fn builder(&self) -> &LayerBuilder {
        &self.builder
    }

    /// Evaluate one request under its overall timeout.
    pub async fn evaluate(&self, request: &EvaluationRequest) -> Verdict {
        self.evaluate_until(request, std::future::pending::<()>())
            .await
    }

    /// Like [`Evaluator::evaluate`], but gives up as soon as `cancel`
    /// completes, destroying any context the request holds.
    pub async fn evaluate_until<C>(&self, request: &EvaluationRequest, cancel: C) -> Verdict
    where
        C: Future<Output = ()>,
    {
        let span = obs::request_span(&request.instance_id);
        let tracker = StageTracker::default();
        let budget = request.timeout_budget.unwrap_or(self.overall_timeout);

        let verdict = async {
            obs::emit_request_started(
                &request.instance_id,
                &request.repo,
                request.fail_to_pass.len() + request.pass_to_pass.len(),
            );
            // A budget too large to represent as an instant means no deadline.
            let deadline = Instant::now().checked_add(budget);
            tokio::select! {
                outcome = tokio::time::timeout(budget, self.run(request, &tracker, deadline)) => {
                    match outcome {
                        Ok(verdict) => verdict,
                        Err(_) => VerdictEngine::execution_error(
                            request,
                            format!(
                                "overall timeout of {}s exceeded {}",
                                budget.as_secs(),
                                tracker.describe()
                            ),
                        ),
                    }
                }
                _ = cancel => VerdictEngine::execution_error(
                    request,
                    format!("evaluation cancelled {}", tracker.describe()),
                ),
            }
        }
        .instrument(span.clone())
        .await;

        span.in_scope(|| finish(&verdict));
        verdict
    }

    async fn run(
        &self,
        request: &EvaluationRequest,
        tracker: &StageTracker,
        deadline: Option<Instant>,
    ) -> Verdict {
        let problems = VerdictEngine::check_structure(request);
        if !problems.is_empty() {
            return VerdictEngine::structural_error(request, problems);
        }
        tracker.advance(Stage::Validated);

        let environment = match self
            .builder
            .environment(&request.repository, &request.recipe)
            .await
        {
            Ok(environment) => environment,
            Err(err) => {
                return VerdictEngine::execution_error(
                    request,
                    format!("environment build failed: {}", err),
                )
            }
        };
        tracker.advance(Stage::Built);

        let patched = match self
            .applier
            .apply(Arc::clone(&environment), &request.patch)
            .await
        {
            Ok(ctx) => ctx,
            Err(err) => {
                return VerdictEngine::execution_error(
                    request,
                    format!("patch did not apply: {}", err),
                )
            }
        };
        tracker.advance(Stage::Applied);

        let baseline_ctx = if request.fail_to_pass.is_empty() {
            None
        } else {
            match ExecutionContext::instantiate(Arc::clone(self.builder.backend()), environment)
                .await
            {
                Ok(ctx) => Some(ctx),
                Err(err) => {
                    return VerdictEngine::execution_error(
                        request,
                        format!("failed to create baseline context: {}", err),
                    )
                }
            }
        };

        let mut runner = TestRunner::new(self.per_test_timeout);
        if let Some(deadline) = deadline {
            runner = runner.with_deadline(deadline);
        }
        let command = &request.recipe.test_command;
        let all_tests = request.all_tests();
        let baseline_run = async {
            match baseline_ctx {
                Some(ctx) => runner.run(ctx, command, &request.fail_to_pass).await,
                None => BTreeMap::new(),
            }
        };
        let post_run = runner.run(patched, command, &all_tests);
        let (baseline, post) = tokio::join!(baseline_run, post_run);
        tracker.advance(Stage::Executed);

        let verdict = VerdictEngine::decide(request, &baseline, &post);
        tracker.advance(Stage::Decided);
        verdict
    }

    /// Evaluate many requests with up to `max_workers` in flight.
    ///
    /// Verdicts come back in input order, one per request. With
    /// `continue_on_error` off, requests not yet started once a non-VALID
    /// verdict appears are reported as not evaluated.
    pub async fn evaluate_batch(&self, requests: Vec<EvaluationRequest>) -> Vec<Verdict> {
        self.evaluate_batch_until(requests, std::future::pending::<()>())
            .await
    }

    /// Like [`Evaluator::evaluate_batch`], but once `cancel` completes every
    /// request still running or not yet started gets EXECUTION_ERROR.
    pub async fn evaluate_batch_until<C>(
        &self,
        requests: Vec<EvaluationRequest>,
        cancel: C,
    ) -> Vec<Verdict>
    where
        C: Future<Output = ()>,
    {
        let cancel = cancel.shared();
        let cancel = &cancel;
        let halted = AtomicBool::new(false);
        let halted = &halted;

        let mut indexed: Vec<(usize, Verdict)> = stream::iter(requests.into_iter().enumerate())
            .map(|(idx, request)| async move {
                if cancel.peek().is_some() {
                    let verdict = VerdictEngine::execution_error(
                        &request,
                        "not evaluated: batch cancelled before this record started",
                    );
                    finish(&verdict);
                    return (idx, verdict);
                }
                if halted.load(Ordering::SeqCst) {
                    let verdict = VerdictEngine::not_evaluated(&request);
                    finish(&verdict);
                    return (idx, verdict);
                }
                let verdict = self.evaluate_until(&request, cancel.clone()).await;
                if !self.continue_on_error && !verdict.is_valid() {
                    halted.store(true, Ordering::SeqCst);
                }
                (idx, verdict)
            })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, verdict)| verdict).collect()
    }
}

fn finish(verdict: &Verdict) {
    METRICS.inc_verdict(verdict.result);
    obs::emit_verdict(&verdict.request_id, verdict.result, verdict.diagnostics.len());
}
