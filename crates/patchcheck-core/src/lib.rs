//! patchcheck core library
//!
//! Layered build-and-evaluate engine: resolves foundation and environment
//! layers through a deduplicating artifact cache, applies a patch to a
//! fresh execution context, runs the declared tests before and after, and
//! classifies the result.

pub mod backend;
pub mod cache;
pub mod cas;
pub mod config;
pub mod context;
pub mod domain;
pub mod evaluator;
pub mod fakes;
pub mod layer;
pub mod metrics;
pub mod obs;
pub mod patch;
pub mod reporting;
pub mod runner;
pub mod telemetry;
pub mod verdict;

pub use backend::{Backend, BackendError, ContextId, ExecOutput, ExecStatus, LocalBackend};
pub use cache::{
    Artifact, ArtifactCache, ArtifactState, BuildKey, CacheEntry, CacheError, CacheStats,
    ImageRef, LayerKind,
};
pub use cas::fs::FsCasStore;
pub use cas::{CasError, CasStore, Digest};
pub use config::{ConfigError, EngineConfig};
pub use context::ExecutionContext;
pub use domain::{
    EvaluationRequest, InputRecord, OutputRecord, RecordError, RepositoryRef, TestOutcome,
    TestStatus,
};
pub use evaluator::{Evaluator, Stage};
pub use layer::{
    BuildError, EnvironmentRecipe, FoundationSpec, LayerBuilder, RecipeBook, RetryPolicy,
    TestCommand,
};
pub use metrics::METRICS;
pub use obs::{
    emit_batch_finished, emit_build_failed, emit_build_finished, emit_build_started,
    emit_cache_evicted, emit_cache_hit, emit_cache_miss, emit_context_created,
    emit_context_destroyed, emit_patch_applied, emit_patch_rejected, emit_request_started,
    emit_test_finished, emit_verdict, request_span,
};
pub use patch::{ApplyError, PatchApplier};
pub use reporting::{BatchReport, BatchSummary};
pub use runner::TestRunner;
pub use telemetry::init_tracing;
pub use verdict::{Verdict, VerdictEngine, VerdictResult};
