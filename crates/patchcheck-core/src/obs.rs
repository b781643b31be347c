//! Structured observability hooks for the evaluation lifecycle.
//!
//! This module provides:
//! - Request-scoped tracing spans via [`request_span`]
//! - Emission functions for cache, build, context, patch and verdict events
//!
//! Events are emitted at `info!` level (failures at `warn!`), filterable
//! via `PATCHCHECK_LOG`.

use tracing::{info, warn};

use crate::cas::Digest;
use crate::domain::TestStatus;
use crate::layer::BuildError;
use crate::patch::ApplyError;
use crate::verdict::VerdictResult;

/// Span tagging everything one request does with its instance id.
///
/// Attach it to the request future with `tracing::Instrument::instrument`
/// so it follows the task across await points.
pub fn request_span(instance_id: &str) -> tracing::Span {
    tracing::info_span!("patchcheck.request", instance_id = %instance_id)
}

pub fn emit_request_started(instance_id: &str, repo: &str, tests: usize) {
    info!(event = "request.started", instance_id = %instance_id, repo = %repo, tests = tests);
}

pub fn emit_cache_hit(key: &str) {
    info!(event = "cache.hit", key = %key);
}

pub fn emit_cache_miss(key: &str) {
    info!(event = "cache.miss", key = %key);
}

pub fn emit_cache_evicted(key: &str) {
    info!(event = "cache.evicted", key = %key);
}

/// `reuse_candidate` is true when a prior artifact is offered to the build.
pub fn emit_build_started(key: &str, reuse_candidate: bool) {
    info!(event = "build.started", key = %key, reuse_candidate = reuse_candidate);
}

pub fn emit_build_finished(key: &str, content_hash: &Digest, duration_ms: u64) {
    info!(
        event = "build.finished",
        key = %key,
        content_hash = %content_hash.short(),
        duration_ms = duration_ms,
    );
}

pub fn emit_build_failed(key: &str, error: &BuildError, duration_ms: u64) {
    warn!(event = "build.failed", key = %key, error = %error, duration_ms = duration_ms);
}

pub fn emit_context_created(context: &str, environment: &str) {
    info!(event = "context.created", context = %context, environment = %environment);
}

pub fn emit_context_destroyed(context: &str) {
    info!(event = "context.destroyed", context = %context);
}

pub fn emit_patch_applied(context: &str, patch: &Digest, files: usize) {
    info!(event = "patch.applied", context = %context, patch = %patch.short(), files = files);
}

pub fn emit_patch_rejected(patch: &Digest, error: &ApplyError) {
    warn!(event = "patch.rejected", patch = %patch.short(), error = %error);
}

pub fn emit_test_finished(test_id: &str, status: TestStatus, duration_ms: u64) {
    info!(
        event = "test.finished",
        test_id = %test_id,
        status = %status,
        duration_ms = duration_ms,
    );
}

pub fn emit_verdict(instance_id: &str, result: VerdictResult, diagnostics: usize) {
    info!(
        event = "verdict.decided",
        instance_id = %instance_id,
        result = %result,
        diagnostics = diagnostics,
    );
}

pub fn emit_batch_finished(run_id: &str, records: usize, valid: usize, duration_ms: u64) {
    info!(
        event = "batch.finished",
        run_id = %run_id,
        records = records,
        valid = valid,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_span_carries_instance_id() {
        let span = request_span("org__repo-1");
        let _entered = span.enter();
        emit_request_started("org__repo-1", "org/repo", 3);
        emit_verdict("org__repo-1", VerdictResult::Valid, 0);
    }
}
