//! Global atomic counters for patchcheck.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a batch).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::verdict::VerdictResult;

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    builds_started: AtomicU64,
    builds_failed: AtomicU64,
    contexts_created: AtomicU64,
    contexts_destroyed: AtomicU64,
    tests_executed: AtomicU64,
    verdicts_valid: AtomicU64,
    verdicts_invalid: AtomicU64,
    verdicts_structural: AtomicU64,
    verdicts_execution: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, name: &'static str) {
    counter.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(metric = name, "counter incremented");
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            builds_started: AtomicU64::new(0),
            builds_failed: AtomicU64::new(0),
            contexts_created: AtomicU64::new(0),
            contexts_destroyed: AtomicU64::new(0),
            tests_executed: AtomicU64::new(0),
            verdicts_valid: AtomicU64::new(0),
            verdicts_invalid: AtomicU64::new(0),
            verdicts_structural: AtomicU64::new(0),
            verdicts_execution: AtomicU64::new(0),
        }
    }

    pub fn inc_cache_hits(&self) {
        bump(&self.cache_hits, "cache_hits");
    }

    pub fn inc_cache_misses(&self) {
        bump(&self.cache_misses, "cache_misses");
    }

    pub fn inc_builds_started(&self) {
        bump(&self.builds_started, "builds_started");
    }

    pub fn inc_builds_failed(&self) {
        bump(&self.builds_failed, "builds_failed");
    }

    pub fn inc_contexts_created(&self) {
        bump(&self.contexts_created, "contexts_created");
    }

    pub fn inc_contexts_destroyed(&self) {
        bump(&self.contexts_destroyed, "contexts_destroyed");
    }

    pub fn inc_tests_executed(&self) {
        bump(&self.tests_executed, "tests_executed");
    }

    /// Count one terminal verdict under its result.
    pub fn inc_verdict(&self, result: VerdictResult) {
        match result {
            VerdictResult::Valid => bump(&self.verdicts_valid, "verdicts_valid"),
            VerdictResult::Invalid => bump(&self.verdicts_invalid, "verdicts_invalid"),
            VerdictResult::StructuralError => {
                bump(&self.verdicts_structural, "verdicts_structural")
            }
            VerdictResult::ExecutionError => bump(&self.verdicts_execution, "verdicts_execution"),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a batch) rather than on
    /// every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cache_hits = self.cache_hits(),
            cache_misses = self.cache_misses(),
            builds_started = self.builds_started(),
            builds_failed = self.builds_failed(),
            contexts_created = self.contexts_created(),
            contexts_destroyed = self.contexts_destroyed(),
            tests_executed = self.tests_executed(),
            verdicts_valid = self.verdicts(VerdictResult::Valid),
            verdicts_invalid = self.verdicts(VerdictResult::Invalid),
            verdicts_structural = self.verdicts(VerdictResult::StructuralError),
            verdicts_execution = self.verdicts(VerdictResult::ExecutionError),
        );
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    pub fn builds_started(&self) -> u64 {
        self.builds_started.load(Ordering::Relaxed)
    }

    pub fn builds_failed(&self) -> u64 {
        self.builds_failed.load(Ordering::Relaxed)
    }

    pub fn contexts_created(&self) -> u64 {
        self.contexts_created.load(Ordering::Relaxed)
    }

    pub fn contexts_destroyed(&self) -> u64 {
        self.contexts_destroyed.load(Ordering::Relaxed)
    }

    pub fn tests_executed(&self) -> u64 {
        self.tests_executed.load(Ordering::Relaxed)
    }

    /// Read the number of verdicts recorded with `result`.
    pub fn verdicts(&self, result: VerdictResult) -> u64 {
        let counter = match result {
            VerdictResult::Valid => &self.verdicts_valid,
            VerdictResult::Invalid => &self.verdicts_invalid,
            VerdictResult::StructuralError => &self.verdicts_structural,
            VerdictResult::ExecutionError => &self.verdicts_execution,
        };
        counter.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.cache_hits,
            &self.cache_misses,
            &self.builds_started,
            &self.builds_failed,
            &self.contexts_created,
            &self.contexts_destroyed,
            &self.tests_executed,
            &self.verdicts_valid,
            &self.verdicts_invalid,
            &self.verdicts_structural,
            &self.verdicts_execution,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        assert_eq!(m.cache_hits(), 0);
        m.inc_cache_hits();
        m.inc_cache_hits();
        assert_eq!(m.cache_hits(), 2);

        m.inc_builds_started();
        m.inc_builds_failed();
        assert_eq!(m.builds_started(), 1);
        assert_eq!(m.builds_failed(), 1);

        m.inc_contexts_created();
        m.inc_contexts_destroyed();
        m.inc_tests_executed();
        assert_eq!(m.contexts_created(), m.contexts_destroyed());
        assert_eq!(m.tests_executed(), 1);
    }

    #[test]
    fn verdicts_are_counted_per_result() {
        let m = Metrics::new();
        m.inc_verdict(VerdictResult::Valid);
        m.inc_verdict(VerdictResult::ExecutionError);
        m.inc_verdict(VerdictResult::ExecutionError);
        assert_eq!(m.verdicts(VerdictResult::Valid), 1);
        assert_eq!(m.verdicts(VerdictResult::Invalid), 0);
        assert_eq!(m.verdicts(VerdictResult::ExecutionError), 2);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_cache_misses();
        m.inc_contexts_created();
        m.inc_verdict(VerdictResult::Invalid);
        m.reset();
        assert_eq!(m.cache_misses(), 0);
        assert_eq!(m.contexts_created(), 0);
        assert_eq!(m.verdicts(VerdictResult::Invalid), 0);
    }
}
