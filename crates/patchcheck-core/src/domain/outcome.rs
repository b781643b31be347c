use serde::{Deserialize, Serialize};
use std::fmt;

/// Result status of one test invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Timeout,
    Skipped,
}

impl TestStatus {
    /// Statuses that say nothing about the code under test.
    pub fn is_inconclusive(self) -> bool {
        matches!(self, TestStatus::Error | TestStatus::Timeout | TestStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Error => "ERROR",
            TestStatus::Timeout => "TIMEOUT",
            TestStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single test id within one run. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub status: TestStatus,
    pub duration_ms: u64,
    /// Last few KiB of combined stdout/stderr.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_tail: String,
}

impl TestOutcome {
    pub fn new(
        test_id: impl Into<String>,
        status: TestStatus,
        duration_ms: u64,
        output_tail: impl Into<String>,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            status,
            duration_ms,
            output_tail: output_tail.into(),
        }
    }

    /// A test that was never started.
    pub fn skipped(test_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(test_id, TestStatus::Skipped, 0, reason)
    }
}
