use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a foundation or environment build failed.
///
/// Cloneable so one failure can be handed verbatim to every resolver
/// waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum BuildError {
    #[error("step `{step}` failed with a transient error after {attempts} attempt(s): {detail}")]
    Transient {
        step: String,
        attempts: u32,
        detail: String,
    },

    #[error("dependency resolution failed in step `{step}`: {detail}")]
    DependencyResolution { step: String, detail: String },

    #[error("step `{step}` failed (exit code {exit_code:?}): {detail}")]
    StepFailed {
        step: String,
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("step `{step}` timed out after {limit_ms} ms")]
    Timeout { step: String, limit_ms: u64 },

    #[error("unsupported foundation: {0}")]
    Unsupported(String),

    #[error("invalid recipe: {0}")]
    InvalidRecipe(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("build aborted: {0}")]
    Aborted(String),
}

impl BuildError {
    /// Only transient failures are retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, BuildError::Transient { .. })
    }

    /// Classify a failed step from its exit code and stderr.
    pub fn from_step_failure(step: &str, exit_code: Option<i32>, stderr: &str) -> Self {
        let detail = tail_chars(stderr.trim(), MAX_DETAIL_CHARS);
        if transient_pattern().is_match(stderr) {
            BuildError::Transient {
                step: step.to_string(),
                attempts: 1,
                detail,
            }
        } else if dependency_pattern().is_match(stderr) {
            BuildError::DependencyResolution {
                step: step.to_string(),
                detail,
            }
        } else {
            BuildError::StepFailed {
                step: step.to_string(),
                exit_code,
                detail,
            }
        }
    }
}

impl From<std::io::Error> for BuildError {
    fn from(err: std::io::Error) -> Self {
        BuildError::Io(err.to_string())
    }
}

impl From<env_fingerprint::FingerprintError> for BuildError {
    fn from(err: env_fingerprint::FingerprintError) -> Self {
        match err {
            env_fingerprint::FingerprintError::InvalidRecipe(msg) => BuildError::InvalidRecipe(msg),
            other => BuildError::Io(other.to_string()),
        }
    }
}

const MAX_DETAIL_CHARS: usize = 2000;

fn transient_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(temporary failure in name resolution|could not resolve host|name or service not known|connection (reset|refused|timed out)|network is unreachable|tls handshake|ssl: (eof|unexpected)|read timed out|http error 5\d\d|\b5\d\d (server error|bad gateway|service unavailable|gateway time-?out)|early eof|remote end hung up)",
        )
        .expect("transient pattern is valid")
    })
}

fn dependency_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(no matching distribution found|resolutionimpossible|could not find a version that satisfies|conflicting dependencies|requires a different python)",
        )
        .expect("dependency pattern is valid")
    })
}

/// Last `max` characters of `s`, on a char boundary.
pub(crate) fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    s.chars().skip(count - max).collect()
}
