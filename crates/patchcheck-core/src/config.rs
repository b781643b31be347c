//! Engine configuration: defaults, optional TOML file, then `PATCHCHECK_*` env.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layer::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Upper bound for either timeout setting.
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub per_test_timeout_secs: u64,
    pub overall_timeout_secs: u64,
    pub max_concurrent_builds: usize,
    pub max_workers: usize,
    /// Root of the layer store and artifact manifests.
    pub cache_root: PathBuf,
    pub log_dir: PathBuf,
    /// When false, records not yet started after a non-VALID verdict are
    /// reported as not evaluated.
    pub continue_on_error: bool,
    pub build_retry: RetryPolicy,
    /// Optional recipes file (`[default]` plus `[repos."org/name"]`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipes: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            per_test_timeout_secs: 300,
            overall_timeout_secs: 600,
            max_concurrent_builds: 2,
            max_workers: 4,
            cache_root: PathBuf::from(".patchcheck"),
            log_dir: PathBuf::from("./validation_logs"),
            continue_on_error: true,
            build_retry: RetryPolicy::default(),
            recipes: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Overlay `PATCHCHECK_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay `PATCHCHECK_*` variables read through `lookup`.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("PATCHCHECK_PER_TEST_TIMEOUT_SECS") {
            self.per_test_timeout_secs = parse_var("PATCHCHECK_PER_TEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PATCHCHECK_OVERALL_TIMEOUT_SECS") {
            self.overall_timeout_secs = parse_var("PATCHCHECK_OVERALL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PATCHCHECK_MAX_CONCURRENT_BUILDS") {
            self.max_concurrent_builds = parse_var("PATCHCHECK_MAX_CONCURRENT_BUILDS", &v)?;
        }
        if let Some(v) = lookup("PATCHCHECK_MAX_WORKERS") {
            self.max_workers = parse_var("PATCHCHECK_MAX_WORKERS", &v)?;
        }
        if let Some(v) = lookup("PATCHCHECK_CACHE_ROOT") {
            self.cache_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("PATCHCHECK_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PATCHCHECK_CONTINUE_ON_ERROR") {
            self.continue_on_error = parse_bool("PATCHCHECK_CONTINUE_ON_ERROR", &v)?;
        }
        if let Some(v) = lookup("PATCHCHECK_MAX_RETRIES") {
            self.build_retry.max_retries = parse_var("PATCHCHECK_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("PATCHCHECK_BACKOFF_BASE_MS") {
            self.build_retry.backoff_base_ms = parse_var("PATCHCHECK_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = lookup("PATCHCHECK_RECIPES") {
            self.recipes = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("per_test_timeout_secs", self.per_test_timeout_secs),
            ("overall_timeout_secs", self.overall_timeout_secs),
        ];
        for (key, value) in timeouts {
            if value > MAX_TIMEOUT_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{} must be at most {} (30 days)",
                    key, MAX_TIMEOUT_SECS
                )));
            }
        }
        let positive = [
            ("per_test_timeout_secs", self.per_test_timeout_secs as usize),
            ("overall_timeout_secs", self.overall_timeout_secs as usize),
            ("max_concurrent_builds", self.max_concurrent_builds),
            ("max_workers", self.max_workers),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", key)));
            }
        }
        if self.cache_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("cache_root must not be empty".into()));
        }
        Ok(())
    }

    pub fn per_test_timeout(&self) -> Duration {
        Duration::from_secs(self.per_test_timeout_secs)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.per_test_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.overall_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.max_concurrent_builds, 2);
        assert_eq!(cfg.max_workers, 4);
        assert!(cfg.continue_on_error);
        assert_eq!(cfg.build_retry.max_retries, 2);
        assert_eq!(cfg.build_retry.backoff_base_ms, 500);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            max_workers = 8
            log_dir = "/tmp/logs"

            [build_retry]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/logs"));
        assert_eq!(cfg.build_retry.max_retries, 5);
        assert_eq!(cfg.build_retry.backoff_base_ms, 500);
        assert_eq!(cfg.per_test_timeout_secs, 300);
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("max_workers = \"many\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_file() {
        let vars: HashMap<&str, &str> = [
            ("PATCHCHECK_MAX_WORKERS", "16"),
            ("PATCHCHECK_CONTINUE_ON_ERROR", "false"),
            ("PATCHCHECK_CACHE_ROOT", "/var/cache/pc"),
            ("PATCHCHECK_BACKOFF_BASE_MS", "10"),
        ]
        .into_iter()
        .collect();
        let mut cfg = EngineConfig::from_toml_str("max_workers = 8").unwrap();
        cfg.apply_env_from(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.max_workers, 16);
        assert!(!cfg.continue_on_error);
        assert_eq!(cfg.cache_root, PathBuf::from("/var/cache/pc"));
        assert_eq!(cfg.build_retry.backoff_base_ms, 10);
    }

    #[test]
    fn bad_env_value_names_the_key() {
        let mut cfg = EngineConfig::default();
        let err = cfg
            .apply_env_from(|k| (k == "PATCHCHECK_MAX_WORKERS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("PATCHCHECK_MAX_WORKERS"));
    }

    #[test]
    fn zero_workers_is_invalid() {
        let cfg = EngineConfig {
            max_workers: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn oversized_timeouts_are_invalid() {
        let cfg = EngineConfig {
            overall_timeout_secs: u64::MAX,
            ..EngineConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("overall_timeout_secs"));

        let mut cfg = EngineConfig::default();
        cfg.apply_env_from(|k| {
            (k == "PATCHCHECK_PER_TEST_TIMEOUT_SECS").then(|| (MAX_TIMEOUT_SECS + 1).to_string())
        })
        .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        cfg.per_test_timeout_secs = MAX_TIMEOUT_SECS;
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = EngineConfig::from_toml_file(Path::new("/nonexistent/patchcheck.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
