//! Recipes: how to build an environment and how to run one test in it.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use env_fingerprint::{fingerprint_recipe, Fingerprint};
use serde::{Deserialize, Serialize};

use super::error::BuildError;
use crate::config::ConfigError;

/// Placeholder substituted with the test id in a [`TestCommand`].
pub const TEST_PLACEHOLDER: &str = "{test}";

/// Identity of the foundation layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct FoundationSpec {
    /// Operating system, as in `std::env::consts::OS`.
    pub os: String,
    /// Language runtime executable, probed with `--version`.
    pub runtime: String,
    /// Extra tools that must be present.
    pub tooling: Vec<String>,
}

impl Default for FoundationSpec {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            runtime: "python3".to_string(),
            tooling: vec!["git".to_string()],
        }
    }
}

/// How one test id is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCommand {
    /// Argument vector; `{test}` is replaced with the test id.
    pub argv: Vec<String>,
    /// Exit codes meaning "the test ran and failed".
    #[serde(default = "default_fail_exit_codes")]
    pub fail_exit_codes: Vec<i32>,
}

fn default_fail_exit_codes() -> Vec<i32> {
    vec![1]
}

impl Default for TestCommand {
    fn default() -> Self {
        Self::pytest()
    }
}

impl TestCommand {
    /// pytest: exit 1 means tests failed, anything else non-zero is an error.
    pub fn pytest() -> Self {
        Self {
            argv: ["python", "-m", "pytest", "-rA", "-p", "no:cacheprovider", TEST_PLACEHOLDER]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fail_exit_codes: vec![1],
        }
    }

    pub fn custom(argv: Vec<String>, fail_exit_codes: Vec<i32>) -> Self {
        Self {
            argv,
            fail_exit_codes,
        }
    }

    /// Argument vector for one test id.
    ///
    /// Without a placeholder the id is appended as the last argument.
    pub fn render(&self, test_id: &str) -> Vec<String> {
        let mut substituted = false;
        let mut argv: Vec<String> = self
            .argv
            .iter()
            .map(|arg| {
                if arg.contains(TEST_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(TEST_PLACEHOLDER, test_id)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            argv.push(test_id.to_string());
        }
        argv
    }

    pub fn is_failure_code(&self, code: i32) -> bool {
        self.fail_exit_codes.contains(&code)
    }
}

/// Install recipe for a repository's environment layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentRecipe {
    pub foundation: FoundationSpec,
    /// Commands run in order inside the checked-out tree.
    pub install: Vec<Vec<String>>,
    pub test_command: TestCommand,
    /// Timeout for each clone or install step.
    pub step_timeout_secs: u64,
}

impl Default for EnvironmentRecipe {
    fn default() -> Self {
        let argv = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            foundation: FoundationSpec::default(),
            install: vec![
                argv(&["python3", "-m", "venv", ".venv"]),
                argv(&["python", "-m", "pip", "install", "-e", "."]),
                argv(&["python", "-m", "pip", "install", "pytest"]),
            ],
            test_command: TestCommand::pytest(),
            step_timeout_secs: 1200,
        }
    }
}

#[derive(Serialize)]
struct FingerprintedFields<'a> {
    foundation: &'a FoundationSpec,
    install: &'a [Vec<String>],
    test_command: &'a TestCommand,
}

impl EnvironmentRecipe {
    /// Dependency fingerprint: foundation, install steps and test command.
    ///
    /// The step timeout is excluded since it does not change what gets built.
    pub fn fingerprint(&self) -> Result<Fingerprint, BuildError> {
        let fields = FingerprintedFields {
            foundation: &self.foundation,
            install: &self.install,
            test_command: &self.test_command,
        };
        Ok(fingerprint_recipe(&fields)?)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Reject recipes that cannot possibly run.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.test_command.argv.is_empty() {
            return Err(BuildError::InvalidRecipe("test command is empty".into()));
        }
        if let Some(idx) = self.install.iter().position(|step| step.is_empty()) {
            return Err(BuildError::InvalidRecipe(format!(
                "install step {} is empty",
                idx
            )));
        }
        if self.step_timeout_secs == 0 {
            return Err(BuildError::InvalidRecipe(
                "step_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Default recipe plus per-repository overrides, loaded from TOML.
///
/// ```toml
/// [default]
/// install = [["python", "-m", "pip", "install", "-e", "."]]
///
/// [repos."psf/requests"]
/// install = [["python", "-m", "pip", "install", "-e", ".[socks]"]]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecipeBook {
    pub default: EnvironmentRecipe,
    pub repos: BTreeMap<String, EnvironmentRecipe>,
}

impl RecipeBook {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let book: RecipeBook =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        book.validate()?;
        Ok(book)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Recipe for an `org/name` slug, falling back to the default.
    pub fn recipe_for(&self, repo: &str) -> &EnvironmentRecipe {
        self.repos.get(repo).unwrap_or(&self.default)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.default
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("[default]: {}", e)))?;
        for (repo, recipe) in &self.repos {
            recipe
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("[repos.\"{}\"]: {}", repo, e)))?;
        }
        Ok(())
    }
}
