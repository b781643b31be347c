use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::record::InputRecord;
use crate::layer::recipe::EnvironmentRecipe;

/// Repository location plus the exact revision to check out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Clone URL or local path.
    pub location: String,
    /// Commit identifier.
    pub revision: String,
}

impl RepositoryRef {
    pub fn new(location: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            revision: revision.into(),
        }
    }
}

/// Immutable input to one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub instance_id: String,
    /// `org/name` slug, used to pick a recipe.
    pub repo: String,
    pub repository: RepositoryRef,
    /// Unified-diff text.
    pub patch: String,
    pub fail_to_pass: BTreeSet<String>,
    pub pass_to_pass: BTreeSet<String>,
    /// Overall budget for this request; falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_budget: Option<Duration>,
    pub recipe: EnvironmentRecipe,
    /// Input-shape warnings found while building the request.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl EvaluationRequest {
    /// Build a request from a loaded input record.
    ///
    /// Duplicate ids inside either list are collapsed and reported as
    /// warnings; they do not fail the request.
    pub fn from_record(record: InputRecord, recipe: EnvironmentRecipe) -> Self {
        let mut warnings = Vec::new();
        let fail_to_pass = collect_ids("FAIL_TO_PASS", record.fail_to_pass, &mut warnings);
        let pass_to_pass = collect_ids("PASS_TO_PASS", record.pass_to_pass, &mut warnings);

        let location = record
            .repo_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| default_clone_url(&record.repo));

        Self {
            instance_id: record.instance_id,
            repository: RepositoryRef::new(location, record.base_commit),
            repo: record.repo,
            patch: record.patch,
            fail_to_pass,
            pass_to_pass,
            timeout_budget: None,
            recipe,
            warnings,
        }
    }

    /// Override the overall timeout for this request.
    pub fn with_timeout_budget(mut self, budget: Duration) -> Self {
        self.timeout_budget = Some(budget);
        self
    }

    /// Union of both declared sets.
    pub fn all_tests(&self) -> BTreeSet<String> {
        self.fail_to_pass
            .union(&self.pass_to_pass)
            .cloned()
            .collect()
    }
}

/// Default clone location for an `org/name` slug.
pub fn default_clone_url(repo: &str) -> String {
    format!("https://github.com/{}.git", repo.trim().trim_matches('/'))
}

fn collect_ids(label: &str, ids: Vec<String>, warnings: &mut Vec<String>) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    for id in ids {
        if !set.insert(id.clone()) {
            warnings.push(format!("duplicate {} test id '{}'", label, id));
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> InputRecord {
        InputRecord {
            instance_id: "org__proj-1".into(),
            repo: "org/proj".into(),
            base_commit: "abc123".into(),
            patch: "diff --git a/x b/x\n".into(),
            fail_to_pass: vec!["t::a".into(), "t::a".into()],
            pass_to_pass: vec!["t::b".into()],
            repo_url: None,
        }
    }

    #[test]
    fn default_location_is_github() {
        let req = EvaluationRequest::from_record(record(), EnvironmentRecipe::default());
        assert_eq!(req.repository.location, "https://github.com/org/proj.git");
        assert_eq!(req.repository.revision, "abc123");
    }

    #[test]
    fn repo_url_overrides_location() {
        let mut r = record();
        r.repo_url = Some("/srv/mirror/proj".into());
        let req = EvaluationRequest::from_record(r, EnvironmentRecipe::default());
        assert_eq!(req.repository.location, "/srv/mirror/proj");
    }

    #[test]
    fn duplicates_become_warnings() {
        let req = EvaluationRequest::from_record(record(), EnvironmentRecipe::default());
        assert_eq!(req.fail_to_pass.len(), 1);
        assert_eq!(req.warnings.len(), 1);
        assert!(req.warnings[0].contains("t::a"));
    }

    #[test]
    fn all_tests_is_union() {
        let req = EvaluationRequest::from_record(record(), EnvironmentRecipe::default());
        let all: Vec<_> = req.all_tests().into_iter().collect();
        assert_eq!(all, vec!["t::a", "t::b"]);
    }
}
