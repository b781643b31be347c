//! Verdict engine: one terminal classification per request.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{EvaluationRequest, TestOutcome, TestStatus};
use crate::layer::error::tail_chars;

/// Characters of test output quoted in a diagnostic.
pub const DIAGNOSTIC_OUTPUT_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictResult {
    Valid,
    Invalid,
    StructuralError,
    ExecutionError,
}

impl VerdictResult {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictResult::Valid => "VALID",
            VerdictResult::Invalid => "INVALID",
            VerdictResult::StructuralError => "STRUCTURAL_ERROR",
            VerdictResult::ExecutionError => "EXECUTION_ERROR",
        }
    }
}

impl fmt::Display for VerdictResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal, immutable outcome of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub request_id: String,
    pub result: VerdictResult,
    /// Post-patch outcomes of the FAIL_TO_PASS set.
    pub fail_to_pass: BTreeMap<String, TestOutcome>,
    /// Post-patch outcomes of the PASS_TO_PASS set.
    pub pass_to_pass: BTreeMap<String, TestOutcome>,
    /// Pre-patch outcomes of the FAIL_TO_PASS set.
    #[serde(default)]
    pub baseline: BTreeMap<String, TestOutcome>,
    pub diagnostics: Vec<String>,
}

impl Verdict {
    fn bare(request_id: impl Into<String>, result: VerdictResult, diagnostics: Vec<String>) -> Self {
        Self {
            request_id: request_id.into(),
            result,
            fail_to_pass: BTreeMap::new(),
            pass_to_pass: BTreeMap::new(),
            baseline: BTreeMap::new(),
            diagnostics,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.result == VerdictResult::Valid
    }
}

/// Stateless decision rules.
pub struct VerdictEngine;

impl VerdictEngine {
    /// Shape problems that make a request unevaluable. Empty when fine.
    pub fn check_structure(request: &EvaluationRequest) -> Vec<String> {
        fn blank(s: &str) -> bool {
            s.trim().is_empty()
        }

        let mut problems = Vec::new();

        if blank(&request.instance_id) {
            problems.push("instance_id is empty".to_string());
        }
        if blank(&request.repo) {
            problems.push("repo is empty".to_string());
        }
        if blank(&request.repository.revision) {
            problems.push("base_commit is empty".to_string());
        }
        if blank(&request.patch) {
            problems.push("patch is empty".to_string());
        }
        if request.fail_to_pass.iter().any(|t| blank(t)) {
            problems.push("FAIL_TO_PASS contains a blank test id".to_string());
        }
        if request.pass_to_pass.iter().any(|t| blank(t)) {
            problems.push("PASS_TO_PASS contains a blank test id".to_string());
        }
        for shared in request.fail_to_pass.intersection(&request.pass_to_pass) {
            problems.push(format!(
                "test id '{}' appears in both FAIL_TO_PASS and PASS_TO_PASS",
                shared
            ));
        }
        problems
    }

    pub fn structural_error(request: &EvaluationRequest, problems: Vec<String>) -> Verdict {
        let mut diagnostics = problems;
        diagnostics.extend(warnings(request));
        Verdict::bare(&request.instance_id, VerdictResult::StructuralError, diagnostics)
    }

    /// Verdict for an input file that could not be loaded as a record.
    pub fn unloadable(request_id: impl Into<String>, reason: impl Into<String>) -> Verdict {
        Verdict::bare(request_id, VerdictResult::StructuralError, vec![reason.into()])
    }

    /// Build, apply, or runner failure before a conclusive comparison.
    pub fn execution_error(request: &EvaluationRequest, reason: impl Into<String>) -> Verdict {
        let mut diagnostics = vec![reason.into()];
        diagnostics.extend(warnings(request));
        Verdict::bare(&request.instance_id, VerdictResult::ExecutionError, diagnostics)
    }

    /// A request skipped because the batch halted first.
    pub fn not_evaluated(request: &EvaluationRequest) -> Verdict {
        Self::execution_error(
            request,
            "not evaluated: batch halted after an earlier non-VALID verdict",
        )
    }

    /// Compare baseline and post-patch outcomes.
    pub fn decide(
        request: &EvaluationRequest,
        baseline: &BTreeMap<String, TestOutcome>,
        post: &BTreeMap<String, TestOutcome>,
    ) -> Verdict {
        let pick = |ids: &BTreeSet<String>, from: &BTreeMap<String, TestOutcome>| {
            ids.iter()
                .map(|id| {
                    let outcome = from
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| TestOutcome::skipped(id, "no outcome recorded"));
                    (id.clone(), outcome)
                })
                .collect::<BTreeMap<_, _>>()
        };
        let fail_to_pass = pick(&request.fail_to_pass, post);
        let pass_to_pass = pick(&request.pass_to_pass, post);
        let before = pick(&request.fail_to_pass, baseline);

        let mut inconclusive = Vec::new();
        for (id, outcome) in &before {
            if matches!(outcome.status, TestStatus::Timeout | TestStatus::Skipped) {
                inconclusive.push(format!(
                    "FAIL_TO_PASS test '{}' was inconclusive before the patch. Status: {}",
                    id, outcome.status
                ));
            }
        }
        for (label, outcomes) in [("FAIL_TO_PASS", &fail_to_pass), ("PASS_TO_PASS", &pass_to_pass)] {
            for (id, outcome) in outcomes {
                if outcome.status.is_inconclusive() {
                    inconclusive.push(with_output(
                        format!(
                            "{} test '{}' was inconclusive after the patch. Status: {}",
                            label, id, outcome.status
                        ),
                        outcome,
                    ));
                }
            }
        }

        let (result, mut diagnostics) = if !inconclusive.is_empty() {
            (VerdictResult::ExecutionError, inconclusive)
        } else {
            let mut failures = Vec::new();
            for (id, outcome) in &before {
                if outcome.status == TestStatus::Pass {
                    failures.push(format!(
                        "FAIL_TO_PASS test '{}' already passed before the patch",
                        id
                    ));
                }
            }
            for (id, outcome) in &fail_to_pass {
                if outcome.status != TestStatus::Pass {
                    failures.push(with_output(
                        format!(
                            "FAIL_TO_PASS test '{}' did not pass. Status: {}",
                            id, outcome.status
                        ),
                        outcome,
                    ));
                }
            }
            for (id, outcome) in &pass_to_pass {
                if outcome.status != TestStatus::Pass {
                    failures.push(with_output(
                        format!(
                            "PASS_TO_PASS test '{}' failed after patch. Status: {}",
                            id, outcome.status
                        ),
                        outcome,
                    ));
                }
            }
            if failures.is_empty() {
                (VerdictResult::Valid, failures)
            } else {
                (VerdictResult::Invalid, failures)
            }
        };
        diagnostics.extend(warnings(request));

        Verdict {
            request_id: request.instance_id.clone(),
            result,
            fail_to_pass,
            pass_to_pass,
            baseline: before,
            diagnostics,
        }
    }
}

fn with_output(message: String, outcome: &TestOutcome) -> String {
    let tail = outcome.output_tail.trim_end();
    if tail.is_empty() {
        message
    } else {
        format!("{}\nOutput: {}", message, tail_chars(tail, DIAGNOSTIC_OUTPUT_CHARS))
    }
}

/// Input-shape warnings; they never change the result.
fn warnings(request: &EvaluationRequest) -> Vec<String> {
    let mut out = Vec::new();
    if request.fail_to_pass.is_empty() {
        out.push("warning: FAIL_TO_PASS is empty".to_string());
    }
    if request.pass_to_pass.is_empty() {
        out.push("warning: PASS_TO_PASS is empty".to_string());
    }
    out.extend(request.warnings.iter().map(|w| format!("warning: {}", w)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RepositoryRef;
    use crate::layer::EnvironmentRecipe;

    fn request(f2p: &[&str], p2p: &[&str]) -> EvaluationRequest {
        EvaluationRequest {
            instance_id: "org__proj-1".into(),
            repo: "org/proj".into(),
            repository: RepositoryRef::new("mem://proj", "c1"),
            patch: "--- a/x\n+++ b/x\n".into(),
            fail_to_pass: f2p.iter().map(|s| s.to_string()).collect(),
            pass_to_pass: p2p.iter().map(|s| s.to_string()).collect(),
            timeout_budget: None,
            recipe: EnvironmentRecipe::default(),
            warnings: Vec::new(),
        }
    }

    fn outcomes(list: &[(&str, TestStatus)]) -> BTreeMap<String, TestOutcome> {
        list.iter()
            .map(|(id, s)| (id.to_string(), TestOutcome::new(*id, *s, 1, "")))
            .collect()
    }

    #[test]
    fn genuine_fix_is_valid() {
        let req = request(&["test_A"], &["test_B"]);
        let verdict = VerdictEngine::decide(
            &req,
            &outcomes(&[("test_A", TestStatus::Fail)]),
            &outcomes(&[("test_A", TestStatus::Pass), ("test_B", TestStatus::Pass)]),
        );
        assert_eq!(verdict.result, VerdictResult::Valid);
        assert!(verdict.diagnostics.is_empty());
        assert_eq!(verdict.baseline["test_A"].status, TestStatus::Fail);
    }

    #[test]
    fn baseline_error_counts_as_failing() {
        let req = request(&["test_A"], &["test_B"]);
        let verdict = VerdictEngine::decide(
            &req,
            &outcomes(&[("test_A", TestStatus::Error)]),
            &outcomes(&[("test_A", TestStatus::Pass), ("test_B", TestStatus::Pass)]),
        );
        assert!(verdict.is_valid());
    }

    #[test]
    fn regression_is_invalid_and_named() {
        let req = request(&["test_A"], &["test_B"]);
        let mut post = outcomes(&[("test_A", TestStatus::Pass)]);
        post.insert(
            "test_B".into(),
            TestOutcome::new("test_B", TestStatus::Fail, 2, "AssertionError: 1 != 2\n"),
        );
        let verdict =
            VerdictEngine::decide(&req, &outcomes(&[("test_A", TestStatus::Fail)]), &post);
        assert_eq!(verdict.result, VerdictResult::Invalid);
        assert_eq!(verdict.diagnostics.len(), 1);
        assert!(verdict.diagnostics[0]
            .starts_with("PASS_TO_PASS test 'test_B' failed after patch. Status: FAIL"));
        assert!(verdict.diagnostics[0].contains("AssertionError"));
    }

    #[test]
    fn already_passing_baseline_is_invalid() {
        let req = request(&["test_A"], &[]);
        let verdict = VerdictEngine::decide(
            &req,
            &outcomes(&[("test_A", TestStatus::Pass)]),
            &outcomes(&[("test_A", TestStatus::Pass)]),
        );
        assert_eq!(verdict.result, VerdictResult::Invalid);
        assert_eq!(
            verdict.diagnostics[0],
            "FAIL_TO_PASS test 'test_A' already passed before the patch"
        );
        assert_eq!(verdict.diagnostics[1], "warning: PASS_TO_PASS is empty");
    }

    #[test]
    fn inconclusive_outcomes_are_execution_errors() {
        let req = request(&["test_A"], &["test_B"]);
        let verdict = VerdictEngine::decide(
            &req,
            &outcomes(&[("test_A", TestStatus::Fail)]),
            &outcomes(&[("test_A", TestStatus::Pass), ("test_B", TestStatus::Timeout)]),
        );
        assert_eq!(verdict.result, VerdictResult::ExecutionError);
        assert!(verdict.diagnostics[0].contains("'test_B'"));

        // Missing post outcome.
        let verdict = VerdictEngine::decide(
            &req,
            &outcomes(&[("test_A", TestStatus::Fail)]),
            &outcomes(&[("test_A", TestStatus::Pass)]),
        );
        assert_eq!(verdict.result, VerdictResult::ExecutionError);
        assert_eq!(verdict.pass_to_pass["test_B"].status, TestStatus::Skipped);

        // Baseline timeout.
        let verdict = VerdictEngine::decide(
            &req,
            &outcomes(&[("test_A", TestStatus::Timeout)]),
            &outcomes(&[("test_A", TestStatus::Pass), ("test_B", TestStatus::Pass)]),
        );
        assert_eq!(verdict.result, VerdictResult::ExecutionError);
    }

    #[test]
    fn empty_sets_are_valid_with_warnings() {
        let mut req = request(&[], &[]);
        req.warnings.push("duplicate FAIL_TO_PASS test id 'x'".into());
        let verdict = VerdictEngine::decide(&req, &BTreeMap::new(), &BTreeMap::new());
        assert_eq!(verdict.result, VerdictResult::Valid);
        assert_eq!(
            verdict.diagnostics,
            vec![
                "warning: FAIL_TO_PASS is empty",
                "warning: PASS_TO_PASS is empty",
                "warning: duplicate FAIL_TO_PASS test id 'x'",
            ]
        );
    }

    #[test]
    fn structure_checks() {
        let req = request(&["t1"], &["t2"]);
        assert!(VerdictEngine::check_structure(&req).is_empty());

        let shared = request(&["t1"], &["t1"]);
        let problems = VerdictEngine::check_structure(&shared);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("'t1'"));

        let mut blank = request(&[" "], &[]);
        blank.patch = "\n".into();
        blank.repository.revision = String::new();
        let problems = VerdictEngine::check_structure(&blank);
        assert_eq!(problems.len(), 3);

        let verdict = VerdictEngine::structural_error(&blank, problems);
        assert_eq!(verdict.result, VerdictResult::StructuralError);
        assert!(verdict
            .diagnostics
            .iter()
            .any(|d| d == "warning: PASS_TO_PASS is empty"));
    }

    #[test]
    fn result_serializes_screaming_case() {
        let json = serde_json::to_string(&VerdictResult::StructuralError).unwrap();
        assert_eq!(json, "\"STRUCTURAL_ERROR\"");
    }
}
