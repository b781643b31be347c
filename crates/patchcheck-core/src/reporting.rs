use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::domain::{OutputRecord, TestOutcome};
use crate::verdict::{Verdict, VerdictResult};

pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// Per-result counts for one batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub valid: usize,
    pub invalid: usize,
    pub structural_error: usize,
    pub execution_error: usize,
}

impl BatchSummary {
    pub fn from_verdicts(verdicts: &[Verdict]) -> Self {
        let mut summary = Self {
            total: verdicts.len(),
            ..Self::default()
        };
        for verdict in verdicts {
            match verdict.result {
                VerdictResult::Valid => summary.valid += 1,
                VerdictResult::Invalid => summary.invalid += 1,
                VerdictResult::StructuralError => summary.structural_error += 1,
                VerdictResult::ExecutionError => summary.execution_error += 1,
            }
        }
        summary
    }
}

/// Canonical batch report written as `report.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub schema_version: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: BatchSummary,
    pub records: Vec<OutputRecord>,
}

impl BatchReport {
    pub fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        verdicts: &[Verdict],
    ) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            run_id,
            started_at,
            finished_at,
            summary: BatchSummary::from_verdicts(verdicts),
            records: verdicts.iter().map(OutputRecord::from).collect(),
        }
    }

    pub fn all_valid(&self) -> bool {
        self.summary.valid == self.summary.total
    }

    /// 0 iff every record is VALID, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.all_valid() {
            0
        } else {
            1
        }
    }
}

/// Directory name for an instance id; path separators are replaced.
pub fn instance_dir_name(instance_id: &str) -> String {
    let cleaned: String = instance_id
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "unknown".to_string(),
        _ => cleaned,
    }
}

/// Write `verdict.json` (the output record) in pretty JSON format.
pub fn write_verdict_json(path: &Path, verdict: &Verdict) -> Result<()> {
    let record = OutputRecord::from(verdict);
    let content = serde_json::to_string_pretty(&record).context("serialize verdict")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Render captured output of every test run for one verdict.
pub fn render_test_output_log(verdict: &Verdict) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {} {}\n", verdict.request_id, verdict.result));
    for line in &verdict.diagnostics {
        out.push_str(&format!("# {}\n", line.replace('\n', "\n# ")));
    }
    let sections: [(&str, &BTreeMap<String, TestOutcome>); 3] = [
        ("baseline", &verdict.baseline),
        ("FAIL_TO_PASS", &verdict.fail_to_pass),
        ("PASS_TO_PASS", &verdict.pass_to_pass),
    ];
    for (label, outcomes) in sections {
        for outcome in outcomes.values() {
            out.push_str(&format!(
                "\n=== {} {}: {} ({} ms) ===\n",
                label, outcome.test_id, outcome.status, outcome.duration_ms
            ));
            out.push_str(&outcome.output_tail);
            if !outcome.output_tail.ends_with('\n') {
                out.push('\n');
            }
        }
    }
    out
}

/// Write `<log_dir>/<run_id>/<instance>/{verdict.json,test_output.log}` for
/// every verdict. Returns the run directory.
pub fn write_run_logs(log_dir: &Path, run_id: &Uuid, verdicts: &[Verdict]) -> Result<PathBuf> {
    let run_dir = log_dir.join(run_id.to_string());
    for verdict in verdicts {
        let dir = run_dir.join(instance_dir_name(&verdict.request_id));
        std::fs::create_dir_all(&dir).with_context(|| format!("create {:?}", dir))?;
        write_verdict_json(&dir.join("verdict.json"), verdict)?;
        let log_path = dir.join("test_output.log");
        std::fs::write(&log_path, render_test_output_log(verdict))
            .with_context(|| format!("write {:?}", log_path))?;
    }
    std::fs::create_dir_all(&run_dir).with_context(|| format!("create {:?}", run_dir))?;
    Ok(run_dir)
}

/// Write report.json in pretty JSON format.
pub fn write_report_json(path: &Path, report: &BatchReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize batch report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}
