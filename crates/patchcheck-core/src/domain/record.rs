//! Wire formats for input and output records.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::outcome::TestStatus;
use crate::verdict::{Verdict, VerdictResult};

/// Errors loading input records.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid record JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object or an array of objects")]
    NotARecord,
}

/// One input record, as found in dataset files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub instance_id: String,
    pub repo: String,
    pub base_commit: String,
    pub patch: String,
    #[serde(rename = "FAIL_TO_PASS", deserialize_with = "string_or_array")]
    pub fail_to_pass: Vec<String>,
    #[serde(rename = "PASS_TO_PASS", deserialize_with = "string_or_array")]
    pub pass_to_pass: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
}

impl InputRecord {
    /// Parse a document holding one record or an array of records.
    pub fn parse_many(text: &str) -> Result<Vec<InputRecord>, RecordError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        match value {
            serde_json::Value::Array(items) => items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(RecordError::from))
                .collect(),
            serde_json::Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
            _ => Err(RecordError::NotARecord),
        }
    }

    /// Best-effort instance id from a record that failed to deserialize.
    pub fn salvage_instance_id(text: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        value
            .get("instance_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// Accept `["a", "b"]` or the dataset convention `"[\"a\", \"b\"]"`.
fn string_or_array<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Encoded(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::List(list) => Ok(list),
        Raw::Encoded(text) => serde_json::from_str::<Vec<String>>(&text).map_err(|e| {
            de::Error::custom(format!("test list string is not a JSON array of strings: {e}"))
        }),
    }
}

/// One output record per evaluated input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub instance_id: String,
    pub result: VerdictResult,
    pub fail_to_pass: BTreeMap<String, TestStatus>,
    pub pass_to_pass: BTreeMap<String, TestStatus>,
    pub diagnostics: Vec<String>,
}

impl From<&Verdict> for OutputRecord {
    fn from(verdict: &Verdict) -> Self {
        let statuses = |outcomes: &BTreeMap<String, super::TestOutcome>| {
            outcomes
                .iter()
                .map(|(id, o)| (id.clone(), o.status))
                .collect()
        };
        Self {
            instance_id: verdict.request_id.clone(),
            result: verdict.result,
            fail_to_pass: statuses(&verdict.fail_to_pass),
            pass_to_pass: statuses(&verdict.pass_to_pass),
            diagnostics: verdict.diagnostics.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENCODED: &str = r#"{
        "instance_id": "astropy__astropy-12907",
        "repo": "astropy/astropy",
        "base_commit": "d16bfe05a744909de4b27f5875fe0d4ed41ce607",
        "patch": "diff --git a/x b/x\n",
        "FAIL_TO_PASS": "[\"t::a\", \"t::b\"]",
        "PASS_TO_PASS": "[]",
        "version": "4.3"
    }"#;

    #[test]
    fn parses_string_encoded_lists() {
        let records = InputRecord::parse_many(ENCODED).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fail_to_pass, vec!["t::a", "t::b"]);
        assert!(records[0].pass_to_pass.is_empty());
        assert_eq!(records[0].repo_url, None);
    }

    #[test]
    fn parses_plain_arrays_and_batches() {
        let text = r#"[
            {"instance_id": "a", "repo": "o/r", "base_commit": "c", "patch": "p",
             "FAIL_TO_PASS": ["x"], "PASS_TO_PASS": ["y"], "repo_url": "/tmp/r"},
            {"instance_id": "b", "repo": "o/r", "base_commit": "c", "patch": "p",
             "FAIL_TO_PASS": "[\"x\"]", "PASS_TO_PASS": []}
        ]"#;
        let records = InputRecord::parse_many(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].repo_url.as_deref(), Some("/tmp/r"));
        assert_eq!(records[1].fail_to_pass, vec!["x"]);
    }

    #[test]
    fn missing_field_is_an_error() {
        let text = r#"{"instance_id": "a", "repo": "o/r", "patch": "p",
                       "FAIL_TO_PASS": [], "PASS_TO_PASS": []}"#;
        let err = InputRecord::parse_many(text).unwrap_err();
        assert!(err.to_string().contains("base_commit"));
        assert_eq!(InputRecord::salvage_instance_id(text).as_deref(), Some("a"));
    }

    #[test]
    fn non_array_list_is_an_error() {
        let text = r#"{"instance_id": "a", "repo": "o/r", "base_commit": "c", "patch": "p",
                       "FAIL_TO_PASS": "not json", "PASS_TO_PASS": []}"#;
        assert!(InputRecord::parse_many(text).is_err());

        let text = r#"{"instance_id": "a", "repo": "o/r", "base_commit": "c", "patch": "p",
                       "FAIL_TO_PASS": 7, "PASS_TO_PASS": []}"#;
        assert!(InputRecord::parse_many(text).is_err());
    }

    #[test]
    fn scalar_document_is_rejected() {
        assert!(matches!(
            InputRecord::parse_many("42"),
            Err(RecordError::NotARecord)
        ));
    }
}
