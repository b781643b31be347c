//! Exact-position hunk application. No offset search, no fuzz.

use super::parse::{FileChange, FilePatch, Hunk, HunkLine};
use super::ApplyError;

/// A text file split into lines, remembering whether it ends in `\n`.
///
/// `\r` stays part of each line so CRLF files round-trip byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFile {
    pub lines: Vec<String>,
    pub trailing_newline: bool,
}

impl TextFile {
    pub fn empty() -> Self {
        Self {
            lines: Vec::new(),
            trailing_newline: true,
        }
    }

    pub fn from_bytes(path: &str, bytes: &[u8]) -> Result<Self, ApplyError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ApplyError::Conflict {
            path: path.to_string(),
            reason: "file is not valid UTF-8 text".to_string(),
        })?;
        if text.is_empty() {
            return Ok(Self::empty());
        }
        let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
        let trailing_newline = text.ends_with('\n');
        if trailing_newline {
            lines.pop();
        }
        Ok(Self {
            lines,
            trailing_newline,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out.into_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

fn conflict(path: &str, reason: impl Into<String>) -> ApplyError {
    ApplyError::Conflict {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Apply `hunks` to `file` at exactly the positions their headers state.
pub fn apply_hunks(path: &str, file: &TextFile, hunks: &[Hunk]) -> Result<TextFile, ApplyError> {
    let mut out = Vec::with_capacity(file.lines.len());
    let mut trailing_newline = file.trailing_newline;
    let mut cursor = 0usize;

    for hunk in hunks {
        let start = hunk.start_index();
        if start < cursor || start > file.lines.len() {
            return Err(conflict(
                path,
                format!(
                    "hunk at line {} is outside the file ({} lines)",
                    hunk.old_start,
                    file.lines.len()
                ),
            ));
        }
        out.extend_from_slice(&file.lines[cursor..start]);

        let mut idx = start;
        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) | HunkLine::Remove(expected) => {
                    match file.lines.get(idx) {
                        Some(actual) if actual == expected => {}
                        Some(actual) => {
                            return Err(conflict(
                                path,
                                format!(
                                    "line {} does not match: expected {:?}, found {:?}",
                                    idx + 1,
                                    expected,
                                    actual
                                ),
                            ))
                        }
                        None => {
                            return Err(conflict(
                                path,
                                format!("line {} is past end of file", idx + 1),
                            ))
                        }
                    }
                    if let HunkLine::Context(text) = line {
                        out.push(text.clone());
                    }
                    idx += 1;
                }
                HunkLine::Add(text) => out.push(text.clone()),
            }
        }

        let reaches_eof = idx == file.lines.len();
        if hunk.old_missing_newline {
            if !reaches_eof || file.trailing_newline {
                return Err(conflict(
                    path,
                    format!(
                        "hunk at line {} expects no newline at end of file",
                        hunk.old_start
                    ),
                ));
            }
        } else if reaches_eof && hunk.old_len > 0 && !file.trailing_newline {
            return Err(conflict(
                path,
                format!(
                    "hunk at line {} expects a newline at end of file",
                    hunk.old_start
                ),
            ));
        }
        if reaches_eof {
            trailing_newline = !hunk.new_missing_newline;
        }
        cursor = idx;
    }

    out.extend_from_slice(&file.lines[cursor..]);
    Ok(TextFile {
        lines: out,
        trailing_newline,
    })
}

/// One staged write: `None` removes the path.
pub type Edit = (String, Option<Vec<u8>>);

/// Compute the edits one file section produces.
///
/// `source` is the current content of the section's source path (`None`
/// if absent); `target_exists` reports whether the target path exists when
/// it differs from the source.
pub fn plan_section(
    section: &FilePatch,
    source: Option<&[u8]>,
    target_exists: bool,
) -> Result<Vec<Edit>, ApplyError> {
    let src_path = section.source_path();
    let dst_path = section.target_path();
    let missing = || ApplyError::TargetMissing {
        path: src_path.to_string(),
    };

    match section.change {
        FileChange::Create => {
            if source.is_some() {
                return Err(conflict(dst_path, "file to be created already exists"));
            }
            let created = apply_hunks(dst_path, &TextFile::empty(), &section.hunks)?;
            Ok(vec![(dst_path.to_string(), Some(created.to_bytes()))])
        }
        FileChange::Delete => {
            let bytes = source.ok_or_else(missing)?;
            let current = TextFile::from_bytes(src_path, bytes)?;
            let remaining = apply_hunks(src_path, &current, &section.hunks)?;
            if !remaining.is_empty() {
                return Err(conflict(
                    src_path,
                    format!(
                        "deletion leaves {} line(s) unaccounted for",
                        remaining.lines.len()
                    ),
                ));
            }
            Ok(vec![(src_path.to_string(), None)])
        }
        FileChange::Modify => {
            let bytes = source.ok_or_else(missing)?;
            let current = TextFile::from_bytes(src_path, bytes)?;
            let updated = apply_hunks(src_path, &current, &section.hunks)?;
            Ok(vec![(dst_path.to_string(), Some(updated.to_bytes()))])
        }
        FileChange::Rename => {
            let bytes = source.ok_or_else(missing)?;
            if src_path != dst_path && target_exists {
                return Err(conflict(dst_path, "rename target already exists"));
            }
            let contents = if section.hunks.is_empty() {
                bytes.to_vec()
            } else {
                let current = TextFile::from_bytes(src_path, bytes)?;
                apply_hunks(src_path, &current, &section.hunks)?.to_bytes()
            };
            let mut edits = vec![(src_path.to_string(), None)];
            edits.push((dst_path.to_string(), Some(contents)));
            Ok(edits)
        }
        FileChange::ModeOnly => {
            source.ok_or_else(missing)?;
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::parse::parse_patch;

    fn text(s: &str) -> TextFile {
        TextFile::from_bytes("f", s.as_bytes()).unwrap()
    }

    fn first_section(patch: &str) -> FilePatch {
        parse_patch(patch).unwrap().files.remove(0)
    }

    #[test]
    fn text_file_round_trips_newline_state() {
        assert_eq!(text("a\nb\n").to_bytes(), b"a\nb\n");
        assert_eq!(text("a\nb").to_bytes(), b"a\nb");
        assert_eq!(text("a\r\nb\r\n").to_bytes(), b"a\r\nb\r\n");
        assert!(text("").is_empty());
    }

    #[test]
    fn applies_at_exact_position() {
        let section = first_section("--- a/f\n+++ b/f\n@@ -2,2 +2,3 @@\n b\n-c\n+C\n+D\n");
        let out = apply_hunks("f", &text("a\nb\nc\n"), &section.hunks).unwrap();
        assert_eq!(out.to_bytes(), b"a\nb\nC\nD\n");
    }

    #[test]
    fn applies_multiple_hunks() {
        let section = first_section(
            "--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n-a\n+A\n b\n@@ -4,2 +4,2 @@\n d\n-e\n+E\n",
        );
        let out = apply_hunks("f", &text("a\nb\nc\nd\ne\n"), &section.hunks).unwrap();
        assert_eq!(out.to_bytes(), b"A\nb\nc\nd\nE\n");
    }

    #[test]
    fn shifted_context_is_a_conflict() {
        // Same content one line lower: no offset search.
        let section = first_section("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n b\n-c\n+C\n");
        let err = apply_hunks("f", &text("a\nb\nc\n"), &section.hunks).unwrap_err();
        assert!(matches!(err, ApplyError::Conflict { ref path, .. } if path == "f"));
    }

    #[test]
    fn hunk_past_end_is_a_conflict() {
        let section = first_section("--- a/f\n+++ b/f\n@@ -10,2 +10,2 @@\n x\n-y\n+Y\n");
        let err = apply_hunks("f", &text("a\nb\n"), &section.hunks).unwrap_err();
        assert!(matches!(err, ApplyError::Conflict { .. }));
    }

    #[test]
    fn missing_newline_markers_are_enforced() {
        let add_newline =
            first_section("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n\\ No newline at end of file\n+a\n");
        let out = apply_hunks("f", &text("a"), &add_newline.hunks).unwrap();
        assert_eq!(out.to_bytes(), b"a\n");

        let err = apply_hunks("f", &text("a\n"), &add_newline.hunks).unwrap_err();
        assert!(matches!(err, ApplyError::Conflict { .. }));

        let plain = first_section("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n+b\n");
        let err = apply_hunks("f", &text("a"), &plain.hunks).unwrap_err();
        assert!(matches!(err, ApplyError::Conflict { .. }));
    }

    #[test]
    fn creation_rules() {
        let section = first_section("--- /dev/null\n+++ b/new.py\n@@ -0,0 +1,2 @@\n+x = 1\n+y = 2\n");
        let edits = plan_section(&section, None, false).unwrap();
        assert_eq!(edits, vec![("new.py".into(), Some(b"x = 1\ny = 2\n".to_vec()))]);

        let err = plan_section(&section, Some(b"old\n"), false).unwrap_err();
        assert!(matches!(err, ApplyError::Conflict { .. }));
    }

    #[test]
    fn deletion_must_consume_the_file() {
        let section = first_section("--- a/gone.py\n+++ /dev/null\n@@ -1 +0,0 @@\n-x\n");
        let edits = plan_section(&section, Some(b"x\n"), false).unwrap();
        assert_eq!(edits, vec![("gone.py".into(), None)]);

        let err = plan_section(&section, Some(b"x\ny\n"), false).unwrap_err();
        assert!(matches!(err, ApplyError::Conflict { .. }));

        let err = plan_section(&section, None, false).unwrap_err();
        assert_eq!(
            err,
            ApplyError::TargetMissing {
                path: "gone.py".into()
            }
        );
    }

    #[test]
    fn rename_moves_content() {
        let section = first_section(
            "diff --git a/a.py b/b.py\nsimilarity index 90%\nrename from a.py\nrename to b.py\n--- a/a.py\n+++ b/b.py\n@@ -1 +1 @@\n-one\n+two\n",
        );
        let edits = plan_section(&section, Some(b"one\n"), false).unwrap();
        assert_eq!(
            edits,
            vec![
                ("a.py".into(), None),
                ("b.py".into(), Some(b"two\n".to_vec()))
            ]
        );
        assert!(matches!(
            plan_section(&section, Some(b"one\n"), true),
            Err(ApplyError::Conflict { .. })
        ));
    }

    #[test]
    fn modify_missing_file() {
        let section = first_section("--- a/nope.py\n+++ b/nope.py\n@@ -1 +1 @@\n-a\n+b\n");
        assert!(matches!(
            plan_section(&section, None, false),
            Err(ApplyError::TargetMissing { .. })
        ));
    }
}
