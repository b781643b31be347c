//! Unified-diff parser (git extended headers included).

use std::sync::OnceLock;

use regex::Regex;

use super::ApplyError;

/// A parsed patch: one section per file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSet {
    pub files: Vec<FilePatch>,
}

/// What a file section does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Modify,
    Create,
    Delete,
    Rename,
    /// Mode change or empty section; content untouched.
    ModeOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// `None` for creations.
    pub old_path: Option<String>,
    /// `None` for deletions.
    pub new_path: Option<String>,
    pub change: FileChange,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// Path the section reads from (or creates).
    pub fn source_path(&self) -> &str {
        self.old_path
            .as_deref()
            .or(self.new_path.as_deref())
            .unwrap_or_default()
    }

    /// Path the section writes to (or deletes).
    pub fn target_path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_len: usize,
    pub new_start: usize,
    pub new_len: usize,
    pub lines: Vec<HunkLine>,
    /// The old side's last line has no trailing newline.
    pub old_missing_newline: bool,
    /// The new side's last line has no trailing newline.
    pub new_missing_newline: bool,
}

impl Hunk {
    /// Zero-based index of the first old line the hunk touches.
    pub fn start_index(&self) -> usize {
        if self.old_len == 0 {
            self.old_start
        } else {
            self.old_start - 1
        }
    }

    fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_len, self.new_start, self.new_len
        )
    }
}

fn hunk_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@")
            .expect("hunk header pattern is valid")
    })
}

fn malformed(reason: impl Into<String>) -> ApplyError {
    ApplyError::Malformed {
        reason: reason.into(),
    }
}

/// Parse unified-diff text.
pub fn parse_patch(text: &str) -> Result<PatchSet, ApplyError> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }

    let mut parser = Parser { lines, pos: 0 };
    let mut files = Vec::new();

    while let Some(line) = parser.peek() {
        let header = line.trim_end_matches('\r');
        if header.starts_with("diff --git ") {
            files.push(parser.git_section()?);
        } else if header.starts_with("--- ")
            && parser
                .peek_at(1)
                .is_some_and(|next| next.starts_with("+++ "))
        {
            files.push(parser.plain_section()?);
        } else if header.starts_with("GIT binary patch") || header.starts_with("Binary files ") {
            return Err(malformed("binary patches are not supported"));
        } else {
            // Preamble such as a commit message or `index` lines of a bare section.
            parser.pos += 1;
        }
    }

    if files.is_empty() {
        return Err(malformed("no file sections found"));
    }
    Ok(PatchSet { files })
}

struct Parser<'a> {
    lines: Vec<&'a str>,
    pos: usize,
}

#[derive(Default)]
struct GitHeader {
    old_path: Option<String>,
    new_path: Option<String>,
    new_file: bool,
    deleted_file: bool,
    rename_from: Option<String>,
    rename_to: Option<String>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<&'a str> {
        self.lines.get(self.pos + offset).copied()
    }

    fn next_header(&self) -> Option<&'a str> {
        self.peek().map(|l| l.trim_end_matches('\r'))
    }

    fn git_section(&mut self) -> Result<FilePatch, ApplyError> {
        let line = self.next_header().unwrap_or_default();
        self.pos += 1;

        let mut header = GitHeader::default();
        if let Some((a, b)) = split_git_paths(&line["diff --git ".len()..]) {
            header.old_path = Some(clean_path(&a)?);
            header.new_path = Some(clean_path(&b)?);
        }

        while let Some(line) = self.next_header() {
            if line.starts_with("--- ") || line.starts_with("@@") || line.starts_with("diff --git ")
            {
                break;
            }
            if line.starts_with("new file mode ") {
                header.new_file = true;
            } else if line.starts_with("deleted file mode ") {
                header.deleted_file = true;
            } else if let Some(path) = line.strip_prefix("rename from ") {
                header.rename_from = Some(validate_path(unquote(path))?);
            } else if let Some(path) = line.strip_prefix("rename to ") {
                header.rename_to = Some(validate_path(unquote(path))?);
            } else if line.starts_with("copy from ") || line.starts_with("copy to ") {
                return Err(malformed("copy sections are not supported"));
            } else if line.starts_with("GIT binary patch") || line.starts_with("Binary files ") {
                return Err(malformed("binary patches are not supported"));
            } else if line.starts_with("old mode ")
                || line.starts_with("new mode ")
                || line.starts_with("index ")
                || line.starts_with("similarity index ")
                || line.starts_with("dissimilarity index ")
            {
                // Metadata with no content effect.
            } else {
                break;
            }
            self.pos += 1;
        }

        let (mut old_path, mut new_path) = (header.old_path.clone(), header.new_path.clone());
        if self.next_header().is_some_and(|l| l.starts_with("--- ")) {
            let (old, new) = self.file_header_pair()?;
            old_path = old;
            new_path = new;
        }
        if header.new_file {
            old_path = None;
        }
        if header.deleted_file {
            new_path = None;
        }
        if let (Some(from), Some(to)) = (&header.rename_from, &header.rename_to) {
            old_path = Some(from.clone());
            new_path = Some(to.clone());
        } else if header.rename_from.is_some() || header.rename_to.is_some() {
            return Err(malformed("rename section is missing `rename from` or `rename to`"));
        }

        let hunks = self.hunks()?;
        let is_rename = header.rename_from.is_some();
        finish_section(old_path, new_path, is_rename, hunks)
    }

    fn plain_section(&mut self) -> Result<FilePatch, ApplyError> {
        let (old_path, new_path) = self.file_header_pair()?;
        let hunks = self.hunks()?;
        finish_section(old_path, new_path, false, hunks)
    }

    /// Parse a `---` / `+++` pair.
    fn file_header_pair(&mut self) -> Result<(Option<String>, Option<String>), ApplyError> {
        let old = self.next_header().unwrap_or_default();
        let new = self
            .peek_at(1)
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| l.starts_with("+++ "))
            .ok_or_else(|| malformed("`---` line is not followed by `+++`"))?;
        self.pos += 2;
        Ok((header_path(&old[4..])?, header_path(&new[4..])?))
    }

    fn hunks(&mut self) -> Result<Vec<Hunk>, ApplyError> {
        let mut hunks: Vec<Hunk> = Vec::new();
        while self.next_header().is_some_and(|l| l.starts_with("@@")) {
            let hunk = self.hunk()?;
            if let Some(prev) = hunks.last() {
                if hunk.start_index() < prev.start_index() + prev.old_len {
                    return Err(malformed(format!(
                        "hunk {} overlaps or precedes hunk {}",
                        hunk.header(),
                        prev.header()
                    )));
                }
            }
            hunks.push(hunk);
        }
        Ok(hunks)
    }

    fn hunk(&mut self) -> Result<Hunk, ApplyError> {
        let header = self.next_header().unwrap_or_default();
        let caps = hunk_header()
            .captures(header)
            .ok_or_else(|| malformed(format!("bad hunk header: {}", header)))?;
        let num = |idx: usize, default: usize| -> Result<usize, ApplyError> {
            match caps.get(idx) {
                Some(m) => m
                    .as_str()
                    .parse()
                    .map_err(|_| malformed(format!("bad hunk header: {}", header))),
                None => Ok(default),
            }
        };
        let mut hunk = Hunk {
            old_start: num(1, 0)?,
            old_len: num(2, 1)?,
            new_start: num(3, 0)?,
            new_len: num(4, 1)?,
            lines: Vec::new(),
            old_missing_newline: false,
            new_missing_newline: false,
        };
        if hunk.old_len > 0 && hunk.old_start == 0 {
            return Err(malformed(format!("bad hunk header: {}", header)));
        }
        self.pos += 1;

        let (mut old_seen, mut new_seen) = (0usize, 0usize);
        while old_seen < hunk.old_len || new_seen < hunk.new_len {
            let line = self
                .peek()
                .ok_or_else(|| malformed(format!("hunk {} is truncated", hunk.header())))?;
            let parsed = match line.as_bytes().first() {
                Some(b' ') => {
                    old_seen += 1;
                    new_seen += 1;
                    HunkLine::Context(line[1..].to_string())
                }
                Some(b'-') => {
                    old_seen += 1;
                    HunkLine::Remove(line[1..].to_string())
                }
                Some(b'+') => {
                    new_seen += 1;
                    HunkLine::Add(line[1..].to_string())
                }
                Some(b'\\') => {
                    self.mark_missing_newline(&mut hunk);
                    self.pos += 1;
                    continue;
                }
                // Editors strip the lone space of blank context lines.
                None | Some(b'\r') => {
                    old_seen += 1;
                    new_seen += 1;
                    HunkLine::Context(line.to_string())
                }
                Some(_) => {
                    return Err(malformed(format!(
                        "unexpected line in hunk {}: {:?}",
                        hunk.header(),
                        line
                    )))
                }
            };
            if old_seen > hunk.old_len || new_seen > hunk.new_len {
                return Err(malformed(format!(
                    "hunk {} body does not match its line counts",
                    hunk.header()
                )));
            }
            hunk.lines.push(parsed);
            self.pos += 1;
        }

        while self.peek().is_some_and(|l| l.starts_with('\\')) {
            self.mark_missing_newline(&mut hunk);
            self.pos += 1;
        }
        Ok(hunk)
    }

    fn mark_missing_newline(&self, hunk: &mut Hunk) {
        match hunk.lines.last() {
            Some(HunkLine::Remove(_)) => hunk.old_missing_newline = true,
            Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
            Some(HunkLine::Context(_)) => {
                hunk.old_missing_newline = true;
                hunk.new_missing_newline = true;
            }
            None => {}
        }
    }
}

fn finish_section(
    old_path: Option<String>,
    new_path: Option<String>,
    is_rename: bool,
    hunks: Vec<Hunk>,
) -> Result<FilePatch, ApplyError> {
    let change = match (&old_path, &new_path) {
        (None, None) => return Err(malformed("file section has neither source nor target")),
        (None, Some(_)) => FileChange::Create,
        (Some(_), None) => FileChange::Delete,
        (Some(_), Some(_)) if is_rename => FileChange::Rename,
        (Some(_), Some(_)) if hunks.is_empty() => FileChange::ModeOnly,
        (Some(_), Some(_)) => FileChange::Modify,
    };
    if change == FileChange::Create && hunks.iter().any(|h| h.old_len > 0) {
        return Err(malformed("file creation hunk removes lines"));
    }
    if change == FileChange::Delete && hunks.iter().any(|h| h.new_len > 0) {
        return Err(malformed("file deletion hunk adds lines"));
    }
    Ok(FilePatch {
        old_path,
        new_path,
        change,
        hunks,
    })
}

/// Path from a `---`/`+++` line: drop timestamps, map `/dev/null` to `None`.
fn header_path(raw: &str) -> Result<Option<String>, ApplyError> {
    let raw = raw.split('\t').next().unwrap_or_default().trim_end();
    if raw == "/dev/null" {
        return Ok(None);
    }
    clean_path(raw).map(Some)
}

fn clean_path(raw: &str) -> Result<String, ApplyError> {
    let raw = unquote(raw);
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    validate_path(stripped)
}

fn validate_path(path: &str) -> Result<String, ApplyError> {
    if path.is_empty() {
        return Err(malformed("empty file path"));
    }
    if path.starts_with('/') {
        return Err(malformed(format!("absolute path not allowed: {}", path)));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(malformed(format!("path escapes the tree: {}", path)));
    }
    Ok(path.to_string())
}

fn unquote(path: &str) -> &str {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
}

/// Split `a/x b/x` from a `diff --git` line.
///
/// Ambiguous with spaces in names; the `---`/`+++` or rename lines take
/// precedence when present.
fn split_git_paths(rest: &str) -> Option<(String, String)> {
    if let Some(idx) = rest.find(" b/") {
        let (a, b) = rest.split_at(idx);
        return Some((a.to_string(), b[1..].to_string()));
    }
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => Some((a.to_string(), b.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_modification() {
        let patch = "\
diff --git a/pkg/mod.py b/pkg/mod.py
index 83db48f..bf269f4 100644
--- a/pkg/mod.py
+++ b/pkg/mod.py
@@ -1,3 +1,3 @@
 def f():
-    return 1
+    return 2

";
        let set = parse_patch(patch).unwrap();
        assert_eq!(set.files.len(), 1);
        let file = &set.files[0];
        assert_eq!(file.change, FileChange::Modify);
        assert_eq!(file.target_path(), "pkg/mod.py");
        assert_eq!(file.hunks.len(), 1);
        assert_eq!(
            file.hunks[0].lines,
            vec![
                HunkLine::Context("def f():".into()),
                HunkLine::Remove("    return 1".into()),
                HunkLine::Add("    return 2".into()),
                HunkLine::Context("".into()),
            ]
        );
    }

    #[test]
    fn parses_creation_deletion_and_rename() {
        let patch = "\
diff --git a/new.txt b/new.txt
new file mode 100644
index 0000000..3b18e51
--- /dev/null
+++ b/new.txt
@@ -0,0 +1 @@
+hello
diff --git a/old.txt b/old.txt
deleted file mode 100644
--- a/old.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
diff --git a/a.py b/b.py
similarity index 100%
rename from a.py
rename to b.py
";
        let set = parse_patch(patch).unwrap();
        let kinds: Vec<_> = set.files.iter().map(|f| f.change).collect();
        assert_eq!(
            kinds,
            vec![FileChange::Create, FileChange::Delete, FileChange::Rename]
        );
        assert_eq!(set.files[0].new_path.as_deref(), Some("new.txt"));
        assert_eq!(set.files[1].old_path.as_deref(), Some("old.txt"));
        assert_eq!(set.files[2].old_path.as_deref(), Some("a.py"));
        assert_eq!(set.files[2].new_path.as_deref(), Some("b.py"));
    }

    #[test]
    fn parses_plain_diff_with_timestamps() {
        let patch = "--- a/x.txt\t2024-01-01 00:00:00.000000000 +0000\n+++ b/x.txt\t2024-01-02 00:00:00.000000000 +0000\n@@ -1 +1 @@\n-a\n+b\n";
        let set = parse_patch(patch).unwrap();
        assert_eq!(set.files[0].old_path.as_deref(), Some("x.txt"));
        assert_eq!(set.files[0].change, FileChange::Modify);
    }

    #[test]
    fn records_missing_newline_markers() {
        let patch = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-old\n\\ No newline at end of file\n+new\n\\ No newline at end of file\n";
        let hunk = &parse_patch(patch).unwrap().files[0].hunks[0];
        assert!(hunk.old_missing_newline);
        assert!(hunk.new_missing_newline);
    }

    #[test]
    fn mode_only_section() {
        let patch = "diff --git a/run.sh b/run.sh\nold mode 100644\nnew mode 100755\n";
        let set = parse_patch(patch).unwrap();
        assert_eq!(set.files[0].change, FileChange::ModeOnly);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_patch("this is not a diff"),
            Err(ApplyError::Malformed { .. })
        ));
        assert!(matches!(parse_patch(""), Err(ApplyError::Malformed { .. })));
    }

    #[test]
    fn rejects_count_mismatch() {
        let truncated = "--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n-b\n";
        assert!(matches!(
            parse_patch(truncated),
            Err(ApplyError::Malformed { .. })
        ));
        let overfull = "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n-b\n+c\n";
        assert!(matches!(
            parse_patch(overfull),
            Err(ApplyError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_unknown_prefix_and_bad_header() {
        let bad_line = "--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n a\n*b\n";
        assert!(matches!(
            parse_patch(bad_line),
            Err(ApplyError::Malformed { .. })
        ));
        let bad_header = "--- a/x\n+++ b/x\n@@ -x +1 @@\n-a\n+b\n";
        assert!(matches!(
            parse_patch(bad_header),
            Err(ApplyError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_overlapping_hunks() {
        let patch = "--- a/x\n+++ b/x\n@@ -3,2 +3,2 @@\n-c\n+C\n d\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n";
        assert!(matches!(
            parse_patch(patch),
            Err(ApplyError::Malformed { .. })
        ));
    }

    #[test]
    fn rejects_escaping_paths_and_binary() {
        let escape = "--- a/../etc/passwd\n+++ b/../etc/passwd\n@@ -1 +1 @@\n-a\n+b\n";
        assert!(matches!(
            parse_patch(escape),
            Err(ApplyError::Malformed { .. })
        ));
        let absolute = "--- /etc/passwd\n+++ /etc/passwd\n@@ -1 +1 @@\n-a\n+b\n";
        assert!(matches!(
            parse_patch(absolute),
            Err(ApplyError::Malformed { .. })
        ));
        let binary = "diff --git a/img.png b/img.png\nindex 1..2 100644\nBinary files a/img.png and b/img.png differ\n";
        assert!(matches!(
            parse_patch(binary),
            Err(ApplyError::Malformed { .. })
        ));
    }

    #[test]
    fn keeps_crlf_content() {
        let patch = "--- a/w.txt\r\n+++ b/w.txt\r\n@@ -1 +1 @@\r\n-a\r\n+b\r\n";
        let hunk = &parse_patch(patch).unwrap().files[0].hunks[0];
        assert_eq!(
            hunk.lines,
            vec![HunkLine::Remove("a\r".into()), HunkLine::Add("b\r".into())]
        );
    }
}
