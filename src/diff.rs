//! Patch parsing - turns rendered `git show` output into diff artifacts
//!
//! The patch is expected to be rendered with zero context lines, empty path
//! prefixes and `+`/`-` line markers (see [`crate::repository`]). Parsing is
//! purely textual and line oriented:
//!
//! - a line starting with `---` opens a file; it and the following line carry
//!   the source and destination paths behind a 4 character prefix
//! - inside a file, a line starting with `@@` opens a hunk
//! - the lines directly after a hunk header that start with `+` or `-` are the
//!   hunk's added and removed lines
//!
//! Every other line (commit header, `diff --git`, `index`, mode lines) is
//! ignored.

use serde::{Deserialize, Serialize};

const FILE_MARKER: &str = "---";
const HUNK_MARKER: &str = "@@";
const ADDED_MARKER: char = '+';
const REMOVED_MARKER: char = '-';
const PATH_PREFIX_LEN: usize = 4;

/// Persisted per-commit artifact, written once as `{hash}.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub hash: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difference: Option<Vec<FileDiff>>,
}

impl DiffRecord {
    /// Build the artifact for one commit from its rendered patch
    pub fn from_patch(hash: impl Into<String>, subject: impl Into<String>, patch: &str) -> Self {
        let files = parse_patch(patch);
        Self {
            hash: hash.into(),
            subject: subject.into(),
            difference: if files.is_empty() { None } else { Some(files) },
        }
    }

    pub fn files(&self) -> &[FileDiff] {
        self.difference.as_deref().unwrap_or(&[])
    }
}

/// One changed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub src: String,
    pub dst: String,
    #[serde(rename = "hunk", default, skip_serializing_if = "Vec::is_empty")]
    pub hunks: Vec<Hunk>,
}

/// One hunk: its range header and the changed lines without their markers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub info: String,
    #[serde(rename = "sub", default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
    #[serde(rename = "add", default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
}

impl Hunk {
    fn new(info: impl Into<String>) -> Self {
        Self {
            info: info.into(),
            removed: Vec::new(),
            added: Vec::new(),
        }
    }
}

/// Parse rendered patch text into files in order of appearance
pub fn parse_patch(text: &str) -> Vec<FileDiff> {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut files = Vec::new();
    let mut pos = 0;

    while pos < lines.len() {
        if !lines[pos].starts_with(FILE_MARKER) {
            pos += 1;
            continue;
        }

        let src = strip_path_prefix(lines[pos]);
        let dst = lines.get(pos + 1).map(|l| strip_path_prefix(l)).unwrap_or_default();
        pos += 2;

        let mut hunks = Vec::new();
        while pos < lines.len() && !lines[pos].starts_with(FILE_MARKER) {
            if !lines[pos].starts_with(HUNK_MARKER) {
                pos += 1;
                continue;
            }

            let mut hunk = Hunk::new(hunk_info(lines[pos]));
            pos += 1;

            // Removed lines may begin with "---"; take them before checking
            // for a file boundary.
            while pos < lines.len() {
                let line = lines[pos];
                if let Some(added) = line.strip_prefix(ADDED_MARKER) {
                    hunk.added.push(added.to_string());
                } else if let Some(removed) = line.strip_prefix(REMOVED_MARKER) {
                    hunk.removed.push(removed.to_string());
                } else {
                    break;
                }
                pos += 1;
            }

            hunks.push(hunk);
        }

        files.push(FileDiff { src, dst, hunks });
    }

    files
}

fn strip_path_prefix(line: &str) -> String {
    line.get(PATH_PREFIX_LEN..).unwrap_or_default().to_string()
}

/// Header text up to and including the second `@@`
fn hunk_info(line: &str) -> &str {
    match line[HUNK_MARKER.len()..].find(HUNK_MARKER) {
        Some(idx) => &line[..idx + 2 * HUNK_MARKER.len()],
        None => line,
    }
}
