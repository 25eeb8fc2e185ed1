use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata describing the change under review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub repo_full_name: String,
    pub number: u64,
    pub title: String,
    pub author: String,
    pub body: Option<String>,
    pub head_sha: String,
    pub base_sha: String,
    pub head_ref: String,
    pub base_ref: String,
    pub html_url: Option<String>,
}

impl ChangeMetadata {
    /// Truncated head SHA for display (first 7 characters).
    pub fn short_head_sha(&self) -> &str {
        &self.head_sha[..7.min(self.head_sha.len())]
    }
}

/// How a file was touched by the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Removed,
    Renamed,
    Copied,
    Changed,
    Unchanged,
}

impl FileStatus {
    /// Parse the status string used by the upstream API.
    ///
    /// Returns `None` for values we have never seen, so the caller can reject
    /// the file list instead of guessing.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "added" => Some(Self::Added),
            "modified" => Some(Self::Modified),
            "removed" => Some(Self::Removed),
            "renamed" => Some(Self::Renamed),
            "copied" => Some(Self::Copied),
            "changed" => Some(Self::Changed),
            "unchanged" => Some(Self::Unchanged),
            _ => None,
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Removed => "removed",
            Self::Renamed => "renamed",
            Self::Copied => "copied",
            Self::Changed => "changed",
            Self::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// A single file in the change, with its unified diff hunk when available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: FileStatus,
    pub additions: u32,
    pub deletions: u32,
    /// Absent for binary files and for diffs too large for the upstream API.
    pub patch: Option<String>,
    pub previous_path: Option<String>,
}

/// Everything the analyzer needs about one change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedChange {
    pub metadata: ChangeMetadata,
    pub changed_files: Vec<ChangedFile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
    Nit,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Critical,
        Severity::Major,
        Severity::Minor,
        Severity::Nit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Major => "major",
            Severity::Minor => "minor",
            Severity::Nit => "nit",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem reported by the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub path: String,
    pub line: Option<u32>,
    pub severity: Severity,
    pub message: String,
}

/// Result of analysing a change. Matches the schema sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub summary: String,
    pub issues: Vec<Issue>,
}

impl Analysis {
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    /// Number of issues at the given severity.
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

/// System prompt for code review
pub fn get_system_prompt() -> String {
    include_str!("../prompt.txt").to_string()
}

/// Create the user prompt from change metadata and per-file patches.
///
/// Files without a patch (binary, oversized) are listed by name only.
pub fn create_user_prompt(metadata: &ChangeMetadata, files: &[ChangedFile]) -> String {
    let mut user_prompt = format!(
        "Pull request #{} in {}: {}\nAuthor: {}\nHead: {} ({})\nBase: {} ({})\n",
        metadata.number,
        metadata.repo_full_name,
        metadata.title,
        metadata.author,
        metadata.head_ref,
        metadata.head_sha,
        metadata.base_ref,
        metadata.base_sha,
    );

    if let Some(body) = metadata.body.as_deref().filter(|b| !b.trim().is_empty()) {
        user_prompt.push_str("\nDESCRIPTION BEGINS:\n");
        user_prompt.push_str(body);
        user_prompt.push_str("\nDESCRIPTION ENDS\n");
    }

    user_prompt.push_str("\nCHANGED FILES:\n");
    for file in files {
        match &file.previous_path {
            Some(previous) => user_prompt.push_str(&format!(
                "\n === {} (renamed from {}, {}, +{} -{}) ===\n\n",
                file.path, previous, file.status, file.additions, file.deletions
            )),
            None => user_prompt.push_str(&format!(
                "\n === {} ({}, +{} -{}) ===\n\n",
                file.path, file.status, file.additions, file.deletions
            )),
        }
        match &file.patch {
            Some(patch) => {
                user_prompt.push_str(patch);
                user_prompt.push_str("\n\n");
            }
            None => user_prompt.push_str("(no textual diff available)\n\n"),
        }
    }

    user_prompt
}
