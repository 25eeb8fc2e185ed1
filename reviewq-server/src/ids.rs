//! Identifier newtypes shared by the record store, queue and workers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Surrogate key of a repository row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryId(pub i64);

/// Surrogate key of a change-request row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeRequestId(pub i64);

/// Surrogate key of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic identity of the review work for one change-request.
///
/// Built from the repository's external ID and the change-request number, so
/// every delivery of the same logical event maps to the same key. Rendered as
/// `<repo_external_id>:<number>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobKey {
    repo_external_id: u64,
    number: u64,
}

impl JobKey {
    pub fn new(repo_external_id: u64, number: u64) -> Self {
        Self {
            repo_external_id,
            number,
        }
    }

    pub fn repo_external_id(&self) -> u64 {
        self.repo_external_id
    }

    pub fn number(&self) -> u64 {
        self.number
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo_external_id, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job key: {0:?}")]
pub struct InvalidJobKey(pub String);

impl FromStr for JobKey {
    type Err = InvalidJobKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo, number) = s
            .split_once(':')
            .ok_or_else(|| InvalidJobKey(s.to_string()))?;
        let repo_external_id = repo.parse().map_err(|_| InvalidJobKey(s.to_string()))?;
        let number = number.parse().map_err(|_| InvalidJobKey(s.to_string()))?;
        Ok(Self::new(repo_external_id, number))
    }
}

impl TryFrom<String> for JobKey {
    type Error = InvalidJobKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobKey> for String {
    fn from(key: JobKey) -> Self {
        key.to_string()
    }
}
