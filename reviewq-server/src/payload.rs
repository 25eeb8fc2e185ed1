//! Inbound pull request payloads, validated into explicit structs.
//!
//! The wire types mirror the subset of GitHub's `pull_request` webhook body
//! that the pipeline reads, with everything optional so that missing fields
//! surface as a `PayloadError` naming the field rather than a serde message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::JobKey;
use crate::store::{ChangeRequestState, ChangeRequestUpsert, RepositoryUpsert};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is missing {0}")]
    MissingField(&'static str),

    #[error("payload field {field} is invalid: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct ActionOnly {
    action: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WirePayload {
    action: Option<String>,
    pull_request: Option<WirePullRequest>,
    repository: Option<WireRepository>,
    installation: Option<WireInstallation>,
}

#[derive(Debug, Deserialize)]
struct WireInstallation {
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WirePullRequest {
    number: Option<u64>,
    title: Option<String>,
    user: Option<WireUser>,
    state: Option<String>,
    merged: Option<bool>,
    head: Option<WireRef>,
}

#[derive(Debug, Deserialize)]
struct WireRef {
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRepository {
    id: Option<u64>,
    name: Option<String>,
    owner: Option<WireUser>,
}

#[derive(Debug, Deserialize)]
struct WireUser {
    login: Option<String>,
}

/// A validated `pull_request` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestEvent {
    pub action: String,
    pub repo_external_id: u64,
    pub repo_owner: String,
    pub repo_name: String,
    pub installation_id: u64,
    pub number: u64,
    pub title: String,
    pub author: String,
    pub state: ChangeRequestState,
    pub head_sha: String,
}

/// What ingestion hands to the workers through the queue.
///
/// Carries everything needed to fetch the change without another store
/// lookup. The job itself is found through the lease's key, and the head
/// commit is read live from the change source. `delivery_id` is the webhook
/// delivery that last touched the entry and doubles as the correlation id
/// for outgoing calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewPayload {
    pub repo_owner: String,
    pub repo_name: String,
    pub installation_id: u64,
    pub number: u64,
    pub delivery_id: Option<String>,
}

impl ReviewPayload {
    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}

/// Read just the `action` field, for classification ahead of full parsing.
pub fn peek_action(body: &[u8]) -> Result<Option<String>, PayloadError> {
    serde_json::from_slice::<ActionOnly>(body)
        .map(|a| a.action)
        .map_err(|e| PayloadError::InvalidJson(e.to_string()))
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, PayloadError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(PayloadError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        }),
        None => Err(PayloadError::MissingField(field)),
    }
}

fn change_request_state(
    state: Option<String>,
    merged: Option<bool>,
) -> Result<ChangeRequestState, PayloadError> {
    let state = state.ok_or(PayloadError::MissingField("pull_request.state"))?;
    match (state.as_str(), merged.unwrap_or(false)) {
        ("open", _) => Ok(ChangeRequestState::Open),
        ("closed", true) => Ok(ChangeRequestState::Merged),
        ("closed", false) => Ok(ChangeRequestState::Closed),
        (other, _) => Err(PayloadError::InvalidField {
            field: "pull_request.state",
            reason: format!("unknown state '{}'", other),
        }),
    }
}

impl PullRequestEvent {
    pub fn parse(body: &[u8]) -> Result<Self, PayloadError> {
        let wire: WirePayload =
            serde_json::from_slice(body).map_err(|e| PayloadError::InvalidJson(e.to_string()))?;

        let action = non_empty(wire.action, "action")?;

        let repository = wire
            .repository
            .ok_or(PayloadError::MissingField("repository"))?;
        let repo_external_id = repository
            .id
            .ok_or(PayloadError::MissingField("repository.id"))?;
        let repo_name = non_empty(repository.name, "repository.name")?;
        let repo_owner = non_empty(
            repository.owner.and_then(|o| o.login),
            "repository.owner.login",
        )?;

        let installation_id = wire
            .installation
            .and_then(|i| i.id)
            .ok_or(PayloadError::MissingField("installation.id"))?;

        let pr = wire
            .pull_request
            .ok_or(PayloadError::MissingField("pull_request"))?;
        let number = pr
            .number
            .ok_or(PayloadError::MissingField("pull_request.number"))?;
        let title = pr.title.unwrap_or_default();
        let author = non_empty(pr.user.and_then(|u| u.login), "pull_request.user.login")?;
        let state = change_request_state(pr.state, pr.merged)?;
        let head_sha = non_empty(pr.head.and_then(|h| h.sha), "pull_request.head.sha")?;
        if !head_sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(PayloadError::InvalidField {
                field: "pull_request.head.sha",
                reason: "not a hex commit id".to_string(),
            });
        }

        Ok(Self {
            action,
            repo_external_id,
            repo_owner,
            repo_name,
            installation_id,
            number,
            title,
            author,
            state,
            head_sha,
        })
    }

    pub fn job_key(&self) -> JobKey {
        JobKey::new(self.repo_external_id, self.number)
    }

    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }

    pub fn repository_upsert(&self) -> RepositoryUpsert {
        RepositoryUpsert {
            external_id: self.repo_external_id,
            owner: self.repo_owner.clone(),
            name: self.repo_name.clone(),
            installation_id: Some(self.installation_id),
        }
    }

    pub fn review_payload(&self, delivery_id: Option<String>) -> ReviewPayload {
        ReviewPayload {
            repo_owner: self.repo_owner.clone(),
            repo_name: self.repo_name.clone(),
            installation_id: self.installation_id,
            number: self.number,
            delivery_id,
        }
    }

    pub fn change_request_upsert(&self) -> ChangeRequestUpsert {
        ChangeRequestUpsert {
            number: self.number,
            title: self.title.clone(),
            author: self.author.clone(),
            state: self.state,
            head_sha: self.head_sha.clone(),
        }
    }
}
