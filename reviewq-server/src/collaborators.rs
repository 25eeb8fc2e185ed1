//! The external collaborators a worker drives: where changes come from, what
//! analyses them, and where results go.
//!
//! Errors are `anyhow` on purpose: the worker records whatever went wrong on
//! the job and fails the lease, it never branches on the cause.

use anyhow::Result;
use async_trait::async_trait;
use reviewq_core::{Analysis, ChangeMetadata, ChangedFile, FetchedChange, OpenAIClient};

/// The repository a job works against, with the handle needed to act on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    pub installation_id: u64,
}

impl RepoRef {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn fetch_change(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoRef,
        number: u64,
    ) -> Result<FetchedChange>;
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        correlation_id: Option<&str>,
        metadata: &ChangeMetadata,
        files: &[ChangedFile],
    ) -> Result<Analysis>;
}

#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish_result(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoRef,
        number: u64,
        rendered: &str,
    ) -> Result<()>;
}

#[async_trait]
impl Analyzer for OpenAIClient {
    async fn analyze(
        &self,
        correlation_id: Option<&str>,
        metadata: &ChangeMetadata,
        files: &[ChangedFile],
    ) -> Result<Analysis> {
        OpenAIClient::analyze(self, correlation_id, metadata, files).await
    }
}
