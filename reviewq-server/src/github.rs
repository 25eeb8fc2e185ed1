use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use reviewq_core::{
    create_http_client, ChangeMetadata, ChangedFile, FetchedChange, FileStatus,
    CORRELATION_ID_HEADER,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::collaborators::{ChangeSource, RepoRef, ResultPublisher};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = "reviewq/0.1.0";
const FILES_PER_PAGE: usize = 100;
/// GitHub stops listing pull request files after 3000 entries.
const MAX_FILE_PAGES: usize = 30;

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    app_id: u64,
    private_key: String,
    api_base: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, DateTime<Utc>)>>>,
}

#[derive(Debug, Serialize)]
pub struct CreateCommentRequest {
    pub body: String,
}

#[derive(Debug, Deserialize)]
pub struct Comment {
    pub id: u64,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestResponse {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub user: UserResponse,
    pub html_url: Option<String>,
    pub head: PullRequestRefResponse,
    pub base: PullRequestRefResponse,
}

#[derive(Debug, Deserialize)]
pub struct UserResponse {
    pub login: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestRefResponse {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestFileResponse {
    pub filename: String,
    pub status: String,
    pub additions: u32,
    pub deletions: u32,
    pub patch: Option<String>,
    pub previous_filename: Option<String>,
}

/// Cached installation tokens are reused until five minutes before expiry.
fn token_is_fresh(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at - now > Duration::minutes(5)
}

fn to_changed_file(file: PullRequestFileResponse) -> Result<ChangedFile> {
    let status = FileStatus::parse(&file.status)
        .ok_or_else(|| anyhow!("Unknown status '{}' for file {}", file.status, file.filename))?;
    if file.filename.is_empty() {
        return Err(anyhow!("Changed file with empty path"));
    }
    Ok(ChangedFile {
        path: file.filename,
        status,
        additions: file.additions,
        deletions: file.deletions,
        patch: file.patch,
        previous_path: file.previous_filename,
    })
}

fn to_metadata(repo: &RepoRef, pr: PullRequestResponse) -> ChangeMetadata {
    ChangeMetadata {
        repo_full_name: repo.full_name(),
        number: pr.number,
        title: pr.title,
        author: pr.user.login,
        body: pr.body,
        head_sha: pr.head.sha,
        base_sha: pr.base.sha,
        head_ref: pr.head.ref_name,
        base_ref: pr.base.ref_name,
        html_url: pr.html_url,
    }
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String) -> Result<Self> {
        let client = create_http_client(USER_AGENT)?;
        Ok(Self {
            client,
            app_id,
            private_key,
            api_base: DEFAULT_API_BASE.to_string(),
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Point the client at a GitHub Enterprise (or test) API root.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if token_is_fresh(*expires_at, Utc::now()) {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );

        info!("Requesting new installation access token");

        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github.v3+json");
        let response = send_checked(request, "installation token request").await?;

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        {
            let mut cache = self.token_cache.write().await;
            cache.insert(
                installation_id,
                (token_response.token.clone(), token_response.expires_at),
            );
        }

        Ok(token_response.token)
    }

    async fn authed_get(
        &self,
        correlation_id: Option<&str>,
        installation_id: u64,
        url: &str,
    ) -> Result<RequestBuilder> {
        let token = self.get_installation_token(installation_id).await?;
        let mut request_builder = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json");
        if let Some(cid) = correlation_id {
            request_builder = request_builder.header(CORRELATION_ID_HEADER, cid);
        }
        Ok(request_builder)
    }

    pub async fn get_pull_request(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoRef,
        pr_number: u64,
    ) -> Result<PullRequestResponse> {
        let url = format!(
            "{}/repos/{}/{}/pulls/{}",
            self.api_base, repo.owner, repo.name, pr_number
        );

        info!("Fetching PR #{} from {}", pr_number, repo.full_name());

        let request = self
            .authed_get(correlation_id, repo.installation_id, &url)
            .await?;
        let response = send_checked(request, "get pull request").await?;

        response
            .json()
            .await
            .context("Failed to parse pull request response")
    }

    pub async fn list_pull_request_files(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoRef,
        pr_number: u64,
    ) -> Result<Vec<PullRequestFileResponse>> {
        let mut files = Vec::new();

        for page in 1..=MAX_FILE_PAGES {
            let url = format!(
                "{}/repos/{}/{}/pulls/{}/files?per_page={}&page={}",
                self.api_base, repo.owner, repo.name, pr_number, FILES_PER_PAGE, page
            );
            let request = self
                .authed_get(correlation_id, repo.installation_id, &url)
                .await?;
            let response = send_checked(request, "list pull request files").await?;

            let batch: Vec<PullRequestFileResponse> = response
                .json()
                .await
                .context("Failed to parse pull request files response")?;
            let last_page = batch.len() < FILES_PER_PAGE;
            files.extend(batch);
            if last_page {
                break;
            }
        }

        Ok(files)
    }

    pub async fn post_pr_comment(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoRef,
        pr_number: u64,
        comment_body: &str,
    ) -> Result<Comment> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}/comments",
            self.api_base, repo.owner, repo.name, pr_number
        );

        info!("Posting comment to PR #{} in {}", pr_number, repo.full_name());

        let token = self.get_installation_token(repo.installation_id).await?;
        let request_body = CreateCommentRequest {
            body: comment_body.to_string(),
        };

        let mut request_builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github.v3+json")
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&request_body)?);

        if let Some(cid) = correlation_id {
            request_builder = request_builder.header(CORRELATION_ID_HEADER, cid);
        }

        let response = send_checked(request_builder, "post PR comment").await?;
        let comment: Comment = response
            .json()
            .await
            .context("Failed to parse comment response")?;
        info!("Posted comment with ID: {}", comment.id);

        Ok(comment)
    }
}

async fn send_checked(request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to send {} request", what))?;

    if !response.status().is_success() {
        let status = response.status();
        let error_text = response
            .text()
            .await
            .context("Failed to read error response body")?;
        error!("GitHub API error ({}): {} - {}", what, status, error_text);
        return Err(anyhow!("GitHub API error ({}): {} - {}", what, status, error_text));
    }

    Ok(response)
}

#[async_trait]
impl ChangeSource for GitHubClient {
    async fn fetch_change(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoRef,
        number: u64,
    ) -> Result<FetchedChange> {
        let pr = self.get_pull_request(correlation_id, repo, number).await?;
        let files = self
            .list_pull_request_files(correlation_id, repo, number)
            .await?;

        let changed_files = files
            .into_iter()
            .map(to_changed_file)
            .collect::<Result<Vec<_>>>()?;

        Ok(FetchedChange {
            metadata: to_metadata(repo, pr),
            changed_files,
        })
    }
}

#[async_trait]
impl ResultPublisher for GitHubClient {
    async fn publish_result(
        &self,
        correlation_id: Option<&str>,
        repo: &RepoRef,
        number: u64,
        rendered: &str,
    ) -> Result<()> {
        self.post_pr_comment(correlation_id, repo, number, rendered)
            .await
            .map(|_| ())
    }
}
