use anyhow::{anyhow, Context, Result};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::correlation::{create_http_client, CORRELATION_ID_HEADER};
use crate::review::{create_user_prompt, get_system_prompt, Analysis, ChangeMetadata, ChangedFile};

pub const DEFAULT_MODEL: &str = "gpt-5";

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Async OpenAI client that asks the model for a structured review.
#[derive(Clone)]
pub struct OpenAIClient {
    client: ClientWithMiddleware,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    pub json_schema: JsonSchema,
}

#[derive(Debug, Serialize)]
pub struct JsonSchema {
    pub name: String,
    pub strict: bool,
    pub schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: ChatResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponseMessage {
    pub content: Option<String>,
    pub refusal: Option<String>,
}

impl OpenAIClient {
    pub fn new(api_key: String, model: Option<String>) -> Result<Self> {
        let client = create_http_client("reviewq/0.1.0")?;
        Ok(Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the client at an API-compatible endpoint.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// JSON schema the model must answer with. Strict mode requires every
    /// property to be listed as required, so `line` is nullable instead.
    pub fn create_response_format() -> ResponseFormat {
        ResponseFormat {
            format_type: "json_schema".to_string(),
            json_schema: JsonSchema {
                name: "code_review".to_string(),
                strict: true,
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "summary": { "type": "string" },
                        "issues": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "path": { "type": "string" },
                                    "line": { "type": ["integer", "null"] },
                                    "severity": {
                                        "type": "string",
                                        "enum": ["critical", "major", "minor", "nit"]
                                    },
                                    "message": { "type": "string" }
                                },
                                "required": ["path", "line", "severity", "message"],
                                "additionalProperties": false
                            }
                        }
                    },
                    "required": ["summary", "issues"],
                    "additionalProperties": false
                }),
            },
        }
    }

    pub fn create_request(&self, metadata: &ChangeMetadata, files: &[ChangedFile]) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "developer".to_string(),
                    content: get_system_prompt(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: create_user_prompt(metadata, files),
                },
            ],
            response_format: Self::create_response_format(),
        }
    }

    pub async fn analyze(
        &self,
        correlation_id: Option<&str>,
        metadata: &ChangeMetadata,
        files: &[ChangedFile],
    ) -> Result<Analysis> {
        let url = format!("{}/chat/completions", self.base_url);
        let request_body = self.create_request(metadata, files);

        info!(
            "Requesting analysis of {} #{} ({} files) from {}",
            metadata.repo_full_name,
            metadata.number,
            files.len(),
            self.model
        );

        let mut request_builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&request_body)?);

        if let Some(cid) = correlation_id {
            request_builder = request_builder.header(CORRELATION_ID_HEADER, cid);
        }

        let response = request_builder
            .send()
            .await
            .context("Failed to send chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            error!("OpenAI API error: {} - {}", status, error_text);
            return Err(anyhow!("OpenAI API error: {} - {}", status, error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        parse_completion(completion)
    }
}

/// Extract and validate the structured review from a completion.
pub fn parse_completion(completion: ChatCompletionResponse) -> Result<Analysis> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Completion {} has no choices", completion.id))?;

    if let Some(refusal) = choice.message.refusal {
        return Err(anyhow!("Model refused to review: {}", refusal));
    }

    if choice.finish_reason.as_deref() == Some("length") {
        return Err(anyhow!(
            "Completion {} was truncated before the review finished",
            completion.id
        ));
    }

    let content = choice
        .message
        .content
        .ok_or_else(|| anyhow!("Completion {} has no content", completion.id))?;

    serde_json::from_str(&content).context("Model output does not match the review schema")
}
