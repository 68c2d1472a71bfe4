//! HTTP client for the cloud agents service.
//!
//! Basic auth with the API key as username and an empty password. One pooled
//! `reqwest::Client` serves every call, each bounded by a per-request timeout.

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::retry::{with_retry, RetryPolicy};
use super::transport::{
    AgentSnapshot, AgentTransport, ConversationMessage, LaunchRequest, LaunchedAgent,
};
use crate::config::EngineSettings;
use crate::error::{ArenaError, ArenaResult};

#[derive(Debug, Default, Deserialize)]
struct TargetDto {
    #[serde(default, alias = "branch_name", rename = "branchName")]
    branch_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LaunchDto {
    id: String,
    #[serde(default, alias = "branch_name", rename = "branchName")]
    branch_name: Option<String>,
    #[serde(default)]
    target: Option<TargetDto>,
}

#[derive(Debug, Deserialize)]
struct StatusDto {
    status: String,
    #[serde(default)]
    target: Option<TargetDto>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConversationDto {
    #[serde(default)]
    messages: Vec<ConversationMessage>,
}

/// Expand `owner/repo` shorthand to a GitHub URL.
pub fn repository_url(repo: &str) -> String {
    if repo.starts_with("https://") {
        repo.to_string()
    } else {
        format!("https://github.com/{repo}")
    }
}

/// Cloud agents API client.
pub struct CloudAgentsClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl CloudAgentsClient {
    pub fn new(api_key: impl Into<String>, settings: &EngineSettings) -> ArenaResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| ArenaError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            retry: RetryPolicy::from_settings(settings),
        })
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> ArenaResult<String> {
        let mut request = self
            .client
            .request(method, url)
            .basic_auth(&self.api_key, Some(""));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ArenaError::Http {
                status: status.as_u16(),
                url: url.to_string(),
                body: text,
            });
        }
        Ok(text)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ArenaResult<T> {
        let url = self.url(path);
        let what = format!("{method} {path}");
        let text = with_retry(&self.retry, &what, || {
            self.send_once(method.clone(), &url, body.as_ref())
        })
        .await?;
        debug!(request = %what, bytes = text.len(), "Agent service responded");
        if text.trim().is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl AgentTransport for CloudAgentsClient {
    async fn launch(&self, request: &LaunchRequest) -> ArenaResult<LaunchedAgent> {
        let mut body = json!({
            "prompt": { "text": request.prompt },
            "source": {
                "repository": repository_url(&request.repository),
                "ref": request.base_ref,
            },
        });
        if let Some(model) = &request.model {
            body["model"] = json!(model);
        }
        let dto: LaunchDto = self.request(Method::POST, "/agents", Some(body)).await?;
        let branch_hint = dto
            .branch_name
            .or_else(|| dto.target.and_then(|t| t.branch_name));
        Ok(LaunchedAgent {
            handle: dto.id,
            branch_hint,
        })
    }

    async fn follow_up(&self, handle: &str, prompt: &str) -> ArenaResult<()> {
        let body = json!({ "prompt": { "text": prompt } });
        let _: serde_json::Value = self
            .request(Method::POST, &format!("/agents/{handle}/followup"), Some(body))
            .await?;
        Ok(())
    }

    async fn status(&self, handle: &str) -> ArenaResult<AgentSnapshot> {
        let dto: StatusDto = self
            .request(Method::GET, &format!("/agents/{handle}"), None)
            .await?;
        Ok(AgentSnapshot {
            status: dto.status,
            branch_name: dto.target.and_then(|t| t.branch_name),
            summary: dto.summary,
        })
    }

    async fn conversation(&self, handle: &str) -> ArenaResult<Vec<ConversationMessage>> {
        let dto: ConversationDto = self
            .request(Method::GET, &format!("/agents/{handle}/conversation"), None)
            .await?;
        Ok(dto.messages)
    }
}
