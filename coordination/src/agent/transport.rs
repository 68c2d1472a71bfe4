//! Transport seam between the coordinator and the remote agent service.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ArenaError, ArenaResult};

/// Lifecycle status reported by a remote agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentStatus {
    Creating,
    Running,
    Finished,
}

impl AgentStatus {
    /// Parse a wire status. Anything outside the known set is a protocol error.
    pub fn parse(handle: &str, raw: &str) -> ArenaResult<Self> {
        match raw {
            "CREATING" => Ok(Self::Creating),
            "RUNNING" => Ok(Self::Running),
            "FINISHED" => Ok(Self::Finished),
            other => Err(ArenaError::UnexpectedStatus {
                handle: handle.to_string(),
                status: other.to_string(),
            }),
        }
    }

    pub fn is_working(self) -> bool {
        matches!(self, Self::Creating | Self::Running)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "CREATING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Finished => write!(f, "FINISHED"),
        }
    }
}

/// Parameters for starting a new agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub prompt: String,
    pub repository: String,
    pub base_ref: String,
    /// Full model identifier; `None` lets the service pick.
    pub model: Option<String>,
}

/// Result of a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedAgent {
    pub handle: String,
    pub branch_hint: Option<String>,
}

/// Raw status payload. `status` is unparsed so the coordinator decides what
/// counts as a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentSnapshot {
    pub status: String,
    pub branch_name: Option<String>,
    pub summary: Option<String>,
}

/// Token accounting attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageUsage {
    #[serde(default)]
    pub total_tokens: u64,
}

/// One conversation entry. Accepts both `type`/`text` and `role`/`content`
/// shapes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConversationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<MessageUsage>,
}

impl ConversationMessage {
    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            kind: Some("assistant_message".to_string()),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            kind: Some("user_message".to_string()),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn is_agent_authored(&self) -> bool {
        self.kind.as_deref() == Some("assistant_message")
            || self.role.as_deref() == Some("assistant")
    }

    pub fn body(&self) -> &str {
        self.text
            .as_deref()
            .or(self.content.as_deref())
            .unwrap_or_default()
    }

    pub fn total_tokens(&self) -> u64 {
        self.usage.map(|u| u.total_tokens).unwrap_or(0)
    }
}

/// Whether the conversation grew past `watermark` and ends with an agent reply.
pub fn has_reply_after(messages: &[ConversationMessage], watermark: usize) -> bool {
    messages.len() > watermark
        && messages
            .last()
            .map(ConversationMessage::is_agent_authored)
            .unwrap_or(false)
}

/// Remote agent service.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> ArenaResult<LaunchedAgent>;

    async fn follow_up(&self, handle: &str, prompt: &str) -> ArenaResult<()>;

    async fn status(&self, handle: &str) -> ArenaResult<AgentSnapshot>;

    async fn conversation(&self, handle: &str) -> ArenaResult<Vec<ConversationMessage>>;
}
