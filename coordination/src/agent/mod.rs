//! Remote agent plumbing
//!
//! - [`transport`]: the [`AgentTransport`] seam and wire-level types
//! - [`http`]: reqwest implementation against the cloud agents API
//! - [`retry`]: bounded exponential backoff for transient failures
//! - [`coordinator`]: launch/follow-up calls and the completion waits
//! - [`repo`]: reading committed artifacts back from agent branches

pub mod coordinator;
pub mod http;
pub mod repo;
pub mod retry;
pub mod transport;

pub use coordinator::{AgentCoordinator, AgentInfo, WaitSettings};
pub use http::{repository_url, CloudAgentsClient};
pub use repo::{default_repo_from_remote, parse_repo_owner_name, ArtifactSource, GhCliSource};
pub use retry::{with_retry, RetryPolicy};
pub use transport::{
    has_reply_after, AgentSnapshot, AgentStatus, AgentTransport, ConversationMessage,
    LaunchRequest, LaunchedAgent, MessageUsage,
};
