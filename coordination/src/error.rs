//! Arena error types
//!
//! Every fallible operation in the crate returns [`ArenaResult`]. Errors are
//! grouped by how the engine reacts to them:
//!
//! - transport errors: retryable ones are absorbed by the retry layer,
//!   everything else aborts the current step
//! - protocol errors: an agent reported a status outside the known set
//! - precondition errors: the caller asked for something the run cannot do
//! - storage errors: the state document could not be read or written

use std::path::PathBuf;

use thiserror::Error;

use crate::state::Phase;

/// Result type alias for arena operations
pub type ArenaResult<T> = Result<T, ArenaError>;

/// HTTP statuses worth another attempt.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Errors that can occur while driving an arena
#[derive(Error, Debug)]
pub enum ArenaError {
    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------
    /// Non-success HTTP response from the agent service
    #[error("HTTP {status} from {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },

    /// Connection refused, reset, or timed out before a response arrived
    #[error("Connection to {url} failed: {message}")]
    Connection { url: String, message: String },

    /// Request could not be built or the response body was unreadable
    #[error("Agent request failed: {0}")]
    Request(String),

    // ------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------
    /// Agent reported a status outside CREATING/RUNNING/FINISHED
    #[error("Agent {handle} reported unexpected status {status}")]
    UnexpectedStatus { handle: String, status: String },

    /// Polling deadline elapsed before the agents finished
    #[error("Timed out after {timeout_secs}s waiting for agents: {}", handles.join(", "))]
    Timeout {
        handles: Vec<String>,
        timeout_secs: u64,
    },

    /// Agent finished without replying to the last follow-up
    #[error(
        "Agent {handle} finished without replying (grace {grace_secs}s, watermark {watermark}, observed {observed})"
    )]
    GraceExpired {
        handle: String,
        grace_secs: u64,
        watermark: usize,
        observed: usize,
    },

    // ------------------------------------------------------------------
    // Preconditions
    // ------------------------------------------------------------------
    /// No state document at the given run directory
    #[error("No arena state found in {path}")]
    StateNotFound { path: PathBuf },

    /// The run already finished; reopen it to continue
    #[error("Arena already completed")]
    AlreadyCompleted,

    /// The dispatcher was handed a phase that has no work
    #[error("Phase {0} has no step to execute")]
    TerminalPhase(Phase),

    /// A follow-up was requested for an alias that was never launched
    #[error("No agent handle recorded for {alias}")]
    MissingHandle { alias: String },

    /// Invalid run configuration or engine settings
    #[error("Invalid configuration: {0}")]
    Config(String),

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------
    /// State document written by a newer release
    #[error("State document version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// State document parsed but its contents are inconsistent
    #[error("Malformed state document: {0}")]
    MalformedState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArenaError {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a malformed-state error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedState(message.into())
    }

    /// Whether the retry layer should try the request again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => RETRYABLE_STATUSES.contains(status),
            Self::Connection { .. } => true,
            _ => false,
        }
    }

    /// Whether the error reflects caller misuse rather than a failure.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::StateNotFound { .. }
                | Self::AlreadyCompleted
                | Self::TerminalPhase(_)
                | Self::Config(_)
        )
    }
}

impl From<reqwest::Error> for ArenaError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        // A dropped connection or truncated body carries no status.
        let transport_failure = (err.is_request() || err.is_body()) && err.status().is_none();
        if err.is_connect() || err.is_timeout() || transport_failure {
            Self::Connection {
                url,
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                url,
                body: err.to_string(),
            }
        } else {
            Self::Request(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> ArenaError {
        ArenaError::Http {
            status,
            url: "https://agents.test/v0/agents".into(),
            body: String::new(),
        }
    }

    #[test]
    fn test_retryable_statuses() {
        for status in RETRYABLE_STATUSES {
            assert!(http(status).is_retryable(), "{status} should retry");
        }
        for status in [400, 401, 403, 404, 409, 422, 501] {
            assert!(!http(status).is_retryable(), "{status} should not retry");
        }
    }

    #[test]
    fn test_connection_is_retryable() {
        let err = ArenaError::Connection {
            url: "https://agents.test".into(),
            message: "connection reset".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_protocol_errors_are_fatal() {
        let err = ArenaError::UnexpectedStatus {
            handle: "bc-1".into(),
            status: "EXPIRED".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_precondition());
        assert!(err.to_string().contains("EXPIRED"));
    }

    #[test]
    fn test_precondition_classification() {
        assert!(ArenaError::AlreadyCompleted.is_precondition());
        assert!(ArenaError::StateNotFound {
            path: PathBuf::from("arenas/0001")
        }
        .is_precondition());
        assert!(ArenaError::TerminalPhase(Phase::Done).is_precondition());
        assert!(!http(500).is_precondition());
    }

    #[test]
    fn test_timeout_message_lists_handles() {
        let err = ArenaError::Timeout {
            handles: vec!["bc-1".into(), "bc-2".into()],
            timeout_secs: 600,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 600s waiting for agents: bc-1, bc-2"
        );
    }
}
