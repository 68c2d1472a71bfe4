//! Reading committed artifacts from agent branches.
//!
//! Agents commit their output files to their own branch; the engine reads
//! them back through [`ArtifactSource`]. The default source shells out to the
//! `gh` CLI so authentication stays in its credential store.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ArenaError, ArenaResult};

/// Where committed artifacts are read from.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Content of `path` on `branch`, or `None` when absent or unreadable.
    async fn fetch(&self, repo: &str, branch: &str, path: &str) -> Option<String>;
}

/// Split a repository reference into `(owner, name)`.
///
/// Accepts `owner/repo`, `https://github.com/owner/repo[.git]` and
/// `git@github.com:owner/repo.git`.
pub fn parse_repo_owner_name(repo: &str) -> ArenaResult<(String, String)> {
    let trimmed = repo.trim().trim_end_matches('/');
    let url = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    let pair = |path: &str| -> Option<(String, String)> {
        let mut parts = path.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(o), Some(n), None) if !o.is_empty() && !n.is_empty() => {
                Some((o.to_string(), n.to_string()))
            }
            _ => None,
        }
    };

    let parsed = if let Some(rest) = url.strip_prefix("https://") {
        let mut segments = rest.splitn(2, '/');
        match (segments.next(), segments.next()) {
            (Some("github.com" | "www.github.com"), Some(path)) => {
                let mut it = path.split('/');
                match (it.next(), it.next()) {
                    (Some(o), Some(n)) if !o.is_empty() && !n.is_empty() => {
                        Some((o.to_string(), n.to_string()))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    } else if let Some(rest) = url.strip_prefix("git@") {
        rest.split_once(':').and_then(|(_, path)| pair(path))
    } else {
        pair(url)
    };

    parsed.ok_or_else(|| {
        ArenaError::config(format!(
            "expected 'owner/repo' or 'https://github.com/owner/repo', got '{repo}'"
        ))
    })
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Decode the base64 `content` field of a contents API response.
pub fn decode_contents(payload: &str) -> Option<String> {
    let response: ContentsResponse = serde_json::from_str(payload).ok()?;
    let encoded: String = response
        .content?
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let bytes = STANDARD.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// Reads files through `gh api /repos/{owner}/{repo}/contents/{path}`.
#[derive(Debug, Clone)]
pub struct GhCliSource {
    timeout: Duration,
}

impl GhCliSource {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for GhCliSource {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl ArtifactSource for GhCliSource {
    async fn fetch(&self, repo: &str, branch: &str, path: &str) -> Option<String> {
        let (owner, name) = match parse_repo_owner_name(repo) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(repo, error = %e, "Cannot fetch artifact from unparseable repository");
                return None;
            }
        };
        let endpoint = format!("/repos/{owner}/{name}/contents/{path}");
        let git_ref = format!("ref={branch}");
        let mut cmd = Command::new("gh");
        cmd.args(["api", "-X", "GET", endpoint.as_str(), "-f", git_ref.as_str()])
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(path, branch, error = %e, "Failed to run gh");
                return None;
            }
            Err(_) => {
                warn!(path, branch, timeout_secs = self.timeout.as_secs(), "gh api timed out");
                return None;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("404") || stderr.contains("Not Found") {
                debug!(path, branch, "Artifact not committed yet");
            } else {
                warn!(path, branch, stderr = %stderr.trim(), "gh api failed");
            }
            return None;
        }

        let decoded = decode_contents(&String::from_utf8_lossy(&output.stdout));
        if decoded.is_none() {
            warn!(path, branch, "gh api returned an undecodable payload");
        }
        decoded
    }
}

/// `owner/repo` of the current checkout's `origin` remote.
pub async fn default_repo_from_remote() -> Option<String> {
    let output = Command::new("git")
        .args(["remote", "get-url", "origin"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
    parse_repo_owner_name(&url)
        .ok()
        .map(|(owner, name)| format!("{owner}/{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(o: &str, n: &str) -> (String, String) {
        (o.to_string(), n.to_string())
    }

    #[test]
    fn test_parse_shorthand() {
        assert_eq!(parse_repo_owner_name("octo/widgets").unwrap(), pair("octo", "widgets"));
    }

    #[test]
    fn test_parse_https() {
        assert_eq!(
            parse_repo_owner_name("https://github.com/octo/widgets.git").unwrap(),
            pair("octo", "widgets")
        );
        assert_eq!(
            parse_repo_owner_name("https://github.com/octo/widgets/").unwrap(),
            pair("octo", "widgets")
        );
        assert!(parse_repo_owner_name("https://gitlab.com/octo/widgets").is_err());
    }

    #[test]
    fn test_parse_ssh() {
        assert_eq!(
            parse_repo_owner_name("git@github.com:octo/widgets.git").unwrap(),
            pair("octo", "widgets")
        );
        assert!(parse_repo_owner_name("git@github.com:widgets").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_repo_owner_name("widgets").is_err());
        assert!(parse_repo_owner_name("a/b/c").is_err());
        assert!(parse_repo_owner_name("/widgets").is_err());
    }

    #[test]
    fn test_decode_contents() {
        // "## PLAN\n" split across lines the way the API wraps base64.
        let payload = r#"{"name": "x.md", "content": "IyMgUExB\nTgo=\n", "encoding": "base64"}"#;
        assert_eq!(decode_contents(payload).as_deref(), Some("## PLAN\n"));
        assert_eq!(decode_contents(r#"{"message": "Not Found"}"#), None);
        assert_eq!(decode_contents("not json"), None);
    }
}
