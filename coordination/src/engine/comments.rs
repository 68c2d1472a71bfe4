//! Operator comments queued between steps.
//!
//! `arena add-comment` appends to `<run>/pending-comments.json`; the next step
//! delivers every queued comment before running its phase, waits for the
//! replies, and deletes the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::prompts::operator_prompt;
use super::PhaseEngine;
use crate::error::ArenaResult;
use crate::state::{write_atomic, ProgressStatus, RunState};

pub const PENDING_COMMENTS_FILE: &str = "pending-comments.json";

fn default_wrapped() -> bool {
    true
}

/// One queued operator message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingComment {
    pub message: String,
    /// Prefix the operator preamble. `false` sends the message verbatim.
    #[serde(default = "default_wrapped")]
    pub wrapped: bool,
    /// Aliases to deliver to; `None` means every agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<String>>,
}

impl PendingComment {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            wrapped: true,
            targets: None,
        }
    }

    fn prompt(&self) -> String {
        if self.wrapped {
            operator_prompt(&self.message)
        } else {
            self.message.clone()
        }
    }
}

pub fn pending_comments_path(run_dir: &Path) -> PathBuf {
    run_dir.join(PENDING_COMMENTS_FILE)
}

/// Queued comments. A malformed sidecar is skipped with a warning.
pub fn read_pending_comments(run_dir: &Path) -> ArenaResult<Vec<PendingComment>> {
    let path = pending_comments_path(run_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = std::fs::read_to_string(&path)?;
    match serde_json::from_str(&text) {
        Ok(comments) => Ok(comments),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Malformed pending comments; skipping");
            Ok(Vec::new())
        }
    }
}

/// Queue a comment for delivery on the next step.
pub fn append_comment(run_dir: &Path, comment: PendingComment) -> ArenaResult<usize> {
    let mut comments = read_pending_comments(run_dir)?;
    comments.push(comment);
    let body = serde_json::to_vec_pretty(&comments)?;
    write_atomic(&pending_comments_path(run_dir), &body)?;
    Ok(comments.len())
}

impl PhaseEngine {
    /// Deliver queued comments, wait for every reply, then drop the sidecar.
    /// Returns the number of comments delivered.
    pub(super) async fn deliver_pending_comments(&self, state: &mut RunState) -> ArenaResult<usize> {
        let comments = read_pending_comments(self.store.run_dir())?;
        if comments.is_empty() {
            return Ok(0);
        }

        let all: Vec<String> = state.aliases().cloned().collect();
        // One wait per alias; the first watermark is the one that matters.
        let mut pending: BTreeMap<String, (String, usize)> = BTreeMap::new();
        let mut delivered = 0;

        for comment in &comments {
            if comment.message.trim().is_empty() {
                continue;
            }
            let targets = comment.targets.as_ref().unwrap_or(&all);
            let prompt = comment.prompt();
            for alias in targets {
                let Some(handle) = state.agent_handles.get(alias) else {
                    warn!(alias = %alias, "Cannot deliver comment; agent not launched");
                    continue;
                };
                let watermark = self.coordinator.message_count(handle).await?;
                info!(agent = %state.label(alias), "Delivering operator comment");
                self.coordinator.follow_up(handle, &prompt).await?;
                pending
                    .entry(alias.clone())
                    .or_insert((handle.clone(), watermark));
            }
            delivered += 1;
        }

        if !pending.is_empty() {
            let waits: Vec<(String, usize)> = pending.values().cloned().collect();
            self.coordinator.wait_for_all_follow_ups(&waits).await?;
            for (alias, (handle, before)) in &pending {
                self.record_conversation(state, alias).await?;
                // A SENT prompt that never landed must still look unlanded.
                if state.progress(alias) == ProgressStatus::Sent
                    && state.sent_watermarks.get(alias) == Some(before)
                {
                    let after = self.coordinator.message_count(handle).await?;
                    info!(
                        agent = %state.label(alias),
                        watermark = after,
                        "Moved SENT watermark past comment reply"
                    );
                    state.sent_watermarks.insert(alias.clone(), after);
                }
            }
        }

        let path = pending_comments_path(self.store.run_dir());
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove pending comments");
        }
        if delivered > 0 {
            info!(delivered, "Delivered queued operator comments");
            self.store.save(state)?;
        }
        Ok(delivered)
    }
}
