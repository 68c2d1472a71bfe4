//! Artifact extraction and conversation bookkeeping.

use tracing::{debug, error, warn};

use super::prompts::file_commit_retry_prompt;
use super::PhaseEngine;
use crate::agent::ConversationMessage;
use crate::error::ArenaResult;
use crate::state::{sanitize_filename_component, write_atomic, RunState};

pub const CONVERSATIONS_DIR: &str = "conversations";

/// Sum of per-message token usage.
pub fn conversation_tokens(messages: &[ConversationMessage]) -> u64 {
    messages.iter().map(ConversationMessage::total_tokens).sum()
}

impl PhaseEngine {
    /// Read one committed file from the alias's branch.
    pub(super) async fn fetch_artifact(
        &self,
        state: &RunState,
        alias: &str,
        path: &str,
    ) -> Option<String> {
        let Some(branch) = state.branch_names.get(alias) else {
            debug!(alias, "No branch recorded; cannot fetch artifact");
            return None;
        };
        self.artifacts.fetch(&state.config.repo, branch, path).await
    }

    /// Read a committed file, re-prompting the agent to commit it when absent.
    ///
    /// Gives up after the configured number of re-prompts and returns `None`;
    /// transport failures while re-prompting abort the step.
    pub(super) async fn fetch_with_retry(
        &self,
        state: &RunState,
        alias: &str,
        path: &str,
        commit_desc: &str,
    ) -> ArenaResult<Option<String>> {
        if let Some(content) = self.fetch_artifact(state, alias, path).await {
            return Ok(Some(content));
        }
        let (Some(_), Some(handle)) = (state.branch_names.get(alias), state.agent_handles.get(alias))
        else {
            return Ok(None);
        };

        let attempts = self.settings.artifact_retries;
        for attempt in 1..=attempts {
            warn!(
                agent = %state.label(alias),
                path,
                attempt,
                max = attempts,
                "Artifact not found on branch; re-prompting"
            );
            let watermark = self.coordinator.message_count(handle).await?;
            self.coordinator
                .follow_up(handle, &file_commit_retry_prompt(path, commit_desc))
                .await?;
            self.coordinator.wait_for_follow_up(handle, watermark).await?;

            if let Some(content) = self.fetch_artifact(state, alias, path).await {
                return Ok(Some(content));
            }
        }

        error!(agent = %state.label(alias), path, attempts, "Artifact never committed");
        Ok(None)
    }

    /// Refresh token usage and the on-disk transcript for `alias`.
    pub(super) async fn record_conversation(
        &self,
        state: &mut RunState,
        alias: &str,
    ) -> ArenaResult<()> {
        let Some(handle) = state.agent_handles.get(alias) else {
            return Ok(());
        };
        let messages = self.coordinator.conversation(handle).await?;

        let total = conversation_tokens(&messages);
        if total > 0 {
            state.token_usage.insert(alias.to_string(), total);
        }

        let model = state
            .alias_mapping
            .get(alias)
            .map(String::as_str)
            .unwrap_or(alias);
        let path = self
            .store
            .run_dir()
            .join(CONVERSATIONS_DIR)
            .join(format!("{}.json", sanitize_filename_component(model)));
        let body = serde_json::to_vec_pretty(&messages)?;
        match write_atomic(&path, &body) {
            Ok(()) => debug!(model, messages = messages.len(), "Saved conversation"),
            Err(e) => warn!(model, path = %path.display(), error = %e, "Failed to save conversation"),
        }
        Ok(())
    }

    /// Copy the agent's status summary into state. Best effort.
    pub(super) async fn capture_summary(&self, state: &mut RunState, alias: &str) {
        let Some(handle) = state.agent_handles.get(alias) else {
            return;
        };
        match self.coordinator.status(handle).await {
            Ok(info) => {
                if let Some(summary) = info.summary.filter(|s| !s.trim().is_empty()) {
                    state.agent_summaries.insert(alias.to_string(), summary);
                }
            }
            Err(e) => debug!(alias, error = %e, "Failed to capture agent summary"),
        }
    }
}
