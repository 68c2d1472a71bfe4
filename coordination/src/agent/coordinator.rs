//! Agent coordinator: launch, follow-up and completion waiting.
//!
//! Waiting for a follow-up is racy: right after the POST the agent can still
//! read FINISHED from the previous turn. Completion is therefore judged by the
//! conversation, not the status:
//!
//! ```text
//!   conversation.len() > watermark && last message from agent  => done
//!   status RUNNING | CREATING                                  => reset grace
//!   status FINISHED, no growth                                 => start grace
//!   grace elapsed (after one last conversation check)          => GraceExpired
//!   any other status                                           => UnexpectedStatus
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info};

use super::transport::{
    has_reply_after, AgentSnapshot, AgentStatus, AgentTransport, ConversationMessage,
    LaunchRequest, LaunchedAgent,
};
use crate::config::EngineSettings;
use crate::error::{ArenaError, ArenaResult};

/// Parsed status response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub status: AgentStatus,
    pub branch_name: Option<String>,
    pub summary: Option<String>,
}

/// Polling cadence and deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    pub launch_timeout: Duration,
    pub follow_up_timeout: Duration,
    pub grace: Duration,
}

impl From<&EngineSettings> for WaitSettings {
    fn from(s: &EngineSettings) -> Self {
        Self {
            poll_interval: s.poll_interval(),
            launch_timeout: s.launch_timeout(),
            follow_up_timeout: s.follow_up_timeout(),
            grace: s.grace(),
        }
    }
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

/// Per-handle follow-up wait state.
struct FollowUpTracker {
    handle: String,
    watermark: usize,
    grace_deadline: Option<Instant>,
}

impl FollowUpTracker {
    fn new(handle: String, watermark: usize) -> Self {
        Self {
            handle,
            watermark,
            grace_deadline: None,
        }
    }

    /// One poll. `Ok(true)` once the agent has replied.
    async fn poll_once(&mut self, coordinator: &AgentCoordinator) -> ArenaResult<bool> {
        let messages = coordinator.conversation(&self.handle).await?;
        if has_reply_after(&messages, self.watermark) {
            return Ok(true);
        }

        let info = coordinator.status(&self.handle).await?;
        match info.status {
            AgentStatus::Creating | AgentStatus::Running => {
                self.grace_deadline = None;
            }
            AgentStatus::Finished => {
                let now = Instant::now();
                match self.grace_deadline {
                    None => {
                        self.grace_deadline = Some(now + coordinator.wait.grace);
                        debug!(
                            handle = %self.handle,
                            grace_secs = coordinator.wait.grace.as_secs(),
                            "Agent FINISHED with no new messages, starting grace period"
                        );
                    }
                    Some(deadline) if now >= deadline => {
                        let messages = coordinator.conversation(&self.handle).await?;
                        if has_reply_after(&messages, self.watermark) {
                            return Ok(true);
                        }
                        return Err(ArenaError::GraceExpired {
                            handle: self.handle.clone(),
                            grace_secs: coordinator.wait.grace.as_secs(),
                            watermark: self.watermark,
                            observed: messages.len(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(false)
    }
}

/// Front door to the remote agents.
#[derive(Clone)]
pub struct AgentCoordinator {
    transport: Arc<dyn AgentTransport>,
    wait: WaitSettings,
}

impl AgentCoordinator {
    pub fn new(transport: Arc<dyn AgentTransport>, wait: WaitSettings) -> Self {
        Self { transport, wait }
    }

    pub fn wait_settings(&self) -> WaitSettings {
        self.wait
    }

    // ========================================================================
    // Single calls
    // ========================================================================

    /// Start a session on `repo` at `base_ref`.
    pub async fn launch(
        &self,
        prompt: &str,
        repo: &str,
        base_ref: &str,
        model: Option<&str>,
    ) -> ArenaResult<LaunchedAgent> {
        let request = LaunchRequest {
            prompt: prompt.to_string(),
            repository: repo.to_string(),
            base_ref: base_ref.to_string(),
            model: model.map(str::to_string),
        };
        self.transport.launch(&request).await
    }

    pub async fn follow_up(&self, handle: &str, prompt: &str) -> ArenaResult<()> {
        self.transport.follow_up(handle, prompt).await
    }

    /// Current status; an unknown status is a fatal protocol error.
    pub async fn status(&self, handle: &str) -> ArenaResult<AgentInfo> {
        let AgentSnapshot {
            status,
            branch_name,
            summary,
        } = self.transport.status(handle).await?;
        Ok(AgentInfo {
            status: AgentStatus::parse(handle, &status)?,
            branch_name,
            summary,
        })
    }

    pub async fn conversation(&self, handle: &str) -> ArenaResult<Vec<ConversationMessage>> {
        self.transport.conversation(handle).await
    }

    /// Conversation length, used as the watermark before a follow-up.
    pub async fn message_count(&self, handle: &str) -> ArenaResult<usize> {
        Ok(self.conversation(handle).await?.len())
    }

    /// Text of the newest agent-authored message.
    pub async fn latest_agent_reply(&self, handle: &str) -> ArenaResult<Option<String>> {
        let messages = self.conversation(handle).await?;
        Ok(messages
            .iter()
            .rev()
            .find(|m| m.is_agent_authored())
            .map(|m| m.body().to_string()))
    }

    // ========================================================================
    // Waiting
    // ========================================================================

    /// Poll until the freshly launched agent reports FINISHED.
    pub async fn wait_for_launch(&self, handle: &str) -> ArenaResult<()> {
        self.wait_for_all_launches(&[handle.to_string()]).await
    }

    /// Poll every handle each tick until all report FINISHED.
    pub async fn wait_for_all_launches(&self, handles: &[String]) -> ArenaResult<()> {
        let deadline = Instant::now() + self.wait.launch_timeout;
        let mut remaining: Vec<String> = handles.to_vec();

        loop {
            let polls = join_all(remaining.iter().map(|h| self.status(h))).await;
            let mut still_working = Vec::with_capacity(remaining.len());
            for (handle, poll) in remaining.into_iter().zip(polls) {
                match poll?.status {
                    AgentStatus::Finished => info!(handle = %handle, "Agent finished"),
                    AgentStatus::Creating | AgentStatus::Running => still_working.push(handle),
                }
            }
            remaining = still_working;

            if remaining.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ArenaError::Timeout {
                    handles: remaining,
                    timeout_secs: self.wait.launch_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.wait.poll_interval).await;
        }
    }

    /// Wait until `handle` replies past `watermark`.
    pub async fn wait_for_follow_up(&self, handle: &str, watermark: usize) -> ArenaResult<()> {
        self.wait_for_all_follow_ups(&[(handle.to_string(), watermark)])
            .await
    }

    /// Wait for every `(handle, watermark)` pair with one shared deadline.
    pub async fn wait_for_all_follow_ups(&self, pending: &[(String, usize)]) -> ArenaResult<()> {
        let deadline = Instant::now() + self.wait.follow_up_timeout;
        let mut trackers: Vec<FollowUpTracker> = pending
            .iter()
            .map(|(h, w)| FollowUpTracker::new(h.clone(), *w))
            .collect();

        loop {
            let polls = join_all(trackers.iter_mut().map(|t| t.poll_once(self))).await;
            let done: Vec<bool> = polls.into_iter().collect::<ArenaResult<_>>()?;
            let mut idx = 0;
            trackers.retain(|t| {
                let replied = done[idx];
                idx += 1;
                if replied {
                    info!(handle = %t.handle, "Agent responded");
                }
                !replied
            });

            if trackers.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ArenaError::Timeout {
                    handles: trackers.into_iter().map(|t| t.handle).collect(),
                    timeout_secs: self.wait.follow_up_timeout.as_secs(),
                });
            }
            tokio::time::sleep(self.wait.poll_interval).await;
        }
    }
}
