//! In-memory doubles for the agent service and the artifact source.
//!
//! Enabled by the `test-support` feature. [`FakeTransport`] keeps every
//! agent's conversation in memory and asks a responder closure how to react
//! to each prompt: what to reply and which files to commit to the agent's
//! branch in the shared [`MemoryArtifacts`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use async_trait::async_trait;
use regex::Regex;

use crate::agent::{
    AgentSnapshot, AgentTransport, ArtifactSource, ConversationMessage, LaunchRequest,
    LaunchedAgent, MessageUsage,
};
use crate::error::{ArenaError, ArenaResult};

static ALIAS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^You are (agent_[a-z])\b").expect("ALIAS_RE regex should compile")
});

static ARTIFACT_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"arenas/\d{4}/(agent_[a-z])-(solution|analysis|critique|verdict)\.(?:md|json)")
        .expect("ARTIFACT_PATH_RE regex should compile")
});

/// Tokens attached to each fake agent reply.
pub const REPLY_TOKENS: u64 = 100;

/// Alias named in the first line of a phase prompt.
pub fn prompt_alias(prompt: &str) -> Option<String> {
    ALIAS_RE
        .captures(prompt)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Verdict document as an agent would commit it.
pub fn verdict_json(score: u8, votes: &[&str], divergences: &[&str]) -> String {
    let divergences: Vec<serde_json::Value> = divergences
        .iter()
        .map(|t| serde_json::json!({"topic": t, "description": format!("{t} differs")}))
        .collect();
    serde_json::json!({
        "convergence_score": score,
        "best_solutions": votes,
        "divergences": divergences,
        "rationale": "scripted",
    })
    .to_string()
}

// ============================================================================
// Calls and reactions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeCallKind {
    Launch,
    FollowUp,
}

/// A prompt received by the fake service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub kind: FakeCallKind,
    pub handle: String,
    /// Alias the agent was launched as, when the launch prompt named one.
    pub alias: Option<String>,
    pub prompt: String,
}

impl FakeCall {
    pub fn is_evaluate(&self) -> bool {
        self.prompt.contains("PART 2 — VERDICT")
    }

    pub fn is_commit_retry(&self) -> bool {
        self.prompt.starts_with("You did not commit")
    }

    pub fn is_verify(&self) -> bool {
        self.prompt.starts_with("Run this command")
    }

    pub fn is_operator_comment(&self) -> bool {
        self.prompt.starts_with("The arena operator")
    }

    /// Own artifact paths this prompt asks the agent to commit.
    pub fn requested_artifacts(&self) -> Vec<(String, String)> {
        let Some(alias) = self.alias.as_deref() else {
            return Vec::new();
        };
        let wanted: &[&str] = if self.is_commit_retry() {
            &["solution", "analysis", "critique", "verdict"]
        } else if self.is_evaluate() {
            &["critique", "verdict"]
        } else if self.prompt.starts_with("You are") {
            &["solution", "analysis"]
        } else {
            &[]
        };
        let mut found: Vec<(String, String)> = Vec::new();
        for caps in ARTIFACT_PATH_RE.captures_iter(&self.prompt) {
            let (Some(path), Some(owner), Some(artifact)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            if owner.as_str() != alias || !wanted.contains(&artifact.as_str()) {
                continue;
            }
            let entry = (artifact.as_str().to_string(), path.as_str().to_string());
            if !found.contains(&entry) {
                found.push(entry);
            }
        }
        found
    }
}

/// How the fake agent reacts to a prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeReaction {
    /// Agent message appended to the conversation.
    pub reply: Option<String>,
    /// `(path, content)` pairs committed to the agent's branch.
    pub commits: Vec<(String, String)>,
}

impl FakeReaction {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            reply: Some(text.into()),
            commits: Vec::new(),
        }
    }
}

pub type Responder = Arc<dyn Fn(&FakeCall) -> FakeReaction + Send + Sync>;

/// Responder that commits every requested artifact. Verdict content comes
/// from `verdict(alias)`; other artifacts are `"<artifact> by <alias>"`.
pub fn arena_responder<V>(verdict: V) -> Responder
where
    V: Fn(&str) -> String + Send + Sync + 'static,
{
    Arc::new(move |call: &FakeCall| {
        if call.is_verify() {
            return FakeReaction::reply("test result: ok. all checks passed");
        }
        let Some(alias) = call.alias.clone() else {
            return FakeReaction::reply("ok");
        };
        let commits = call
            .requested_artifacts()
            .into_iter()
            .map(|(artifact, path)| {
                let content = if artifact == "verdict" {
                    verdict(&alias)
                } else {
                    format!("{artifact} by {alias}")
                };
                (path, content)
            })
            .collect();
        FakeReaction {
            reply: Some(format!("{alias} committed its files")),
            commits,
        }
    })
}

// ============================================================================
// MemoryArtifacts
// ============================================================================

/// Branch-keyed file store. The repository argument is ignored.
#[derive(Debug, Default)]
pub struct MemoryArtifacts {
    files: Mutex<HashMap<(String, String), String>>,
    reads: Mutex<usize>,
}

impl MemoryArtifacts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn files(&self) -> MutexGuard<'_, HashMap<(String, String), String>> {
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn commit(&self, branch: &str, path: &str, content: impl Into<String>) {
        self.files()
            .insert((branch.to_string(), path.to_string()), content.into());
    }

    pub fn remove(&self, branch: &str, path: &str) {
        self.files().remove(&(branch.to_string(), path.to_string()));
    }

    pub fn get(&self, branch: &str, path: &str) -> Option<String> {
        self.files()
            .get(&(branch.to_string(), path.to_string()))
            .cloned()
    }

    pub fn read_count(&self) -> usize {
        *self.reads.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ArtifactSource for MemoryArtifacts {
    async fn fetch(&self, _repo: &str, branch: &str, path: &str) -> Option<String> {
        *self.reads.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        self.get(branch, path)
    }
}

// ============================================================================
// FakeTransport
// ============================================================================

#[derive(Debug, Default)]
struct FakeAgent {
    alias: Option<String>,
    branch: String,
    messages: Vec<ConversationMessage>,
    statuses: VecDeque<String>,
    summary: Option<String>,
    /// Follow-ups whose reply is never delivered.
    dropped_replies: usize,
    /// Conversation polls to wait before a reply becomes visible.
    reply_delay: usize,
    delayed: VecDeque<(usize, ConversationMessage)>,
}

#[derive(Default)]
struct FakeState {
    agents: BTreeMap<String, FakeAgent>,
    next_id: usize,
    calls: Vec<FakeCall>,
    launch_statuses: Vec<String>,
    failures: VecDeque<ArenaError>,
}

/// In-memory agent service.
pub struct FakeTransport {
    state: Mutex<FakeState>,
    artifacts: Arc<MemoryArtifacts>,
    responder: Responder,
}

impl FakeTransport {
    pub fn new(artifacts: Arc<MemoryArtifacts>, responder: Responder) -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            artifacts,
            responder,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Statuses every new agent reports before settling on FINISHED.
    pub fn set_launch_statuses(&self, statuses: &[&str]) {
        self.lock().launch_statuses = statuses.iter().map(|s| s.to_string()).collect();
    }

    /// Queue statuses for `handle`; FINISHED once exhausted.
    pub fn push_statuses(&self, handle: &str, statuses: &[&str]) {
        if let Some(agent) = self.lock().agents.get_mut(handle) {
            agent
                .statuses
                .extend(statuses.iter().map(|s| s.to_string()));
        }
    }

    /// The next `count` calls of any kind fail with HTTP `status`.
    pub fn fail_next(&self, count: usize, status: u16) {
        let mut state = self.lock();
        for _ in 0..count {
            state.failures.push_back(ArenaError::Http {
                status,
                url: "fake://agents".to_string(),
                body: "injected".to_string(),
            });
        }
    }

    /// The next `count` follow-ups to `handle` get no reply.
    pub fn drop_replies(&self, handle: &str, count: usize) {
        if let Some(agent) = self.lock().agents.get_mut(handle) {
            agent.dropped_replies += count;
        }
    }

    /// Replies to `handle` appear only after `polls` conversation reads.
    pub fn delay_replies(&self, handle: &str, polls: usize) {
        if let Some(agent) = self.lock().agents.get_mut(handle) {
            agent.reply_delay = polls;
        }
    }

    pub fn set_summary(&self, handle: &str, summary: &str) {
        if let Some(agent) = self.lock().agents.get_mut(handle) {
            agent.summary = Some(summary.to_string());
        }
    }

    /// Register an agent directly, with an optional seed conversation.
    pub fn add_agent(&self, handle: &str, alias: Option<&str>, messages: Vec<ConversationMessage>) {
        self.lock().agents.insert(
            handle.to_string(),
            FakeAgent {
                alias: alias.map(str::to_string),
                branch: format!("arena/{}", alias.unwrap_or(handle)),
                messages,
                ..FakeAgent::default()
            },
        );
    }

    /// Append a message to `handle`'s conversation.
    pub fn push_message(&self, handle: &str, message: ConversationMessage) {
        if let Some(agent) = self.lock().agents.get_mut(handle) {
            agent.messages.push(message);
        }
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().calls.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == FakeCallKind::Launch)
            .count()
    }

    pub fn follow_ups(&self) -> Vec<FakeCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.kind == FakeCallKind::FollowUp)
            .cloned()
            .collect()
    }

    pub fn follow_ups_to(&self, alias: &str) -> usize {
        self.follow_ups()
            .iter()
            .filter(|c| c.alias.as_deref() == Some(alias))
            .count()
    }

    pub fn handle_of(&self, alias: &str) -> Option<String> {
        self.lock()
            .agents
            .iter()
            .find(|(_, a)| a.alias.as_deref() == Some(alias))
            .map(|(h, _)| h.clone())
    }

    pub fn message_len(&self, handle: &str) -> usize {
        self.lock()
            .agents
            .get(handle)
            .map(|a| a.messages.len())
            .unwrap_or(0)
    }

    fn take_failure(&self) -> ArenaResult<()> {
        match self.lock().failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn not_found(handle: &str) -> ArenaError {
        ArenaError::Http {
            status: 404,
            url: format!("fake://agents/{handle}"),
            body: "agent not found".to_string(),
        }
    }

    /// Record the call, run the responder and apply its reaction.
    fn react(&self, call: FakeCall) {
        let reaction = (self.responder)(&call);
        let mut state = self.lock();
        state.calls.push(call.clone());
        let Some(agent) = state.agents.get_mut(&call.handle) else {
            return;
        };
        agent.messages.push(ConversationMessage::user(call.prompt.clone()));
        for (path, content) in &reaction.commits {
            self.artifacts.commit(&agent.branch, path, content.clone());
        }
        let Some(text) = reaction.reply else {
            return;
        };
        if agent.dropped_replies > 0 {
            agent.dropped_replies -= 1;
            return;
        }
        let mut reply = ConversationMessage::agent(text);
        reply.usage = Some(MessageUsage {
            total_tokens: REPLY_TOKENS,
        });
        if agent.reply_delay > 0 {
            let delay = agent.reply_delay;
            agent.delayed.push_back((delay, reply));
        } else {
            agent.messages.push(reply);
        }
    }
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn launch(&self, request: &LaunchRequest) -> ArenaResult<LaunchedAgent> {
        self.take_failure()?;
        let alias = prompt_alias(&request.prompt);
        let (handle, branch) = {
            let mut state = self.lock();
            state.next_id += 1;
            let handle = format!("bc-{}", state.next_id);
            let branch = format!("arena/{}", alias.as_deref().unwrap_or(&handle));
            let statuses = state.launch_statuses.iter().cloned().collect();
            state.agents.insert(
                handle.clone(),
                FakeAgent {
                    alias: alias.clone(),
                    branch: branch.clone(),
                    statuses,
                    ..FakeAgent::default()
                },
            );
            (handle, branch)
        };
        self.react(FakeCall {
            kind: FakeCallKind::Launch,
            handle: handle.clone(),
            alias,
            prompt: request.prompt.clone(),
        });
        Ok(LaunchedAgent {
            handle,
            branch_hint: Some(branch),
        })
    }

    async fn follow_up(&self, handle: &str, prompt: &str) -> ArenaResult<()> {
        self.take_failure()?;
        let alias = {
            let state = self.lock();
            let agent = state
                .agents
                .get(handle)
                .ok_or_else(|| Self::not_found(handle))?;
            agent.alias.clone()
        };
        self.react(FakeCall {
            kind: FakeCallKind::FollowUp,
            handle: handle.to_string(),
            alias,
            prompt: prompt.to_string(),
        });
        Ok(())
    }

    async fn status(&self, handle: &str) -> ArenaResult<AgentSnapshot> {
        self.take_failure()?;
        let mut state = self.lock();
        let agent = state
            .agents
            .get_mut(handle)
            .ok_or_else(|| Self::not_found(handle))?;
        let status = agent
            .statuses
            .pop_front()
            .unwrap_or_else(|| "FINISHED".to_string());
        Ok(AgentSnapshot {
            status,
            branch_name: Some(agent.branch.clone()),
            summary: agent.summary.clone(),
        })
    }

    async fn conversation(&self, handle: &str) -> ArenaResult<Vec<ConversationMessage>> {
        self.take_failure()?;
        let mut state = self.lock();
        let agent = state
            .agents
            .get_mut(handle)
            .ok_or_else(|| Self::not_found(handle))?;
        let mut still_delayed = VecDeque::new();
        while let Some((remaining, message)) = agent.delayed.pop_front() {
            if remaining <= 1 {
                agent.messages.push(message);
            } else {
                still_delayed.push_back((remaining - 1, message));
            }
        }
        agent.delayed = still_delayed;
        Ok(agent.messages.clone())
    }
}
