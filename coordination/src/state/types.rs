//! Run configuration and the mutable run state document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{ArenaError, ArenaResult};

/// Task text written by `init` when none is given. `step` and `run` refuse it.
pub const TASK_PLACEHOLDER: &str = "[DESCRIBE THE TASK HERE]";

/// Models used when the caller does not pick any.
pub const DEFAULT_MODELS: [&str; 3] = ["opus", "gpt", "gemini"];

/// Nickname to full model identifier, sent at launch time.
pub const DEFAULT_MODEL_NICKNAMES: [(&str, &str); 3] = [
    ("opus", "claude-4.6-opus-high-thinking"),
    ("gpt", "gpt-5.2-codex-high"),
    ("gemini", "gemini-3-pro"),
];

pub const MIN_AGENTS: usize = 2;
pub const MAX_AGENTS: usize = 26;
pub const MAX_ROUNDS_LIMIT: u32 = 10;

// ============================================================================
// Enums
// ============================================================================

/// Phase of an arena run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Agents produce or revise solutions.
    Generate,
    /// Agents critique every solution and vote.
    Evaluate,
    /// Run finished, with or without consensus.
    Done,
}

impl Phase {
    /// Whether this is a terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [Phase] {
        match self {
            Self::Generate => &[Self::Evaluate],
            Self::Evaluate => &[Self::Generate, Self::Done],
            Self::Done => &[],
        }
    }

    /// Position of the phase within a round, used in archive names.
    pub fn number(self) -> u8 {
        match self {
            Self::Generate => 1,
            Self::Evaluate => 2,
            Self::Done => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Evaluate => "evaluate",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-agent progress within the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Pending,
    /// Request issued; the watermark was recorded before sending.
    Sent,
    Done,
}

/// How verification command failures affect consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Failures are recorded only.
    #[default]
    Advisory,
    /// A failure revokes consensus for the round.
    Gating,
}

impl std::str::FromStr for VerifyMode {
    type Err = ArenaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "advisory" => Ok(Self::Advisory),
            "gating" => Ok(Self::Gating),
            other => Err(ArenaError::config(format!(
                "verify mode must be 'advisory' or 'gating', got '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for VerifyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Advisory => write!(f, "advisory"),
            Self::Gating => write!(f, "gating"),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// One remaining disagreement reported in a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Divergence {
    pub topic: String,
    #[serde(default)]
    pub description: String,
}

/// Start/end timestamps for one agent in one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhaseTiming {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

/// Summary of one completed EVALUATE round, stored in `verdict_history`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoundSummary {
    #[serde(default)]
    pub votes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub scores: BTreeMap<String, u8>,
    #[serde(default)]
    pub divergences: BTreeMap<String, Vec<Divergence>>,
    #[serde(default)]
    pub token_usage: BTreeMap<String, u64>,
}

impl RoundSummary {
    /// Parse a history entry; unreadable entries yield an empty summary.
    pub fn parse(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }

    pub fn min_score(&self) -> u8 {
        self.scores.values().copied().min().unwrap_or(0)
    }
}

// ============================================================================
// RunConfig
// ============================================================================

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_max_rounds() -> u32 {
    3
}

fn default_run_number() -> u32 {
    1
}

/// Immutable configuration for one run. Set once at `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub task: String,
    /// `owner/repo` or a full GitHub URL.
    pub repo: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default)]
    pub verify_commands: Vec<String>,
    #[serde(default)]
    pub verify_mode: VerifyMode,
    /// The NNNN in `arenas/NNNN/`.
    #[serde(default = "default_run_number", alias = "arena_number")]
    pub run_number: u32,
}

impl RunConfig {
    pub fn new(task: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            repo: repo.into(),
            base_branch: default_base_branch(),
            max_rounds: default_max_rounds(),
            verify_commands: Vec::new(),
            verify_mode: VerifyMode::default(),
            run_number: default_run_number(),
        }
    }

    /// Check field ranges.
    pub fn validate(&self) -> ArenaResult<()> {
        if !(1..=MAX_ROUNDS_LIMIT).contains(&self.max_rounds) {
            return Err(ArenaError::config(format!(
                "max_rounds must be between 1 and {MAX_ROUNDS_LIMIT}, got {}",
                self.max_rounds
            )));
        }
        if self.run_number < 1 {
            return Err(ArenaError::config("run number must be at least 1"));
        }
        if self.repo.trim().is_empty() {
            return Err(ArenaError::config("repository reference is empty"));
        }
        Ok(())
    }

    pub fn has_placeholder_task(&self) -> bool {
        self.task.trim().is_empty() || self.task.trim() == TASK_PLACEHOLDER
    }
}

// ============================================================================
// RunState
// ============================================================================

/// Full run state. Mutated in place and persisted after every sub-step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub config: RunConfig,
    /// Alias to model nickname. Fixed for the whole run.
    pub alias_mapping: BTreeMap<String, String>,
    /// Nickname to full model identifier; unknown nicknames pass through.
    #[serde(default)]
    pub model_nicknames: BTreeMap<String, String>,
    #[serde(default)]
    pub agent_handles: BTreeMap<String, String>,
    #[serde(default)]
    pub branch_names: BTreeMap<String, String>,
    #[serde(default)]
    pub round: u32,
    pub phase: Phase,
    #[serde(default)]
    pub phase_progress: BTreeMap<String, ProgressStatus>,
    /// Conversation length captured immediately before a follow-up.
    #[serde(default)]
    pub sent_watermarks: BTreeMap<String, usize>,
    #[serde(default)]
    pub solutions: BTreeMap<String, String>,
    #[serde(default)]
    pub analyses: BTreeMap<String, String>,
    #[serde(default)]
    pub critiques: BTreeMap<String, String>,
    #[serde(default)]
    pub votes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub scores: BTreeMap<String, u8>,
    #[serde(default)]
    pub divergences: BTreeMap<String, Vec<Divergence>>,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// Unknown until the run terminates.
    #[serde(default)]
    pub consensus_reached: Option<bool>,
    #[serde(default)]
    pub final_verdict: Option<String>,
    /// One JSON [`RoundSummary`] per completed EVALUATE round.
    #[serde(default)]
    pub verdict_history: Vec<String>,
    #[serde(default)]
    pub verify_results: Vec<String>,
    #[serde(default)]
    pub token_usage: BTreeMap<String, u64>,
    #[serde(default)]
    pub agent_timing: BTreeMap<String, BTreeMap<String, PhaseTiming>>,
    /// Latest status summary reported by each agent.
    #[serde(default)]
    pub agent_summaries: BTreeMap<String, String>,
}

/// Alias names for `n` agents: `agent_a` .. `agent_z`.
pub fn aliases_for_count(n: usize) -> ArenaResult<Vec<String>> {
    if n > MAX_AGENTS {
        return Err(ArenaError::config(format!(
            "at most {MAX_AGENTS} agents are supported, got {n}"
        )));
    }
    Ok((0..n)
        .map(|i| format!("agent_{}", (b'a' + i as u8) as char))
        .collect())
}

/// Create a fresh run with a shuffled alias-to-model mapping.
///
/// An empty model list falls back to [`DEFAULT_MODELS`].
pub fn init_state(config: RunConfig, models: &[String]) -> ArenaResult<RunState> {
    config.validate()?;

    let mut models: Vec<String> = if models.is_empty() {
        DEFAULT_MODELS.iter().map(|m| m.to_string()).collect()
    } else {
        models.to_vec()
    };
    if models.len() < MIN_AGENTS {
        return Err(ArenaError::config(format!(
            "at least {MIN_AGENTS} models are required for peer voting, got {}",
            models.len()
        )));
    }
    models.shuffle(&mut rand::thread_rng());
    let aliases = aliases_for_count(models.len())?;

    let phase_progress = aliases
        .iter()
        .map(|a| (a.clone(), ProgressStatus::Pending))
        .collect();

    Ok(RunState {
        config,
        alias_mapping: aliases.into_iter().zip(models).collect(),
        model_nicknames: DEFAULT_MODEL_NICKNAMES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        agent_handles: BTreeMap::new(),
        branch_names: BTreeMap::new(),
        round: 0,
        phase: Phase::Generate,
        phase_progress,
        sent_watermarks: BTreeMap::new(),
        solutions: BTreeMap::new(),
        analyses: BTreeMap::new(),
        critiques: BTreeMap::new(),
        votes: BTreeMap::new(),
        scores: BTreeMap::new(),
        divergences: BTreeMap::new(),
        winner: None,
        completed: false,
        consensus_reached: None,
        final_verdict: None,
        verdict_history: Vec::new(),
        verify_results: Vec::new(),
        token_usage: BTreeMap::new(),
        agent_timing: BTreeMap::new(),
        agent_summaries: BTreeMap::new(),
    })
}

/// Stable path an agent commits an artifact to: `arenas/NNNN/<alias>-<artifact>.<ext>`.
///
/// Round-agnostic so each round overwrites the same file.
pub fn expected_path(run_number: u32, alias: &str, artifact: &str, ext: &str) -> String {
    format!("arenas/{run_number:04}/{alias}-{artifact}.{ext}")
}

impl RunState {
    pub fn aliases(&self) -> impl Iterator<Item = &String> {
        self.alias_mapping.keys()
    }

    pub fn agent_count(&self) -> usize {
        self.alias_mapping.len()
    }

    /// Full model identifier for an alias, resolved through the nickname table.
    pub fn resolve_model(&self, alias: &str) -> Option<String> {
        self.alias_mapping.get(alias).map(|nick| {
            self.model_nicknames
                .get(nick)
                .cloned()
                .unwrap_or_else(|| nick.clone())
        })
    }

    /// `agent_a (opus)` style label for log lines.
    pub fn label(&self, alias: &str) -> String {
        match self.alias_mapping.get(alias) {
            Some(model) => format!("{alias} ({model})"),
            None => alias.to_string(),
        }
    }

    pub fn progress(&self, alias: &str) -> ProgressStatus {
        self.phase_progress.get(alias).copied().unwrap_or_default()
    }

    /// Every alias back to PENDING, watermarks dropped.
    pub fn reset_progress(&mut self) {
        self.phase_progress = self
            .alias_mapping
            .keys()
            .map(|a| (a.clone(), ProgressStatus::Pending))
            .collect();
        self.sent_watermarks.clear();
    }

    /// Move to `next`, resetting per-phase progress.
    pub fn advance_phase(&mut self, next: Phase) -> ArenaResult<()> {
        if !self.phase.valid_transitions().contains(&next) {
            return Err(ArenaError::malformed(format!(
                "invalid phase transition {} -> {next}",
                self.phase
            )));
        }
        self.phase = next;
        self.reset_progress();
        Ok(())
    }

    /// Drop everything that only describes the round just evaluated.
    pub fn clear_round(&mut self) {
        self.critiques.clear();
        self.votes.clear();
        self.scores.clear();
        self.divergences.clear();
        self.winner = None;
        self.verify_results.clear();
    }

    pub fn record_timing_start(&mut self, alias: &str, phase: Phase) {
        self.agent_timing
            .entry(alias.to_string())
            .or_default()
            .insert(
                phase.to_string(),
                PhaseTiming {
                    start: Some(Utc::now()),
                    end: None,
                },
            );
    }

    pub fn record_timing_end(&mut self, alias: &str, phase: Phase) {
        self.agent_timing
            .entry(alias.to_string())
            .or_default()
            .entry(phase.to_string())
            .or_default()
            .end = Some(Utc::now());
    }

    /// Reset a completed run so it can go through another generate/evaluate cycle.
    ///
    /// Solutions, analyses, handles and branches survive; the caller persists.
    pub fn reopen(&mut self) {
        self.completed = false;
        self.consensus_reached = None;
        self.final_verdict = None;
        self.round += 1;
        self.phase = Phase::Generate;
        self.reset_progress();
        self.clear_round();
    }
}
