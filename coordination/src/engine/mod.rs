//! Phase engine
//!
//! Drives a run through its phases, one phase per [`PhaseEngine::step`]:
//!
//! ```text
//!   GENERATE ──> EVALUATE ──┬──> DONE      (consensus, or round >= max_rounds)
//!      ^                    │
//!      └────────────────────┘              (no consensus: round += 1)
//! ```
//!
//! Within a phase every alias moves PENDING -> SENT -> DONE. The watermark is
//! persisted before a request goes out, so after a crash the engine can tell
//! a request that never landed (conversation length still equals the
//! watermark: send again) from one that did (only wait). State is saved after
//! every sub-step; killing the process and calling `step` again resumes
//! without redoing finished agents.

mod comments;
mod evaluate;
mod fetch;
mod generate;
pub mod prompts;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::agent::{AgentCoordinator, ArtifactSource};
use crate::config::EngineSettings;
use crate::error::{ArenaError, ArenaResult};
use crate::report;
use crate::state::{Phase, ProgressStatus, RunState, StateStore};

pub use comments::{
    append_comment, pending_comments_path, read_pending_comments, PendingComment,
    PENDING_COMMENTS_FILE,
};
pub use evaluate::verify_output_failed;
pub use fetch::{conversation_tokens, CONVERSATIONS_DIR};

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub phase: Phase,
    pub round: u32,
    pub completed: bool,
    pub consensus_reached: Option<bool>,
    pub winner: Option<String>,
}

impl From<&RunState> for StepOutcome {
    fn from(state: &RunState) -> Self {
        Self {
            phase: state.phase,
            round: state.round,
            completed: state.completed,
            consensus_reached: state.consensus_reached,
            winner: state.winner.clone(),
        }
    }
}

/// Snapshot for `arena status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunStatus {
    pub task: String,
    pub run_number: u32,
    pub phase: Phase,
    pub round: u32,
    pub max_rounds: u32,
    pub completed: bool,
    pub consensus_reached: Option<bool>,
    pub agents: BTreeMap<String, String>,
    pub progress: BTreeMap<String, ProgressStatus>,
    pub votes: BTreeMap<String, Vec<String>>,
    pub scores: BTreeMap<String, u8>,
    pub winner: Option<String>,
    pub token_usage: BTreeMap<String, u64>,
}

impl From<&RunState> for RunStatus {
    fn from(state: &RunState) -> Self {
        Self {
            task: state.config.task.clone(),
            run_number: state.config.run_number,
            phase: state.phase,
            round: state.round,
            max_rounds: state.config.max_rounds,
            completed: state.completed,
            consensus_reached: state.consensus_reached,
            agents: state.alias_mapping.clone(),
            progress: state.phase_progress.clone(),
            votes: state.votes.clone(),
            scores: state.scores.clone(),
            winner: state.winner.clone(),
            token_usage: state.token_usage.clone(),
        }
    }
}

/// Status of the run stored in `store`.
pub fn run_status(store: &StateStore) -> ArenaResult<RunStatus> {
    Ok(RunStatus::from(&store.load_required()?))
}

/// Reopen a completed run for another generate/evaluate cycle and persist it.
pub fn reopen_run(store: &StateStore) -> ArenaResult<RunState> {
    let mut state = store.load_required()?;
    if !state.completed {
        return Err(ArenaError::config(
            "run is not completed; only a finished run can be reopened",
        ));
    }
    state.reopen();
    store.save(&state)?;
    info!(round = state.round, "Run reopened");
    Ok(state)
}

/// Executes phases against one run directory.
pub struct PhaseEngine {
    store: StateStore,
    coordinator: AgentCoordinator,
    artifacts: Arc<dyn ArtifactSource>,
    settings: EngineSettings,
}

impl PhaseEngine {
    pub fn new(
        store: StateStore,
        coordinator: AgentCoordinator,
        artifacts: Arc<dyn ArtifactSource>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            coordinator,
            artifacts,
            settings,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Execute exactly one phase and persist the result.
    ///
    /// Fails with a precondition error when there is no state, the run is
    /// already completed, or the task is still the placeholder.
    pub async fn step(&self) -> ArenaResult<StepOutcome> {
        let mut state = self.store.load_required()?;
        if state.completed {
            return Err(ArenaError::AlreadyCompleted);
        }
        if state.config.has_placeholder_task() {
            return Err(ArenaError::config(format!(
                "task is not set; edit {} first",
                self.store.state_path().display()
            )));
        }

        self.deliver_pending_comments(&mut state).await?;

        info!(round = state.round, phase = %state.phase, "Starting phase");
        match state.phase {
            Phase::Generate => self.step_generate(&mut state).await?,
            Phase::Evaluate => self.step_evaluate(&mut state).await?,
            Phase::Done => return Err(ArenaError::TerminalPhase(state.phase)),
        }

        self.archive(&state);
        report::update_report(self.store.run_dir(), &state)?;
        if state.completed {
            report::write_winning_solution(self.store.run_dir(), &state)?;
        }
        self.store.save(&state)?;
        Ok(StepOutcome::from(&state))
    }

    /// Step until the run completes.
    pub async fn run(&self) -> ArenaResult<StepOutcome> {
        loop {
            let outcome = self.step().await?;
            if outcome.completed {
                info!(
                    round = outcome.round,
                    consensus = ?outcome.consensus_reached,
                    winner = ?outcome.winner,
                    "Run complete"
                );
                return Ok(outcome);
            }
        }
    }

    fn archive(&self, state: &RunState) {
        if let Err(e) = report::archive_round(self.store.run_dir(), state) {
            warn!(error = %e, "Failed to archive round artifacts");
        }
    }

    /// Send `prompt_for(alias)` to every alias not yet DONE, then wait for all.
    ///
    /// PENDING records the watermark and persists SENT before sending. SENT
    /// re-sends only when the conversation has not grown past the watermark.
    async fn send_phase_prompts<F>(
        &self,
        state: &mut RunState,
        phase: Phase,
        prompt_for: F,
    ) -> ArenaResult<()>
    where
        F: Fn(&str) -> String,
    {
        let aliases: Vec<String> = state.aliases().cloned().collect();

        for alias in &aliases {
            let progress = state.progress(alias);
            if progress == ProgressStatus::Done {
                continue;
            }
            let handle = state
                .agent_handles
                .get(alias)
                .cloned()
                .ok_or_else(|| ArenaError::MissingHandle {
                    alias: alias.clone(),
                })?;

            if progress == ProgressStatus::Sent {
                let live = self.coordinator.message_count(&handle).await?;
                let watermark = state.sent_watermarks.get(alias).copied().unwrap_or(0);
                if live > watermark {
                    info!(agent = %state.label(alias), %phase, "Prompt already delivered; waiting");
                    continue;
                }
                info!(agent = %state.label(alias), %phase, "Re-sending prompt after restart");
            } else {
                let watermark = self.coordinator.message_count(&handle).await?;
                state.sent_watermarks.insert(alias.clone(), watermark);
                state.phase_progress.insert(alias.clone(), ProgressStatus::Sent);
                state.record_timing_start(alias, phase);
                self.store.save(state)?;
                info!(agent = %state.label(alias), %phase, "Sending prompt");
            }

            self.coordinator
                .follow_up(&handle, &prompt_for(alias))
                .await?;
        }

        let waits: Vec<(String, usize)> = aliases
            .iter()
            .filter(|a| state.progress(a) == ProgressStatus::Sent)
            .filter_map(|a| {
                let handle = state.agent_handles.get(a)?.clone();
                Some((handle, state.sent_watermarks.get(a).copied().unwrap_or(0)))
            })
            .collect();
        if !waits.is_empty() {
            self.coordinator.wait_for_all_follow_ups(&waits).await?;
        }
        Ok(())
    }
}
