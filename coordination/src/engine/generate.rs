//! GENERATE phase: launch (round 0) or revise (round > 0), then extract.

use tracing::{error, info, warn};

use super::prompts::{commit_desc, generate_prompt, PeerFiles};
use super::PhaseEngine;
use crate::error::{ArenaError, ArenaResult};
use crate::state::{expected_path, Phase, ProgressStatus, RunState};

impl PhaseEngine {
    pub(super) async fn step_generate(&self, state: &mut RunState) -> ArenaResult<()> {
        if state.round == 0 {
            self.launch_agents(state).await?;
        } else {
            let peers = self.peer_files(state);
            let run_number = state.config.run_number;
            let round = state.round;
            let task = state.config.task.clone();
            self.send_phase_prompts(state, Phase::Generate, |alias| {
                generate_prompt(&task, alias, run_number, round, &peers)
            })
            .await?;
        }

        self.extract_solutions(state).await?;

        state.advance_phase(Phase::Evaluate)?;
        self.store.save(state)?;
        info!(round = state.round, "All solutions collected; moving to evaluate");
        Ok(())
    }

    /// Start one agent per alias that has no handle yet, then wait for all.
    async fn launch_agents(&self, state: &mut RunState) -> ArenaResult<()> {
        let aliases: Vec<String> = state.aliases().cloned().collect();
        let run_number = state.config.run_number;

        for alias in &aliases {
            if state.progress(alias) == ProgressStatus::Done
                || state.agent_handles.contains_key(alias)
            {
                continue;
            }
            info!(agent = %state.label(alias), "Launching agent");
            state.record_timing_start(alias, Phase::Generate);
            let prompt = generate_prompt(&state.config.task, alias, run_number, 0, &[]);
            let model = state.resolve_model(alias);
            let launched = self
                .coordinator
                .launch(
                    &prompt,
                    &state.config.repo,
                    &state.config.base_branch,
                    model.as_deref(),
                )
                .await?;

            info!(agent = %state.label(alias), handle = %launched.handle, "Agent launched");
            state
                .agent_handles
                .insert(alias.clone(), launched.handle.clone());
            if let Some(branch) = launched.branch_hint {
                state.branch_names.insert(alias.clone(), branch);
            }
            state.phase_progress.insert(alias.clone(), ProgressStatus::Sent);
            state.sent_watermarks.insert(alias.clone(), 0);
            self.store.save(state)?;
        }

        let pending: Vec<String> = aliases
            .iter()
            .filter(|a| state.progress(a) != ProgressStatus::Done)
            .map(|a| {
                state
                    .agent_handles
                    .get(a)
                    .cloned()
                    .ok_or_else(|| ArenaError::MissingHandle { alias: a.clone() })
            })
            .collect::<ArenaResult<_>>()?;
        if !pending.is_empty() {
            self.coordinator.wait_for_all_launches(&pending).await?;
        }

        for alias in &aliases {
            if state.branch_names.contains_key(alias) {
                continue;
            }
            let Some(handle) = state.agent_handles.get(alias).cloned() else {
                continue;
            };
            match self.coordinator.status(&handle).await {
                Ok(info) => {
                    if let Some(branch) = info.branch_name {
                        info!(agent = %state.label(alias), branch = %branch, "Captured branch");
                        state.branch_names.insert(alias.clone(), branch);
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(agent = %state.label(alias), error = %e, "Failed to fetch branch name");
                }
                Err(e) => return Err(e),
            }
        }
        self.store.save(state)?;
        Ok(())
    }

    /// Read solution (with re-prompt) and analysis for every alias not yet DONE.
    async fn extract_solutions(&self, state: &mut RunState) -> ArenaResult<()> {
        let aliases: Vec<String> = state.aliases().cloned().collect();
        let run_number = state.config.run_number;

        for alias in &aliases {
            if state.progress(alias) == ProgressStatus::Done {
                continue;
            }
            let desc = commit_desc(state.round, Phase::Generate.as_str(), alias);
            let solution_path = expected_path(run_number, alias, "solution", "md");
            let analysis_path = expected_path(run_number, alias, "analysis", "md");

            let solution = self
                .fetch_with_retry(state, alias, &solution_path, &desc)
                .await?;
            let analysis = self.fetch_artifact(state, alias, &analysis_path).await;

            self.record_conversation(state, alias).await?;

            if solution.is_none() {
                error!(
                    agent = %state.label(alias),
                    path = %solution_path,
                    "No solution committed; recording empty"
                );
            }
            state
                .solutions
                .insert(alias.clone(), solution.unwrap_or_default());
            state
                .analyses
                .insert(alias.clone(), analysis.unwrap_or_default());
            state.phase_progress.insert(alias.clone(), ProgressStatus::Done);
            state.record_timing_end(alias, Phase::Generate);
            self.capture_summary(state, alias).await;
            self.store.save(state)?;
        }
        Ok(())
    }

    /// Branch and run number for every alias, used to build peer references.
    pub(super) fn peer_files(&self, state: &RunState) -> Vec<PeerFiles> {
        state
            .aliases()
            .map(|alias| PeerFiles {
                alias: alias.clone(),
                branch: state.branch_names.get(alias).cloned().unwrap_or_default(),
                run_number: state.config.run_number,
            })
            .collect()
    }
}
