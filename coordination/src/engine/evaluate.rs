//! EVALUATE phase: critique and vote, then decide the round.

use std::collections::BTreeSet;

use tracing::{error, info, warn};

use super::prompts::{commit_desc, evaluate_prompt, verify_prompt};
use super::PhaseEngine;
use crate::consensus::{decide_round, parse_verdict};
use crate::error::ArenaResult;
use crate::state::{expected_path, Phase, ProgressStatus, RoundSummary, RunState, VerifyMode};

/// Output keywords taken as a failed verification command.
const VERIFY_FAILURE_KEYWORDS: [&str; 4] = ["fail", "error", "exception", "exit code"];

pub fn verify_output_failed(output: &str) -> bool {
    let lower = output.to_lowercase();
    VERIFY_FAILURE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

impl PhaseEngine {
    pub(super) async fn step_evaluate(&self, state: &mut RunState) -> ArenaResult<()> {
        let peers = self.peer_files(state);
        let run_number = state.config.run_number;
        let round = state.round;
        self.send_phase_prompts(state, Phase::Evaluate, |alias| {
            evaluate_prompt(alias, &peers, run_number, round)
        })
        .await?;

        self.extract_verdicts(state).await?;
        self.conclude_round(state).await
    }

    /// Read critique and verdict for every alias not yet DONE.
    async fn extract_verdicts(&self, state: &mut RunState) -> ArenaResult<()> {
        let aliases: Vec<String> = state.aliases().cloned().collect();
        let valid: BTreeSet<String> = aliases.iter().cloned().collect();
        let run_number = state.config.run_number;

        for alias in &aliases {
            if state.progress(alias) == ProgressStatus::Done {
                continue;
            }
            let desc = commit_desc(state.round, Phase::Evaluate.as_str(), alias);
            let critique_path = expected_path(run_number, alias, "critique", "md");
            let verdict_path = expected_path(run_number, alias, "verdict", "json");

            let critique = self
                .fetch_with_retry(state, alias, &critique_path, &desc)
                .await?;
            let verdict_text = self
                .fetch_with_retry(state, alias, &verdict_path, &desc)
                .await?;

            self.record_conversation(state, alias).await?;

            if critique.is_none() {
                error!(agent = %state.label(alias), path = %critique_path, "No critique committed");
            }
            if verdict_text.is_none() {
                error!(agent = %state.label(alias), path = %verdict_path, "No verdict committed");
            }
            state
                .critiques
                .insert(alias.clone(), critique.unwrap_or_default());

            let mut verdict = parse_verdict(verdict_text.as_deref().unwrap_or_default(), &valid);
            if verdict.strip_self_vote(alias) {
                info!(agent = %state.label(alias), "Stripped self-vote");
            }

            state.votes.insert(alias.clone(), verdict.votes);
            if let Some(score) = verdict.score {
                state.scores.insert(alias.clone(), score);
            }
            state
                .divergences
                .insert(alias.clone(), verdict.divergences);
            state.phase_progress.insert(alias.clone(), ProgressStatus::Done);
            state.record_timing_end(alias, Phase::Evaluate);
            self.store.save(state)?;
        }
        Ok(())
    }

    /// Tally, optionally verify, then finish the run or loop to GENERATE.
    async fn conclude_round(&self, state: &mut RunState) -> ArenaResult<()> {
        let summary = RoundSummary {
            votes: state.votes.clone(),
            scores: state.scores.clone(),
            divergences: state.divergences.clone(),
            token_usage: state.token_usage.clone(),
        };
        let summary_json = serde_json::to_string_pretty(&summary)?;

        let aliases: Vec<String> = state.aliases().cloned().collect();
        let decision = decide_round(&aliases, &state.votes, &state.scores);
        info!(
            round = state.round,
            min_score = decision.min_score,
            tally = ?decision.election.tally,
            winner = ?decision.winner(),
            consensus = decision.consensus,
            "Vote results"
        );

        let mut consensus = decision.consensus;
        if consensus && !state.config.verify_commands.is_empty() {
            if let Some(winner) = decision.winner() {
                let failed = self.run_verify_commands(state, winner).await?;
                if failed && state.config.verify_mode == VerifyMode::Gating {
                    warn!("Verification failed in gating mode; consensus revoked");
                    consensus = false;
                }
            }
        }

        // Not before verification: its per-command saves would persist it.
        state.verdict_history.push(summary_json.clone());

        // Critiques and verdicts are cleared below when looping.
        self.archive(state);

        if consensus {
            state.phase = Phase::Done;
            state.completed = true;
            state.consensus_reached = Some(true);
            state.winner = decision.election.winner.clone();
            info!(round = state.round, winner = ?state.winner, "Consensus reached");
        } else if state.round >= state.config.max_rounds {
            state.phase = Phase::Done;
            state.completed = true;
            state.consensus_reached = Some(false);
            info!(round = state.round, "Max rounds reached without consensus");
        } else {
            state.clear_round();
            state.round += 1;
            state.advance_phase(Phase::Generate)?;
            info!(round = state.round, "No consensus; starting next round");
        }
        state.final_verdict = Some(summary_json);
        state.sent_watermarks.clear();
        self.store.save(state)?;
        Ok(())
    }

    /// Run each verification command through the winner's session.
    /// Returns whether any output looked like a failure.
    async fn run_verify_commands(&self, state: &mut RunState, winner: &str) -> ArenaResult<bool> {
        let Some(handle) = state.agent_handles.get(winner).cloned() else {
            warn!(winner, "Winner has no session; skipping verification");
            return Ok(false);
        };
        state.verify_results.clear();

        let mut failed = false;
        for command in state.config.verify_commands.clone() {
            info!(agent = %state.label(winner), command = %command, "Running verify command");
            let watermark = self.coordinator.message_count(&handle).await?;
            self.coordinator
                .follow_up(&handle, &verify_prompt(&command))
                .await?;
            self.coordinator.wait_for_follow_up(&handle, watermark).await?;

            let output = self
                .coordinator
                .latest_agent_reply(&handle)
                .await?
                .unwrap_or_default();
            if verify_output_failed(&output) {
                warn!(command = %command, "Verify command appears to have failed");
                failed = true;
            }
            state.verify_results.push(output);
            self.store.save(state)?;
        }
        Ok(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_failure_keywords() {
        assert!(verify_output_failed("2 tests FAILED"));
        assert!(verify_output_failed("error[E0308]: mismatched types"));
        assert!(verify_output_failed("Process finished with exit code 1"));
        assert!(verify_output_failed("Unhandled Exception"));
        assert!(!verify_output_failed("test result: ok. 42 passed"));
    }
}
