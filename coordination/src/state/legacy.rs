//! Upgrade path for version-1 state documents.
//!
//! Version 1 documents carry no `version` key, name several fields
//! differently (`agent_ids`, `sent_msg_counts`, `verify_*`), record timing as
//! epoch seconds and point at externalized text with `file:` references.
//! Pointers are left in place; the store resolves them after the upgrade.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use super::types::{Divergence, Phase, PhaseTiming, ProgressStatus, RunConfig, RunState};
use crate::error::{ArenaError, ArenaResult};

#[derive(Debug, Deserialize)]
struct LegacyTiming {
    #[serde(default)]
    start: Option<f64>,
    #[serde(default)]
    end: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LegacyState {
    config: RunConfig,
    alias_mapping: BTreeMap<String, String>,
    #[serde(default)]
    model_nicknames: BTreeMap<String, String>,
    #[serde(default)]
    agent_ids: BTreeMap<String, String>,
    #[serde(default)]
    round: u32,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    phase_progress: BTreeMap<String, ProgressStatus>,
    #[serde(default)]
    solutions: BTreeMap<String, String>,
    #[serde(default)]
    analyses: BTreeMap<String, String>,
    #[serde(default)]
    critiques: BTreeMap<String, String>,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    consensus_reached: Option<bool>,
    #[serde(default)]
    final_verdict: Option<String>,
    #[serde(default)]
    sent_msg_counts: BTreeMap<String, usize>,
    #[serde(default)]
    verify_results: Vec<String>,
    #[serde(default)]
    branch_names: BTreeMap<String, String>,
    #[serde(default)]
    token_usage: BTreeMap<String, u64>,
    #[serde(default)]
    verdict_history: Vec<String>,
    #[serde(default)]
    agent_timing: BTreeMap<String, BTreeMap<String, LegacyTiming>>,
    #[serde(default)]
    agent_metadata: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    verify_votes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    verify_scores: BTreeMap<String, i64>,
    #[serde(default)]
    verify_divergences: BTreeMap<String, Vec<Divergence>>,
    #[serde(default)]
    verify_winner: Option<String>,
}

/// Older releases split generation into `solve` and `revise`.
fn upgrade_phase(raw: Option<&str>) -> ArenaResult<Phase> {
    match raw.map(|p| p.trim().to_ascii_lowercase()).as_deref() {
        None | Some("solve") | Some("generate") | Some("revise") => Ok(Phase::Generate),
        Some("evaluate") => Ok(Phase::Evaluate),
        Some("done") => Ok(Phase::Done),
        Some(other) => Err(ArenaError::malformed(format!("unknown phase '{other}'"))),
    }
}

fn epoch_to_utc(secs: Option<f64>) -> Option<DateTime<Utc>> {
    let secs = secs?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = (secs.fract() * 1e9) as u32;
    DateTime::from_timestamp(whole, nanos)
}

/// Convert a parsed version-1 document into the current shape.
pub fn upgrade(value: serde_yaml::Value) -> ArenaResult<RunState> {
    let legacy: LegacyState = serde_yaml::from_value(value)?;
    let phase = upgrade_phase(legacy.phase.as_deref())?;

    let agent_timing = legacy
        .agent_timing
        .into_iter()
        .map(|(alias, phases)| {
            let phases = phases
                .into_iter()
                .map(|(name, t)| {
                    let name = match name.as_str() {
                        "solve" | "revise" => Phase::Generate.to_string(),
                        _ => name,
                    };
                    let timing = PhaseTiming {
                        start: epoch_to_utc(t.start),
                        end: epoch_to_utc(t.end),
                    };
                    (name, timing)
                })
                .collect();
            (alias, phases)
        })
        .collect();

    let agent_summaries = legacy
        .agent_metadata
        .into_iter()
        .filter_map(|(alias, meta)| {
            meta.get("summary")
                .and_then(|v| v.as_str())
                .map(|s| (alias, s.to_string()))
        })
        .collect();

    let scores = legacy
        .verify_scores
        .into_iter()
        .map(|(alias, s)| (alias, s.clamp(1, 10) as u8))
        .collect();

    info!(
        aliases = legacy.alias_mapping.len(),
        round = legacy.round,
        "Upgrading version 1 state document"
    );

    Ok(RunState {
        config: legacy.config,
        alias_mapping: legacy.alias_mapping,
        model_nicknames: legacy.model_nicknames,
        agent_handles: legacy.agent_ids,
        branch_names: legacy.branch_names,
        round: legacy.round,
        phase,
        phase_progress: legacy.phase_progress,
        sent_watermarks: legacy.sent_msg_counts,
        solutions: legacy.solutions,
        analyses: legacy.analyses,
        critiques: legacy.critiques,
        votes: legacy.verify_votes,
        scores,
        divergences: legacy.verify_divergences,
        winner: legacy.verify_winner,
        completed: legacy.completed,
        consensus_reached: legacy.consensus_reached,
        final_verdict: legacy.final_verdict,
        verdict_history: legacy.verdict_history,
        verify_results: legacy.verify_results,
        token_usage: legacy.token_usage,
        agent_timing,
        agent_summaries,
    })
}
