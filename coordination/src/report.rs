//! Human-readable run output derived from state.
//!
//! - `report.md`: rewritten after every step
//! - `winning-solution.md`: written once the run completes with a winner
//! - archived artifacts: one file per agent output per round, named
//!   `{round:02}-{phase_num}-{phase}-{model}-{artifact}-{uid}.{ext}` so the
//!   run directory keeps every round even though agents overwrite theirs
//!
//! Nothing here feeds back into the engine.

use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, info};

use crate::agent::repository_url;
use crate::error::ArenaResult;
use crate::state::{
    content_uid, sanitize_filename_component, write_atomic, Phase, RoundSummary, RunState,
};

pub const REPORT_FILE: &str = "report.md";
pub const WINNING_SOLUTION_FILE: &str = "winning-solution.md";

const TASK_PREVIEW_CHARS: usize = 120;

// ============================================================================
// Archive
// ============================================================================

/// Deterministic archive filename; the uid is derived from `content`.
pub fn archive_name(
    round: u32,
    phase: Phase,
    model: &str,
    artifact: &str,
    content: &str,
    ext: &str,
) -> String {
    format!(
        "{round:02}-{}-{}-{}-{artifact}-{}.{ext}",
        phase.number(),
        phase,
        sanitize_filename_component(model),
        content_uid(content)
    )
}

fn model_of<'a>(state: &'a RunState, alias: &'a str) -> &'a str {
    state
        .alias_mapping
        .get(alias)
        .map(String::as_str)
        .unwrap_or("unknown")
}

/// Verdict as archived: score, votes and divergences for one alias.
fn archived_verdict(state: &RunState, alias: &str) -> Option<String> {
    let votes = state.votes.get(alias);
    let score = state.scores.get(alias);
    if votes.is_none() && score.is_none() {
        return None;
    }
    let value = json!({
        "convergence_score": score,
        "best_solutions": votes.cloned().unwrap_or_default(),
        "divergences": state.divergences.get(alias).cloned().unwrap_or_default(),
    });
    serde_json::to_string_pretty(&value).ok()
}

fn archive_one(run_dir: &Path, name: &str, content: &str) -> ArenaResult<bool> {
    let path = run_dir.join(name);
    if path.exists() {
        return Ok(false);
    }
    write_atomic(&path, content.as_bytes())?;
    debug!(file = name, "Archived artifact");
    Ok(true)
}

/// Archive the current round's non-empty outputs. Existing files are kept.
/// Returns the number of files written.
pub fn archive_round(run_dir: &Path, state: &RunState) -> ArenaResult<usize> {
    let round = state.round;
    let mut written = 0;

    for alias in state.aliases() {
        let model = model_of(state, alias);
        let text_artifacts = [
            (Phase::Generate, "solution", state.solutions.get(alias)),
            (Phase::Generate, "analysis", state.analyses.get(alias)),
            (Phase::Evaluate, "critique", state.critiques.get(alias)),
        ];
        for (phase, artifact, content) in text_artifacts {
            let Some(content) = content.filter(|c| !c.is_empty()) else {
                continue;
            };
            let name = archive_name(round, phase, model, artifact, content, "md");
            if archive_one(run_dir, &name, content)? {
                written += 1;
            }
        }
        if let Some(verdict) = archived_verdict(state, alias) {
            let name = archive_name(round, Phase::Evaluate, model, "verdict", &verdict, "json");
            if archive_one(run_dir, &name, &verdict)? {
                written += 1;
            }
        }
    }
    Ok(written)
}

/// Archived files for `round`, sorted by name.
fn archived_files(run_dir: &Path, round: usize) -> Vec<String> {
    let prefix = format!("{round:02}-");
    let Ok(entries) = std::fs::read_dir(run_dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| n.starts_with(&prefix))
        .collect();
    names.sort();
    names
}

// ============================================================================
// Report
// ============================================================================

/// Compare URL for opening a PR from `alias`'s branch.
pub fn pr_url(state: &RunState, alias: &str) -> Option<String> {
    let branch = state.branch_names.get(alias)?;
    Some(format!(
        "{}/compare/{}...{}?expand=1",
        repository_url(&state.config.repo),
        state.config.base_branch,
        branch
    ))
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

fn task_preview(task: &str) -> String {
    if task.chars().count() > TASK_PREVIEW_CHARS {
        let head: String = task.chars().take(TASK_PREVIEW_CHARS).collect();
        format!("{head}…")
    } else {
        task.to_string()
    }
}

/// Mermaid graph of one round's votes: a node per alias, an edge per vote.
fn vote_graph(state: &RunState, summary: &RoundSummary) -> String {
    let mut graph = String::from("```mermaid\ngraph\n");
    for alias in state.aliases() {
        let score = summary
            .scores
            .get(alias)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "—".to_string());
        graph.push_str(&format!(
            "    {alias}[\"`**{alias}**\n{}\nScore: {score}`\"]\n",
            model_of(state, alias)
        ));
    }
    for alias in state.aliases() {
        for votee in summary.votes.get(alias).into_iter().flatten() {
            if state.alias_mapping.contains_key(votee) {
                graph.push_str(&format!("    {alias} --> {votee}\n"));
            }
        }
    }
    graph.push_str("```\n");
    graph
}

fn round_section(
    state: &RunState,
    run_dir: &Path,
    index: usize,
    summary: &RoundSummary,
    previous_tokens: &std::collections::BTreeMap<String, u64>,
) -> String {
    let mut out = format!("## Round {index}\n\n");

    let deltas: Vec<(String, u64)> = state
        .aliases()
        .filter_map(|alias| {
            let current = summary.token_usage.get(alias).copied().unwrap_or(0);
            (current > 0).then(|| {
                let before = previous_tokens.get(alias).copied().unwrap_or(0);
                (alias.clone(), current.saturating_sub(before))
            })
        })
        .collect();
    let with_tokens = !deltas.is_empty();

    if with_tokens {
        out.push_str("| Agent | Model | Score | Voted for | Divergences | Tokens |\n");
        out.push_str("|-------|-------|------:|-----------|-------------|-------:|\n");
    } else {
        out.push_str("| Agent | Model | Score | Voted for | Divergences |\n");
        out.push_str("|-------|-------|------:|-----------|-------------|\n");
    }
    for alias in state.aliases() {
        let score = summary
            .scores
            .get(alias)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "—".to_string());
        let votes = summary
            .votes
            .get(alias)
            .map(|v| v.join(", "))
            .unwrap_or_default();
        let divergences = summary.divergences.get(alias).map(Vec::len).unwrap_or(0);
        let mut row = format!(
            "| {alias} | {} | {score} | {votes} | {divergences} |",
            model_of(state, alias)
        );
        if with_tokens {
            let delta = deltas
                .iter()
                .find(|(a, _)| a == alias)
                .map(|(_, d)| *d)
                .unwrap_or(0);
            row.push_str(&format!(" {delta} |"));
        }
        out.push_str(&row);
        out.push('\n');
    }
    out.push_str(&format!("\n**Min score:** {}\n\n", summary.min_score()));
    out.push_str(&vote_graph(state, summary));
    out.push('\n');

    let details: Vec<String> = state
        .aliases()
        .flat_map(|alias| {
            summary
                .divergences
                .get(alias)
                .into_iter()
                .flatten()
                .map(move |d| format!("- **{alias}** — *{}*: {}", d.topic, d.description))
        })
        .collect();
    if !details.is_empty() {
        out.push_str("<details><summary>Divergences</summary>\n\n");
        out.push_str(&details.join("\n"));
        out.push_str("\n\n</details>\n\n");
    }

    let files = archived_files(run_dir, index);
    if !files.is_empty() {
        out.push_str("<details><summary>Archived files</summary>\n\n");
        for name in files {
            out.push_str(&format!("- [{name}]({name})\n"));
        }
        out.push_str("\n</details>\n\n");
    }
    out.push_str("---\n\n");
    out
}

/// Render `report.md`. Per-round sections come from `verdict_history`.
pub fn render_report(state: &RunState, run_dir: &Path) -> String {
    let mut report = String::from("# Arena Report\n\n");
    report.push_str(&format!("**Task:** {}\n", task_preview(&state.config.task)));
    report.push_str(&format!("**Round:** {}\n", state.round));
    report.push_str(&format!("**Phase:** {}\n", state.phase));
    report.push_str(&format!("**Completed:** {}\n", yes_no(state.completed)));
    if let Some(consensus) = state.consensus_reached {
        report.push_str(&format!("**Consensus:** {}\n", yes_no(consensus)));
    }
    if let Some(winner) = &state.winner {
        report.push_str(&format!("**Winner:** {winner} ({})\n", model_of(state, winner)));
    }

    report.push_str("\n### Agents\n\n| Alias | Model | Branch |\n|-------|-------|--------|\n");
    for alias in state.aliases() {
        let branch = state.branch_names.get(alias).map(String::as_str).unwrap_or("");
        report.push_str(&format!("| {alias} | {} | {branch} |\n", model_of(state, alias)));
    }
    report.push_str("\n---\n\n");

    let mut previous_tokens = std::collections::BTreeMap::new();
    for (index, entry) in state.verdict_history.iter().enumerate() {
        let summary = RoundSummary::parse(entry);
        report.push_str(&round_section(state, run_dir, index, &summary, &previous_tokens));
        if !summary.token_usage.is_empty() {
            previous_tokens = summary.token_usage;
        }
    }

    if state.consensus_reached == Some(true) {
        if let Some(url) = state.winner.as_deref().and_then(|w| pr_url(state, w)) {
            report.push_str(&format!("**[Create PR for winner]({url})**\n\n---\n\n"));
        }
    }

    if !state.token_usage.is_empty() {
        report.push_str("## Token Usage\n\n");
        for (alias, tokens) in &state.token_usage {
            report.push_str(&format!(
                "- **{alias}** ({}): {tokens} tokens\n",
                model_of(state, alias)
            ));
        }
        let total: u64 = state.token_usage.values().sum();
        report.push_str(&format!("- **Total**: {total} tokens\n"));
    }
    report
}

pub fn update_report(run_dir: &Path, state: &RunState) -> ArenaResult<PathBuf> {
    let path = run_dir.join(REPORT_FILE);
    write_atomic(&path, render_report(state, run_dir).as_bytes())?;
    debug!(path = %path.display(), "Report updated");
    Ok(path)
}

// ============================================================================
// Winning solution
// ============================================================================

/// Render `winning-solution.md`; `None` without a winner.
pub fn render_winning_solution(state: &RunState) -> Option<String> {
    let winner = state.winner.as_deref()?;
    let final_score = state.scores.values().copied().min().unwrap_or(0);

    let mut out = String::from("# Winning Solution\n\n");
    out.push_str(&format!("**Winner:** {winner} ({})\n", model_of(state, winner)));
    out.push_str(&format!("**Final consensus score:** {final_score}\n"));
    out.push_str(&format!("**Rounds:** {}\n", state.round));
    if let Some(url) = pr_url(state, winner) {
        out.push_str(&format!("**PR:** {url}\n"));
    }
    out.push_str("\n---\n\n");

    if let Some(solution) = state.solutions.get(winner).filter(|s| !s.is_empty()) {
        out.push_str(&format!("## Solution\n\n{solution}\n\n"));
    }
    if let Some(analysis) = state.analyses.get(winner).filter(|s| !s.is_empty()) {
        out.push_str(&format!("---\n\n## Analysis\n\n{analysis}\n"));
    }
    Some(out)
}

pub fn write_winning_solution(run_dir: &Path, state: &RunState) -> ArenaResult<Option<PathBuf>> {
    let Some(body) = render_winning_solution(state) else {
        return Ok(None);
    };
    let path = run_dir.join(WINNING_SOLUTION_FILE);
    write_atomic(&path, body.as_bytes())?;
    info!(path = %path.display(), "Winning solution written");
    Ok(Some(path))
}
