//! Prompt text sent to agents.
//!
//! Every prompt names the receiving alias and the exact paths it must commit.
//! Peer references are shuffled so presentation order carries no signal.

use rand::seq::SliceRandom;

use crate::state::expected_path;

/// Where a peer's files for the current round live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFiles {
    pub alias: String,
    pub branch: String,
    pub run_number: u32,
}

impl PeerFiles {
    fn label(&self) -> String {
        self.alias.replace('_', " ").to_uppercase()
    }

    fn path(&self, artifact: &str) -> String {
        expected_path(self.run_number, &self.alias, artifact, "md")
    }
}

fn commit_block(commit_desc: &str) -> String {
    format!(
        "\nIMPORTANT: Commit arena output files in a SEPARATE commit from any\n\
         code changes. The arena commit must:\n  \
         - contain ONLY the files listed above (nothing else)\n  \
         - use the commit message: [arena] {commit_desc}\n  \
         - be your LAST commit (after any code changes)"
    )
}

pub fn commit_desc(round: u32, phase: &str, alias: &str) -> String {
    format!("round {round:02} {phase} {alias}")
}

fn shuffled(peers: &[PeerFiles]) -> Vec<&PeerFiles> {
    let mut refs: Vec<&PeerFiles> = peers.iter().collect();
    refs.shuffle(&mut rand::thread_rng());
    refs
}

/// Generate prompt. Round 0 passes no peers; later rounds reference every
/// agent's critique.
pub fn generate_prompt(
    task: &str,
    alias: &str,
    run_number: u32,
    round: u32,
    critiques: &[PeerFiles],
) -> String {
    let solution_path = expected_path(run_number, alias, "solution", "md");
    let analysis_path = expected_path(run_number, alias, "analysis", "md");

    let (critiques_block, disagreements_block) = if critiques.is_empty() {
        (String::new(), String::new())
    } else {
        let refs: Vec<String> = shuffled(critiques)
            .into_iter()
            .map(|p| {
                format!(
                    "=== CRITIQUE BY {} ===\n  Branch: {}\n  Critique: git show origin/{}:{}",
                    p.label(),
                    p.branch,
                    p.branch,
                    p.path("critique")
                )
            })
            .collect();
        (
            format!(
                "\nRead all agents' critiques by fetching them from their branches. \
                 Use `git show` to read each file:\n\n{}\n\n\
                 Read ALL critiques listed above before writing your revised solution.\n\n\
                 Produce your REVISED solution, incorporating the strongest elements \
                 from the feedback.\n",
                refs.join("\n\n")
            ),
            "\n  ## DISAGREEMENTS — Any remaining substantive disagreements\n  \
             with the other approaches, or \"None.\""
                .to_string(),
        )
    };

    format!(
        "You are {alias}. {task}\n{critiques_block}\n\
         After completing your work, commit your structured response as two files:\n  \
         {solution_path}\n  {analysis_path}\n\n\
         {solution_path} should contain:\n  \
         ## PLAN — Numbered key decisions with rationale.\n  \
         ## CHANGES — Unified diff or precise change descriptions.\n\n\
         {analysis_path} should contain:\n  \
         ## RISKS — Known risks, edge cases, trade-offs.\n  \
         ## OPEN QUESTIONS — Uncertainties requiring verification.{disagreements_block}\n{}",
        commit_block(&commit_desc(round, "generate", alias))
    )
}

/// Evaluate prompt: critique every solution, then commit a JSON verdict.
pub fn evaluate_prompt(alias: &str, peers: &[PeerFiles], run_number: u32, round: u32) -> String {
    let references = shuffled(peers)
        .into_iter()
        .map(|p| {
            format!(
                "=== {} ===\n  Branch: {}\n  Solution: git show origin/{}:{}\n  Analysis: git show origin/{}:{}",
                p.label(),
                p.branch,
                p.branch,
                p.path("solution"),
                p.branch,
                p.path("analysis")
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let critique_path = expected_path(run_number, alias, "critique", "md");
    let verdict_path = expected_path(run_number, alias, "verdict", "json");

    format!(
        "You are {alias}. Read the solutions and analyses from all agents by\n\
         fetching them from their branches. Use `git show` to read each file:\n\n\
         {references}\n\n\
         Read ALL files listed above before writing your critique.\n\n\
         Your task has two parts:\n\n\
         PART 1 — CRITIQUE (commit to {critique_path})\n\n\
         For each agent's solution:\n\
         - Strengths: what they do well.\n\
         - Weaknesses: what's wrong or suboptimal.\n\
         - Errors: anything factually incorrect.\n\n\
         Then state your position:\n\
         - What you're keeping from your original approach and why.\n\
         - What you'd adopt from others and why.\n\
         - What you still disagree on and why.\n\n\
         PART 2 — VERDICT (commit to {verdict_path})\n\n\
         {verdict_path} must be valid JSON with this exact schema:\n\
         {{\n  \
           \"convergence_score\": <1-10>,\n  \
           \"best_solutions\": [<aliases exactly as written (e.g. \"agent_a\"), excluding your own ({alias}), at least one required>],\n  \
           \"divergences\": [\n    \
             {{\"topic\": \"<short label>\", \"description\": \"<what specifically differs and between whom>\"}}\n  \
           ],\n  \
           \"rationale\": \"<why these solutions are best / what still differs>\"\n\
         }}\n\n\
         SCORING RULES (strictly enforced):\n\
         - If your divergences list is EMPTY, your score MUST be 10.\n\
         - If your divergences list is NON-EMPTY, your score MUST be 9 or lower.\n\
         - Each divergence must be specific and actionable, not vague.\n\n\
         Vote for the best solution(s) OTHER than your own.\n\n\
         Commit both files:\n  {critique_path}\n  {verdict_path}\n{}",
        commit_block(&commit_desc(round, "evaluate", alias))
    )
}

/// Re-prompt for an artifact the agent did not commit.
pub fn file_commit_retry_prompt(expected_path: &str, commit_desc: &str) -> String {
    format!(
        "You did not commit the expected arena output file:\n  {expected_path}\n\n\
         Please create and commit this file now. The arena commit must:\n  \
         - contain ONLY files under arenas/\n  \
         - use the commit message: [arena] {commit_desc}\n  \
         - be your LAST commit (after any code changes)\n"
    )
}

pub fn verify_prompt(command: &str) -> String {
    format!("Run this command and report the result: {command}")
}

/// Wrap an operator comment so the agent knows where it came from.
pub fn operator_prompt(message: &str) -> String {
    format!("The arena operator has provided additional context for your current task:\n\n{message}")
}
