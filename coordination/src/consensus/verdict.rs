//! Verdict parsing and normalization.
//!
//! Agents commit a JSON verdict:
//!
//! ```json
//! {
//!   "convergence_score": 9,
//!   "best_solutions": ["agent_b"],
//!   "divergences": [{"topic": "errors", "description": "anyhow vs thiserror"}],
//!   "rationale": "..."
//! }
//! ```
//!
//! Models are sloppy with this, so parsing is lenient: the score may be a
//! string or float, divergences may be bare strings, and the JSON may sit in
//! a fenced code block inside prose. Anything unparseable becomes a neutral
//! verdict that carries no score and no votes.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tracing::{info, warn};

use crate::state::Divergence;

pub const MIN_SCORE: u8 = 1;
pub const MAX_SCORE: u8 = 10;
/// Highest score allowed while any divergence remains.
pub const DIVERGENT_SCORE_CAP: u8 = 9;

static FENCED_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n(.*?)\n\s*```").expect("FENCED_BLOCK_RE regex should compile")
});

/// One agent's normalized verdict.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Verdict {
    /// `None` when the agent gave no usable score.
    pub score: Option<u8>,
    /// Voted-for aliases, deduplicated, known aliases only.
    pub votes: Vec<String>,
    pub divergences: Vec<Divergence>,
    pub rationale: Option<String>,
}

impl Verdict {
    /// Verdict used when nothing could be parsed.
    pub fn neutral() -> Self {
        Self::default()
    }

    pub fn is_neutral(&self) -> bool {
        self.score.is_none() && self.votes.is_empty() && self.divergences.is_empty()
    }

    /// Remove a vote for `alias`. Returns whether one was present.
    pub fn strip_self_vote(&mut self, alias: &str) -> bool {
        let before = self.votes.len();
        self.votes.retain(|v| v != alias);
        self.votes.len() != before
    }

    /// No divergences means full convergence (10); any divergence caps at 9.
    pub fn enforce_consistency(&mut self) {
        if let Some(score) = self.score {
            let adjusted = if self.divergences.is_empty() {
                MAX_SCORE
            } else {
                score.min(DIVERGENT_SCORE_CAP)
            };
            if adjusted != score {
                info!(
                    reported = score,
                    adjusted,
                    divergences = self.divergences.len(),
                    "Adjusted score to match divergences"
                );
                self.score = Some(adjusted);
            }
        }
    }
}

/// Lower-case, spaces to underscores: `"Agent A"` becomes `agent_a`.
pub fn normalize_alias(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

fn parse_score(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !raw.is_finite() {
        return None;
    }
    Some(raw.round().clamp(f64::from(MIN_SCORE), f64::from(MAX_SCORE)) as u8)
}

fn parse_votes(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_divergences(value: &Value) -> Vec<Divergence> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(Divergence {
                topic: s.trim().to_string(),
                description: String::new(),
            }),
            Value::Object(obj) => {
                let topic = obj.get("topic").and_then(Value::as_str).unwrap_or("").trim();
                let description = obj
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .trim();
                if topic.is_empty() && description.is_empty() {
                    None
                } else {
                    Some(Divergence {
                        topic: if topic.is_empty() { "unspecified" } else { topic }.to_string(),
                        description: description.to_string(),
                    })
                }
            }
            _ => None,
        })
        .collect()
}

fn from_object(obj: &serde_json::Map<String, Value>) -> Verdict {
    let pick = |keys: &[&str]| keys.iter().find_map(|k| obj.get(*k));
    Verdict {
        score: pick(&["convergence_score", "score"]).and_then(parse_score),
        votes: pick(&["best_solutions", "votes"])
            .map(parse_votes)
            .unwrap_or_default(),
        divergences: obj
            .get("divergences")
            .map(parse_divergences)
            .unwrap_or_default(),
        rationale: obj
            .get("rationale")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

/// Raw verdict before alias filtering: direct JSON, then the first fenced
/// block, else `None`.
fn parse_raw(text: &str) -> Option<Verdict> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text.trim()) {
        return Some(from_object(&obj));
    }
    let block = FENCED_BLOCK_RE.captures(text)?.get(1)?.as_str();
    match serde_json::from_str::<Value>(block) {
        Ok(Value::Object(obj)) => {
            info!("Parsed verdict from fenced JSON code block");
            Some(from_object(&obj))
        }
        _ => None,
    }
}

/// Parse and normalize a verdict.
///
/// Votes are normalized, deduplicated and restricted to `valid_aliases`;
/// the score is made consistent with the divergence list.
pub fn parse_verdict(text: &str, valid_aliases: &BTreeSet<String>) -> Verdict {
    let Some(mut verdict) = parse_raw(text) else {
        if !text.trim().is_empty() {
            warn!("Failed to parse verdict; treating as neutral");
        }
        return Verdict::neutral();
    };

    let mut seen = BTreeSet::new();
    let mut votes = Vec::with_capacity(verdict.votes.len());
    for raw in &verdict.votes {
        let alias = normalize_alias(raw);
        if !valid_aliases.contains(&alias) {
            warn!(vote = %raw, "Dropping vote for unknown alias");
            continue;
        }
        if seen.insert(alias.clone()) {
            votes.push(alias);
        }
    }
    verdict.votes = votes;
    verdict.enforce_consistency();
    verdict
}
