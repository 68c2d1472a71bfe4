//! Vote tally and winner election.
//!
//! Each of the N agents votes for peers, never itself. A candidate wins with
//! at least N-1 votes, i.e. every other agent backed it. Consensus also
//! needs every agent to report a score of at least 9.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Minimum score every agent must report for consensus.
pub const CONSENSUS_SCORE: u8 = 9;

/// Tally for one round.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Election {
    /// Candidate alias to number of distinct non-self voters.
    pub tally: BTreeMap<String, usize>,
    /// Votes needed to win.
    pub quorum: usize,
    pub winner: Option<String>,
}

/// Count non-self votes and elect a winner.
///
/// Ties between qualifying candidates go to the higher count, then to the
/// lexicographically smallest alias.
pub fn elect(votes: &BTreeMap<String, Vec<String>>, agent_count: usize) -> Election {
    let quorum = agent_count.saturating_sub(1).max(1);
    let mut tally: BTreeMap<String, usize> = BTreeMap::new();

    for (voter, ballot) in votes {
        let unique: BTreeSet<&String> = ballot.iter().filter(|c| *c != voter).collect();
        for candidate in unique {
            *tally.entry(candidate.clone()).or_insert(0) += 1;
        }
    }

    // BTreeMap iterates in alias order, so the first max wins ties.
    let winner = tally
        .iter()
        .filter(|(_, count)| **count >= quorum)
        .fold(None::<(&String, usize)>, |best, (alias, count)| match best {
            Some((_, best_count)) if best_count >= *count => best,
            _ => Some((alias, *count)),
        })
        .map(|(alias, _)| alias.clone());

    Election {
        tally,
        quorum,
        winner,
    }
}

/// Outcome of an EVALUATE round before any verification commands run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundDecision {
    /// Lowest score across all agents; an agent without a score counts as 0.
    pub min_score: u8,
    pub election: Election,
    pub consensus: bool,
}

impl RoundDecision {
    pub fn winner(&self) -> Option<&str> {
        self.election.winner.as_deref()
    }
}

/// Decide a round from every alias's votes and scores.
pub fn decide_round(
    aliases: &[String],
    votes: &BTreeMap<String, Vec<String>>,
    scores: &BTreeMap<String, u8>,
) -> RoundDecision {
    let min_score = aliases
        .iter()
        .map(|a| scores.get(a).copied().unwrap_or(0))
        .min()
        .unwrap_or(0);
    let election = elect(votes, aliases.len());
    let consensus = min_score >= CONSENSUS_SCORE && election.winner.is_some();
    RoundDecision {
        min_score,
        election,
        consensus,
    }
}
