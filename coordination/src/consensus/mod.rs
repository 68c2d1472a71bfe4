//! Peer-voting consensus
//!
//! ```text
//!   verdict text ──parse──▶ Verdict ──strip self vote──▶ votes/scores
//!                                                          │
//!                              decide_round ◀──────────────┘
//!                   min score >= 9  &&  candidate with N-1 votes
//! ```
//!
//! Peer voting with an N-1 quorum is the only strategy.

pub mod tally;
pub mod verdict;

pub use tally::{decide_round, elect, Election, RoundDecision, CONSENSUS_SCORE};
pub use verdict::{normalize_alias, parse_verdict, Verdict, DIVERGENT_SCORE_CAP};
