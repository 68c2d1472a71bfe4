//! Run state and its persistence
//!
//! A run is a directory (`arenas/NNNN/`) holding one state document plus the
//! blobs it points at:
//!
//! ```text
//! arenas/0003/
//!   state.yaml          version: 2, small scalar fields and blob pointers
//!   blobs/<hash>.md     solutions, analyses, critiques, verdict history
//!   conversations/      transcript per model
//!   report.md
//! ```
//!
//! The engine loads the document, mutates it, and saves it after every
//! meaningful sub-step, so the process can be killed at any instant and
//! resumed without losing or repeating completed work.

pub mod blob;
pub mod layout;
pub mod legacy;
pub mod sanitize;
pub mod store;
pub mod types;

pub use blob::{content_hash, content_uid, write_atomic, BlobStore};
pub use layout::{latest_run_dir, next_run_dir, run_number_from_dir, DEFAULT_RUNS_ROOT};
pub use sanitize::sanitize_filename_component;
pub use store::{StateStore, CURRENT_VERSION, STATE_FILE};
pub use types::{
    aliases_for_count, expected_path, init_state, Divergence, Phase, PhaseTiming,
    ProgressStatus, RoundSummary, RunConfig, RunState, VerifyMode, DEFAULT_MODELS,
    TASK_PLACEHOLDER,
};
