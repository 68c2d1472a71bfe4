//! Arena coordination library
//!
//! Runs several remote coding agents, each on a different model, against the
//! same task. They produce competing solutions, critique each other, vote,
//! and iterate until they converge on a winner.
//!
//! # Components
//!
//! - [`state`]: typed run state, crash-safe persistence, blob store
//! - [`agent`]: remote agent transport, retries, completion waits
//! - [`consensus`]: verdict parsing and the N-1 quorum election
//! - [`engine`]: the resumable GENERATE/EVALUATE state machine
//! - [`report`]: markdown report, archives and the winning solution
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use arena_coordination::{
//!     AgentCoordinator, CloudAgentsClient, EngineSettings, GhCliSource, PhaseEngine,
//!     StateStore, WaitSettings,
//! };
//!
//! # async fn example() -> arena_coordination::ArenaResult<()> {
//! let settings = EngineSettings::from_env()?;
//! let client = CloudAgentsClient::new("api-key", &settings)?;
//! let coordinator = AgentCoordinator::new(Arc::new(client), WaitSettings::from(&settings));
//! let engine = PhaseEngine::new(
//!     StateStore::new("arenas/0001"),
//!     coordinator,
//!     Arc::new(GhCliSource::new(settings.fetch_timeout())),
//!     settings,
//! );
//! let outcome = engine.run().await?;
//! println!("winner: {:?}", outcome.winner);
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod error;
pub mod report;
pub mod state;

#[cfg(feature = "test-support")]
pub mod testing;

pub use agent::{
    default_repo_from_remote, AgentCoordinator, AgentStatus, AgentTransport, ArtifactSource,
    CloudAgentsClient, GhCliSource, RetryPolicy, WaitSettings,
};
pub use config::EngineSettings;
pub use consensus::{decide_round, parse_verdict, Verdict};
pub use engine::{
    append_comment, reopen_run, run_status, PendingComment, PhaseEngine, RunStatus, StepOutcome,
};
pub use error::{ArenaError, ArenaResult};
pub use state::{
    init_state, latest_run_dir, next_run_dir, run_number_from_dir, Phase, ProgressStatus,
    RunConfig, RunState, StateStore, VerifyMode,
};
