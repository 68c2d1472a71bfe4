//! End-to-end phase engine runs against the in-memory agent service.
//!
//! Every test drives a real `PhaseEngine` over a temp run directory. The
//! fake agents commit whatever the prompt asks for, so the tests only
//! script the interesting parts: verdict contents, withheld files, late
//! replies and verification output.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arena_coordination::agent::{AgentTransport, ConversationMessage};
use arena_coordination::engine::prompts::{evaluate_prompt, generate_prompt, PeerFiles};
use arena_coordination::engine::{pending_comments_path, CONVERSATIONS_DIR};
use arena_coordination::report::{REPORT_FILE, WINNING_SOLUTION_FILE};
use arena_coordination::state::{RoundSummary, TASK_PLACEHOLDER};
use arena_coordination::testing::{
    arena_responder, verdict_json, FakeCall, FakeReaction, FakeTransport, MemoryArtifacts,
    Responder, REPLY_TOKENS,
};
use arena_coordination::{
    append_comment, init_state, reopen_run, run_status, AgentCoordinator, ArenaError,
    EngineSettings, PendingComment, Phase, PhaseEngine, ProgressStatus, RunConfig, RunState,
    StateStore, VerifyMode, WaitSettings,
};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    run_dir: PathBuf,
    fake: Arc<FakeTransport>,
    engine: PhaseEngine,
}

impl Harness {
    fn new(config: RunConfig, responder: Responder) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("warn")
            .with_test_writer()
            .try_init();
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("0001");
        let models: Vec<String> = ["opus", "gpt", "gemini"].iter().map(|m| m.to_string()).collect();
        let state = init_state(config, &models).unwrap();
        StateStore::new(&run_dir).save(&state).unwrap();

        let artifacts = MemoryArtifacts::new();
        let fake = Arc::new(FakeTransport::new(artifacts.clone(), responder));
        let settings = EngineSettings::default();
        let coordinator = AgentCoordinator::new(fake.clone(), WaitSettings::from(&settings));
        let engine = PhaseEngine::new(StateStore::new(&run_dir), coordinator, artifacts, settings);
        Self {
            _dir: dir,
            run_dir,
            fake,
            engine,
        }
    }

    fn store(&self) -> StateStore {
        StateStore::new(&self.run_dir)
    }

    fn load(&self) -> RunState {
        self.store().load_required().unwrap()
    }

    fn save(&self, state: &RunState) {
        self.store().save(state).unwrap();
    }

    fn evaluate_prompts(&self) -> usize {
        self.fake.follow_ups().iter().filter(|c| c.is_evaluate()).count()
    }

    fn evaluate_prompts_to(&self, alias: &str) -> usize {
        self.fake
            .follow_ups()
            .iter()
            .filter(|c| c.is_evaluate() && c.alias.as_deref() == Some(alias))
            .count()
    }

    /// Round > 0 GENERATE prompts sent to `alias`.
    fn revision_prompts_to(&self, alias: &str) -> usize {
        self.fake
            .follow_ups()
            .iter()
            .filter(|c| {
                c.prompt.starts_with("You are")
                    && !c.is_evaluate()
                    && c.alias.as_deref() == Some(alias)
            })
            .count()
    }

    fn commit_retries(&self) -> usize {
        self.fake.follow_ups().iter().filter(|c| c.is_commit_retry()).count()
    }
}

fn config(max_rounds: u32) -> RunConfig {
    let mut config = RunConfig::new("Add retry logic to the HTTP client", "octo/widgets");
    config.max_rounds = max_rounds;
    config
}

/// Everyone backs agent_b; agent_b backs agent_a. Full convergence.
fn unanimous_for_b() -> Responder {
    arena_responder(|alias| {
        if alias == "agent_b" {
            verdict_json(10, &["agent_a"], &[])
        } else {
            verdict_json(10, &["agent_b"], &[])
        }
    })
}

/// Same votes, but every agent still reports a divergence.
fn divergent_for_b() -> Responder {
    arena_responder(|alias| {
        let pick = if alias == "agent_b" { "agent_a" } else { "agent_b" };
        verdict_json(8, &[pick], &["error handling"])
    })
}

fn with_verify_reply(base: Responder, reply: &'static str) -> Responder {
    Arc::new(move |call: &FakeCall| {
        if call.is_verify() {
            FakeReaction::reply(reply)
        } else {
            base(call)
        }
    })
}

/// `alias` leaves its verdict out of the evaluate commit. Its n-th commit
/// re-prompt gets `on_retry(n)`, or a normal reaction when that is `None`.
fn withhold_verdict<F>(base: Responder, alias: &'static str, on_retry: F) -> Responder
where
    F: Fn(usize) -> Option<FakeReaction> + Send + Sync + 'static,
{
    let retries = AtomicUsize::new(0);
    Arc::new(move |call: &FakeCall| {
        if call.alias.as_deref() != Some(alias) {
            return base(call);
        }
        if call.is_evaluate() {
            let mut reaction = base(call);
            reaction
                .commits
                .retain(|(path, _)| !path.ends_with("-verdict.json"));
            return reaction;
        }
        if call.is_commit_retry() {
            if let Some(reaction) = on_retry(retries.fetch_add(1, Ordering::SeqCst)) {
                return reaction;
            }
        }
        base(call)
    })
}

fn peer_files(state: &RunState) -> Vec<PeerFiles> {
    state
        .aliases()
        .map(|a| PeerFiles {
            alias: a.clone(),
            branch: state.branch_names[a].clone(),
            run_number: state.config.run_number,
        })
        .collect()
}

// ── Happy path ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_full_run_reaches_consensus() {
    let h = Harness::new(config(2), unanimous_for_b());

    let first = h.engine.step().await.unwrap();
    assert_eq!(first.phase, Phase::Evaluate);
    assert_eq!(first.round, 0);
    assert!(!first.completed);
    assert_eq!(h.fake.launch_count(), 3);
    assert!(h.fake.follow_ups().is_empty());

    let state = h.load();
    assert_eq!(state.solutions["agent_a"], "solution by agent_a");
    assert_eq!(state.analyses["agent_c"], "analysis by agent_c");
    assert_eq!(state.branch_names["agent_b"], "arena/agent_b");
    assert!(state
        .phase_progress
        .values()
        .all(|p| *p == ProgressStatus::Pending));

    let outcome = h.engine.step().await.unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.phase, Phase::Done);
    assert_eq!(outcome.consensus_reached, Some(true));
    assert_eq!(outcome.winner.as_deref(), Some("agent_b"));
    assert_eq!(h.evaluate_prompts(), 3);

    let state = h.load();
    assert_eq!(state.votes["agent_b"], vec!["agent_a"]);
    assert!(state.scores.values().all(|s| *s == 10));
    assert_eq!(state.verdict_history.len(), 1);
    assert!(state.final_verdict.is_some());
    assert_eq!(state.token_usage["agent_a"], 2 * REPLY_TOKENS);

    let report = std::fs::read_to_string(h.run_dir.join(REPORT_FILE)).unwrap();
    assert!(report.contains("# Arena Report"));
    let winning = std::fs::read_to_string(h.run_dir.join(WINNING_SOLUTION_FILE)).unwrap();
    assert!(winning.contains("solution by agent_b"));
    assert!(h.run_dir.join(CONVERSATIONS_DIR).join("opus.json").exists());
}

#[tokio::test(start_paused = true)]
async fn test_run_loops_until_complete() {
    let h = Harness::new(config(3), unanimous_for_b());
    let outcome = h.engine.run().await.unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.round, 0);
    assert_eq!(outcome.winner.as_deref(), Some("agent_b"));

    let status = run_status(&h.store()).unwrap();
    assert!(status.completed);
    assert_eq!(status.agents.len(), 3);
    assert_eq!(status.winner.as_deref(), Some("agent_b"));
}

#[tokio::test(start_paused = true)]
async fn test_self_vote_is_stripped() {
    let responder = arena_responder(|alias| match alias {
        "agent_a" => verdict_json(10, &["agent_a", "agent_b"], &[]),
        "agent_b" => verdict_json(10, &["agent_a"], &[]),
        _ => verdict_json(10, &["agent_b"], &[]),
    });
    let h = Harness::new(config(2), responder);
    h.engine.run().await.unwrap();

    let state = h.load();
    assert_eq!(state.votes["agent_a"], vec!["agent_b"]);
    assert_eq!(state.winner.as_deref(), Some("agent_b"));
}

// ── Consensus safety and termination ───────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_low_score_starts_next_round() {
    let h = Harness::new(config(2), divergent_for_b());
    h.engine.step().await.unwrap();
    let outcome = h.engine.step().await.unwrap();

    assert!(!outcome.completed);
    assert_eq!(outcome.round, 1);
    assert_eq!(outcome.phase, Phase::Generate);
    assert_eq!(outcome.consensus_reached, None);

    let state = h.load();
    assert!(state.critiques.is_empty());
    assert!(state.votes.is_empty());
    assert!(state.winner.is_none());
    assert_eq!(state.solutions.len(), 3);
    let summary = RoundSummary::parse(&state.verdict_history[0]);
    assert_eq!(summary.scores["agent_a"], 8);
    assert_eq!(summary.min_score(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_max_rounds_ends_without_consensus() {
    let h = Harness::new(config(1), divergent_for_b());
    let outcome = h.engine.run().await.unwrap();

    assert!(outcome.completed);
    assert_eq!(outcome.round, 1);
    assert_eq!(outcome.consensus_reached, Some(false));
    assert_eq!(outcome.winner, None);
    assert_eq!(h.evaluate_prompts(), 6);
    // Round 1 revises through follow-ups on the existing sessions.
    assert_eq!(h.fake.launch_count(), 3);
    assert!(!h.run_dir.join(WINNING_SOLUTION_FILE).exists());

    let err = h.engine.step().await.unwrap_err();
    assert!(matches!(err, ArenaError::AlreadyCompleted));
}

#[tokio::test(start_paused = true)]
async fn test_divergence_caps_reported_ten() {
    let responder = arena_responder(|alias| {
        let pick = if alias == "agent_b" { "agent_a" } else { "agent_b" };
        verdict_json(10, &[pick], &["naming"])
    });
    let h = Harness::new(config(2), responder);
    h.engine.run().await.unwrap();

    let state = h.load();
    // Capped to 9, which still meets the consensus bar.
    assert!(state.scores.values().all(|s| *s == 9));
    assert_eq!(state.consensus_reached, Some(true));
}

// ── Resume ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_resume_resends_prompt_that_never_landed() {
    let h = Harness::new(config(2), unanimous_for_b());
    h.engine.step().await.unwrap();

    // Crash between persisting SENT and the POST.
    let mut state = h.load();
    let handle = state.agent_handles["agent_a"].clone();
    state
        .phase_progress
        .insert("agent_a".into(), ProgressStatus::Sent);
    state
        .sent_watermarks
        .insert("agent_a".into(), h.fake.message_len(&handle));
    h.save(&state);

    let outcome = h.engine.step().await.unwrap();
    assert_eq!(h.evaluate_prompts_to("agent_a"), 1);
    assert_eq!(h.evaluate_prompts(), 3);
    assert_eq!(outcome.winner.as_deref(), Some("agent_b"));
}

#[tokio::test(start_paused = true)]
async fn test_resume_waits_for_prompt_already_delivered() {
    let h = Harness::new(config(2), unanimous_for_b());
    h.engine.step().await.unwrap();

    // Crash after the POST landed but before the reply was collected.
    let mut state = h.load();
    let handle = state.agent_handles["agent_a"].clone();
    let watermark = h.fake.message_len(&handle);
    let prompt = evaluate_prompt("agent_a", &peer_files(&state), 1, 0);
    h.fake.follow_up(&handle, &prompt).await.unwrap();
    state
        .phase_progress
        .insert("agent_a".into(), ProgressStatus::Sent);
    state.sent_watermarks.insert("agent_a".into(), watermark);
    h.save(&state);

    let outcome = h.engine.step().await.unwrap();
    assert_eq!(h.evaluate_prompts_to("agent_a"), 1);
    assert_eq!(h.evaluate_prompts(), 3);
    assert!(outcome.completed);
}

#[tokio::test(start_paused = true)]
async fn test_comment_reply_does_not_hide_unlanded_prompt() {
    let h = Harness::new(config(2), unanimous_for_b());
    h.engine.step().await.unwrap();

    let mut state = h.load();
    let handle = state.agent_handles["agent_a"].clone();
    state
        .phase_progress
        .insert("agent_a".into(), ProgressStatus::Sent);
    state
        .sent_watermarks
        .insert("agent_a".into(), h.fake.message_len(&handle));
    h.save(&state);
    append_comment(&h.run_dir, PendingComment::new("keep it small")).unwrap();

    let outcome = h.engine.step().await.unwrap();
    let comments = h.fake.follow_ups().iter().filter(|c| c.is_operator_comment()).count();
    assert_eq!(comments, 3);
    assert_eq!(h.evaluate_prompts_to("agent_a"), 1);
    assert_eq!(h.evaluate_prompts(), 3);
    assert_eq!(h.commit_retries(), 0);
    assert_eq!(outcome.winner.as_deref(), Some("agent_b"));
}

#[tokio::test(start_paused = true)]
async fn test_resume_mid_revision_round() {
    let h = Harness::new(config(2), divergent_for_b());
    h.engine.step().await.unwrap();
    let outcome = h.engine.step().await.unwrap();
    assert_eq!((outcome.round, outcome.phase), (1, Phase::Generate));

    let mut state = h.load();
    let peers = peer_files(&state);

    // agent_a: SENT persisted, POST never made.
    let handle_a = state.agent_handles["agent_a"].clone();
    state
        .phase_progress
        .insert("agent_a".into(), ProgressStatus::Sent);
    state
        .sent_watermarks
        .insert("agent_a".into(), h.fake.message_len(&handle_a));

    // agent_b: the revision prompt landed before the crash.
    let handle_b = state.agent_handles["agent_b"].clone();
    let watermark_b = h.fake.message_len(&handle_b);
    let prompt = generate_prompt(&state.config.task, "agent_b", state.config.run_number, 1, &peers);
    h.fake.follow_up(&handle_b, &prompt).await.unwrap();
    state
        .phase_progress
        .insert("agent_b".into(), ProgressStatus::Sent);
    state.sent_watermarks.insert("agent_b".into(), watermark_b);
    h.save(&state);

    let outcome = h.engine.step().await.unwrap();
    assert_eq!(h.revision_prompts_to("agent_a"), 1);
    assert_eq!(h.revision_prompts_to("agent_b"), 1);
    assert_eq!(h.revision_prompts_to("agent_c"), 1);
    assert_eq!(h.commit_retries(), 0);
    assert_eq!((outcome.round, outcome.phase), (1, Phase::Evaluate));

    let state = h.load();
    assert!(state.sent_watermarks.is_empty());
    assert_eq!(state.solutions.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_finished_agents_are_not_prompted_again() {
    let h = Harness::new(config(2), unanimous_for_b());
    h.engine.step().await.unwrap();

    // Crash after every verdict was extracted, before the round concluded.
    let mut state = h.load();
    for (voter, pick) in [("agent_a", "agent_b"), ("agent_b", "agent_a"), ("agent_c", "agent_b")] {
        state.votes.insert(voter.into(), vec![pick.into()]);
        state.scores.insert(voter.into(), 10);
        state.phase_progress.insert(voter.into(), ProgressStatus::Done);
    }
    h.save(&state);

    let before = h.fake.calls().len();
    let outcome = h.engine.step().await.unwrap();
    assert!(h.fake.follow_ups().is_empty());
    assert_eq!(outcome.winner.as_deref(), Some("agent_b"));
    assert_eq!(h.fake.calls().len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_failure_mid_extraction_resumes_without_redoing_done_agents() {
    // agent_b's first re-prompt for its verdict is never answered.
    let responder = withhold_verdict(unanimous_for_b(), "agent_b", |n| {
        (n == 0).then(FakeReaction::default)
    });
    let h = Harness::new(config(2), responder);
    h.engine.step().await.unwrap();

    let err = h.engine.step().await.unwrap_err();
    assert!(matches!(err, ArenaError::GraceExpired { .. }), "{err:?}");

    let state = h.load();
    assert_eq!(state.phase, Phase::Evaluate);
    assert_eq!(state.progress("agent_a"), ProgressStatus::Done);
    assert_eq!(state.progress("agent_b"), ProgressStatus::Sent);
    let a_calls = h.fake.follow_ups_to("agent_a");

    // The agent answers late.
    let handle = state.agent_handles["agent_b"].clone();
    h.fake
        .push_message(&handle, ConversationMessage::agent("sorry, back now"));

    let outcome = h.engine.step().await.unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.winner.as_deref(), Some("agent_b"));
    assert_eq!(h.evaluate_prompts(), 3);
    assert_eq!(h.fake.follow_ups_to("agent_a"), a_calls);
    assert_eq!(h.commit_retries(), 2);
}

// ── Missing artifacts ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_missing_verdict_is_reprompted() {
    let responder = withhold_verdict(unanimous_for_b(), "agent_c", |_| None);
    let h = Harness::new(config(2), responder);
    h.engine.run().await.unwrap();

    assert_eq!(h.commit_retries(), 1);
    let retry = h
        .fake
        .follow_ups()
        .into_iter()
        .find(|c| c.is_commit_retry())
        .unwrap();
    assert_eq!(retry.alias.as_deref(), Some("agent_c"));
    assert!(retry.prompt.contains("arenas/0001/agent_c-verdict.json"));
    assert!(retry.prompt.contains("[arena] round 00 evaluate agent_c"));
    assert_eq!(h.load().consensus_reached, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_verdict_never_committed_counts_as_no_score() {
    let responder = withhold_verdict(unanimous_for_b(), "agent_c", |_| {
        Some(FakeReaction::reply("I could not commit it"))
    });
    let h = Harness::new(config(2), responder);
    h.engine.step().await.unwrap();
    let outcome = h.engine.step().await.unwrap();

    assert_eq!(h.commit_retries(), 3);
    assert!(!outcome.completed);
    assert_eq!(outcome.round, 1);

    let state = h.load();
    let summary = RoundSummary::parse(&state.verdict_history[0]);
    assert!(!summary.scores.contains_key("agent_c"));
    assert!(summary.votes["agent_c"].is_empty());
}

// ── Verification ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_gating_verification_failure_revokes_consensus() {
    let mut config = config(2);
    config.verify_commands = vec!["cargo test".into()];
    config.verify_mode = VerifyMode::Gating;
    let h = Harness::new(config, with_verify_reply(unanimous_for_b(), "2 tests FAILED"));

    h.engine.step().await.unwrap();
    let outcome = h.engine.step().await.unwrap();

    let verifies: Vec<FakeCall> = h.fake.follow_ups().into_iter().filter(|c| c.is_verify()).collect();
    assert_eq!(verifies.len(), 1);
    assert_eq!(verifies[0].alias.as_deref(), Some("agent_b"));
    assert_eq!(verifies[0].prompt, "Run this command and report the result: cargo test");
    assert!(!outcome.completed);
    assert_eq!(outcome.round, 1);
    assert_eq!(outcome.phase, Phase::Generate);
}

#[tokio::test(start_paused = true)]
async fn test_gating_verification_pass_completes() {
    let mut config = config(2);
    config.verify_commands = vec!["cargo test".into(), "cargo clippy".into()];
    config.verify_mode = VerifyMode::Gating;
    let h = Harness::new(config, unanimous_for_b());

    let outcome = h.engine.run().await.unwrap();
    assert_eq!(outcome.consensus_reached, Some(true));
    let state = h.load();
    assert_eq!(state.verify_results.len(), 2);
    assert!(state.verify_results[0].contains("all checks passed"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_verification_rerun_records_round_once() {
    let mut config = config(2);
    config.verify_commands = vec!["c1".into(), "c2".into()];
    config.verify_mode = VerifyMode::Gating;
    let base = unanimous_for_b();
    let second_command_calls = AtomicUsize::new(0);
    let responder: Responder = Arc::new(move |call: &FakeCall| {
        if call.is_verify()
            && call.prompt.ends_with("c2")
            && second_command_calls.fetch_add(1, Ordering::SeqCst) == 0
        {
            return FakeReaction::default();
        }
        base(call)
    });
    let h = Harness::new(config, responder);

    h.engine.step().await.unwrap();
    let err = h.engine.step().await.unwrap_err();
    assert!(matches!(err, ArenaError::GraceExpired { .. }), "{err:?}");
    let state = h.load();
    assert_eq!(state.verify_results.len(), 1);
    assert!(state.verdict_history.is_empty());

    let outcome = h.engine.step().await.unwrap();
    assert!(outcome.completed);
    assert_eq!(outcome.winner.as_deref(), Some("agent_b"));
    let state = h.load();
    assert_eq!(state.verdict_history.len(), 1);
    assert_eq!(state.verify_results.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_advisory_verification_failure_is_recorded_only() {
    let mut config = config(2);
    config.verify_commands = vec!["cargo test".into()];
    config.verify_mode = VerifyMode::Advisory;
    let h = Harness::new(config, with_verify_reply(unanimous_for_b(), "2 tests FAILED"));

    let outcome = h.engine.run().await.unwrap();
    assert_eq!(outcome.consensus_reached, Some(true));
    assert_eq!(outcome.winner.as_deref(), Some("agent_b"));
    assert_eq!(h.load().verify_results, vec!["2 tests FAILED".to_string()]);
}

// ── Operator comments and reopen ───────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_pending_comments_delivered_before_phase() {
    let h = Harness::new(config(2), unanimous_for_b());
    h.engine.step().await.unwrap();

    append_comment(&h.run_dir, PendingComment::new("Prefer tokio::time over std::thread::sleep"))
        .unwrap();
    let mut raw = PendingComment::new("ping agent_c");
    raw.wrapped = false;
    raw.targets = Some(vec!["agent_c".into()]);
    assert_eq!(append_comment(&h.run_dir, raw).unwrap(), 2);

    let outcome = h.engine.step().await.unwrap();
    assert!(outcome.completed);

    let follow_ups = h.fake.follow_ups();
    let wrapped: Vec<&FakeCall> = follow_ups.iter().filter(|c| c.is_operator_comment()).collect();
    assert_eq!(wrapped.len(), 3);
    assert!(wrapped[0].prompt.ends_with("Prefer tokio::time over std::thread::sleep"));
    let raw_calls: Vec<&FakeCall> = follow_ups.iter().filter(|c| c.prompt == "ping agent_c").collect();
    assert_eq!(raw_calls.len(), 1);
    assert_eq!(raw_calls[0].alias.as_deref(), Some("agent_c"));

    // Comments go out before the evaluate prompts.
    let first_evaluate = follow_ups.iter().position(|c| c.is_evaluate()).unwrap();
    let last_comment = follow_ups
        .iter()
        .rposition(|c| c.is_operator_comment() || c.prompt == "ping agent_c")
        .unwrap();
    assert!(last_comment < first_evaluate);
    assert!(!pending_comments_path(&h.run_dir).exists());
}

#[tokio::test(start_paused = true)]
async fn test_reopen_runs_another_round() {
    let h = Harness::new(config(2), unanimous_for_b());
    h.engine.run().await.unwrap();

    let state = reopen_run(&h.store()).unwrap();
    assert!(!state.completed);
    assert_eq!(state.round, 1);
    assert_eq!(state.phase, Phase::Generate);
    assert_eq!(state.consensus_reached, None);
    assert_eq!(state.solutions.len(), 3);

    let outcome = h.engine.step().await.unwrap();
    assert_eq!(outcome.phase, Phase::Evaluate);
    let revisions = h
        .fake
        .follow_ups()
        .iter()
        .filter(|c| c.prompt.starts_with("You are") && !c.is_evaluate())
        .count();
    assert_eq!(revisions, 3);
    assert_eq!(h.fake.launch_count(), 3);
}

// ── Preconditions ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_preconditions() {
    let dir = tempfile::tempdir().unwrap();
    let fake = Arc::new(FakeTransport::new(MemoryArtifacts::new(), unanimous_for_b()));
    let engine = PhaseEngine::new(
        StateStore::new(dir.path().join("0009")),
        AgentCoordinator::new(fake.clone(), WaitSettings::default()),
        MemoryArtifacts::new(),
        EngineSettings::default(),
    );
    let err = engine.step().await.unwrap_err();
    assert!(matches!(err, ArenaError::StateNotFound { .. }));
    assert!(err.is_precondition());

    let placeholder = Harness::new(
        RunConfig::new(TASK_PLACEHOLDER, "octo/widgets"),
        unanimous_for_b(),
    );
    let err = placeholder.engine.step().await.unwrap_err();
    assert!(matches!(err, ArenaError::Config(_)));
    assert_eq!(placeholder.fake.launch_count(), 0);

    let h = Harness::new(config(2), unanimous_for_b());
    let err = reopen_run(&h.store()).unwrap_err();
    assert!(err.is_precondition());
    assert!(fake.calls().is_empty());
}
