//! The integration facade: one `execute` call per prompt, with session
//! resolution, per-session exclusivity and the single fallback attempt.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backends::{Backend, RunOutcome, StreamingBackend, SubprocessBackend};
use crate::config::Settings;
use crate::errors::ConduitError;
use crate::model::{BackendKind, ResourceLimits, RunRequest, RunResult, TerminationReason};
use crate::permission::PolicySource;
use crate::session::{
    ActiveRuns, CommitUpdate, FileSessionStore, Session, SessionKey, SessionManager,
};

/// Where a run is in its lifecycle. Only used for logging transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Resolving,
    RunningPrimary,
    FallingBack,
    RunningFallback,
    Completed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Resolving => "resolving",
            RunState::RunningPrimary => "running_primary",
            RunState::FallingBack => "falling_back",
            RunState::RunningFallback => "running_fallback",
            RunState::Completed => "completed",
        };
        f.write_str(name)
    }
}

struct StateLog {
    run_id: Uuid,
    state: RunState,
}

impl StateLog {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: RunState::Idle,
        }
    }

    fn enter(&mut self, next: RunState) {
        debug!(run_id = %self.run_id, from = %self.state, to = %next, "run state");
        self.state = next;
    }
}

/// Counters for how runs ended, shared across clones of the runtime.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    runs: AtomicU64,
    primary_structural_failures: AtomicU64,
    fallbacks: AtomicU64,
    fallback_failures: AtomicU64,
    session_conflicts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub runs: u64,
    pub primary_structural_failures: u64,
    pub fallbacks: u64,
    pub fallback_failures: u64,
    pub session_conflicts: u64,
}

impl RuntimeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            primary_structural_failures: self.primary_structural_failures.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            fallback_failures: self.fallback_failures.load(Ordering::Relaxed),
            session_conflicts: self.session_conflicts.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Executes prompts against the configured backends.
#[derive(Clone)]
pub struct AgentRuntime {
    sessions: SessionManager,
    policy: Arc<dyn PolicySource>,
    primary: Arc<dyn Backend>,
    fallback: Option<Arc<dyn Backend>>,
    active: ActiveRuns,
    stats: Arc<RuntimeStats>,
}

impl AgentRuntime {
    pub fn new(
        sessions: SessionManager,
        policy: Arc<dyn PolicySource>,
        primary: Arc<dyn Backend>,
    ) -> Self {
        Self {
            sessions,
            policy,
            primary,
            fallback: None,
            active: ActiveRuns::new(),
            stats: Arc::new(RuntimeStats::default()),
        }
    }

    /// Sets the backend tried once when the primary faults structurally.
    pub fn with_fallback(mut self, fallback: Arc<dyn Backend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Builds the runtime described by `settings`: file-backed sessions and
    /// the configured primary and fallback backends.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConduitError> {
        settings.validate()?;
        let store = Arc::new(FileSessionStore::new(settings.sessions_dir()?));
        let sessions = SessionManager::new(store, settings.idle_timeout());
        let primary = backend_for(settings, settings.primary_backend)?;

        let runtime = Self::new(sessions, Arc::new(settings.clone()), primary);
        match settings.fallback_backend() {
            Some(kind) => Ok(runtime.with_fallback(backend_for(settings, kind)?)),
            None => Ok(runtime),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a run is currently in flight for this user and directory.
    pub fn is_active(&self, user_id: &str, directory: &Path) -> bool {
        self.active.is_active(&SessionKey::new(user_id, directory))
    }

    /// Runs `prompt` for the session of (`user_id`, `directory`).
    ///
    /// Every backend outcome, failures included, comes back as a
    /// [`RunResult`]. Errors are reserved for invalid configuration, storage
    /// failures, an empty prompt and a run already in flight for the session.
    #[instrument(skip_all, fields(user_id = %user_id, directory = %directory.display()))]
    pub async fn execute(
        &self,
        user_id: &str,
        directory: &Path,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<RunResult, ConduitError> {
        if prompt.trim().is_empty() {
            return Err(ConduitError::EmptyPrompt);
        }
        let policy = self.policy.snapshot()?;

        let key = SessionKey::new(user_id, directory);
        let run_id = Uuid::new_v4();
        let Some(_guard) = self.active.try_acquire(&key, run_id) else {
            RuntimeStats::bump(&self.stats.session_conflicts);
            warn!("rejected run: session busy");
            return Err(ConduitError::SessionConflict {
                user_id: user_id.to_string(),
                directory: directory.to_path_buf(),
            });
        };
        RuntimeStats::bump(&self.stats.runs);

        let mut state = StateLog::new(run_id);
        state.enter(RunState::Resolving);
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("run cancelled while resolving its session");
                return Ok(RunResult::empty(run_id, self.primary.kind(), TerminationReason::Cancelled));
            }
            session = self.sessions.resolve(&key) => session?,
        };

        let started = Instant::now();
        let request = Arc::new(RunRequest {
            run_id,
            prompt: prompt.to_string(),
            working_directory: directory.to_path_buf(),
            resume: session.resume_token().cloned(),
            limits: policy.limits,
            policy: policy.tools,
        });

        state.enter(RunState::RunningPrimary);
        let (result, spent_before) = match self.primary.run(Arc::clone(&request), cancel.clone()).await {
            RunOutcome::Finished(result) => (result, 0.0),
            RunOutcome::Structural { message, discarded } => {
                RuntimeStats::bump(&self.stats.primary_structural_failures);
                state.enter(RunState::FallingBack);
                self.fall_back(&mut state, &request, started, &cancel, message, discarded)
                    .await
            }
        };
        state.enter(RunState::Completed);

        info!(
            run_id = %result.run_id,
            backend = %result.backend,
            termination = %result.termination,
            turns = result.turns,
            cost_usd = result.usage.cost(),
            "run finished"
        );
        self.commit(&session, &result, spent_before, &cancel).await?;
        Ok(result)
    }

    /// Restarts the run once on the fallback backend. The primary attempt's
    /// output is dropped; its time and cost still count against the limits.
    ///
    /// Returns the result plus the cost spent by an attempt whose result was
    /// replaced, which is zero when the primary's own result is returned.
    async fn fall_back(
        &self,
        state: &mut StateLog,
        primary_request: &RunRequest,
        started: Instant,
        cancel: &CancellationToken,
        message: String,
        discarded: RunResult,
    ) -> (RunResult, f64) {
        let primary = self.primary.kind();
        let Some(fallback) = &self.fallback else {
            warn!(%message, "structural failure with no fallback configured");
            return (ended(discarded, TerminationReason::BackendError { message }), 0.0);
        };

        let limits = primary_request.limits;
        let remaining_time = limits.timeout.saturating_sub(started.elapsed());
        let remaining_cost = limits.max_cost_usd - discarded.usage.cost();
        if remaining_time.is_zero() {
            return (ended(discarded, TerminationReason::Timeout), 0.0);
        }
        if remaining_cost <= 0.0 {
            return (ended(discarded, TerminationReason::CostLimit), 0.0);
        }

        RuntimeStats::bump(&self.stats.fallbacks);
        info!(%message, from = %primary, to = %fallback.kind(), "falling back");
        state.enter(RunState::RunningFallback);

        let request = Arc::new(RunRequest {
            limits: ResourceLimits {
                timeout: remaining_time.max(Duration::from_millis(1)),
                max_cost_usd: remaining_cost,
                ..limits
            },
            ..primary_request.clone()
        });

        let mut notes = vec![format!(
            "The {} backend failed ({}); the run was restarted on the {} backend",
            primary,
            message,
            fallback.kind()
        )];
        if !discarded.text.is_empty() || !discarded.ledger.is_empty() {
            notes.push(format!(
                "Discarded {} characters of partial output and {} tool calls from the {} attempt",
                discarded.text.chars().count(),
                discarded.ledger.len(),
                primary
            ));
        }

        let mut result = match fallback.run(request, cancel.clone()).await {
            RunOutcome::Finished(result) => result,
            RunOutcome::Structural {
                message,
                discarded: second,
            } => ended(second, TerminationReason::BackendError { message }),
        };
        if result.termination.is_failure() && result.termination != TerminationReason::Cancelled {
            RuntimeStats::bump(&self.stats.fallback_failures);
        }
        notes.append(&mut result.notes);
        result.notes = notes;
        (result, discarded.usage.cost())
    }

    /// Persists the post-run session state. Cancelled runs leave the session
    /// untouched.
    async fn commit(
        &self,
        session: &Session,
        result: &RunResult,
        spent_before: f64,
        cancel: &CancellationToken,
    ) -> Result<(), ConduitError> {
        if cancel.is_cancelled() || result.termination == TerminationReason::Cancelled {
            debug!("run cancelled; session not committed");
            return Ok(());
        }
        let nothing_started = matches!(result.termination, TerminationReason::BackendError { .. })
            && result.session_id.is_none()
            && result.turns == 0;
        if nothing_started {
            debug!("backend never started a session; nothing to commit");
            return Ok(());
        }

        let update = CommitUpdate {
            backend_session_id: result.session_id.clone(),
            cost_delta: spent_before + result.usage.cost(),
            turns: result.turns,
        };
        self.sessions.commit(session, update).await?;
        Ok(())
    }
}

fn backend_for(settings: &Settings, kind: BackendKind) -> Result<Arc<dyn Backend>, ConduitError> {
    Ok(match kind {
        BackendKind::Streaming => Arc::new(StreamingBackend::new(settings.streaming.clone())?),
        BackendKind::Subprocess => Arc::new(SubprocessBackend::new(settings.subprocess.clone())?),
    })
}

fn ended(mut result: RunResult, termination: TerminationReason) -> RunResult {
    result.termination = termination;
    result
}
