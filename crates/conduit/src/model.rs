//! Value types that flow through a run: requests, streamed events, the tool
//! ledger and the final result.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::permission::ToolPolicy;

/// The two execution engines a run can be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Backend A: streaming HTTP agent client.
    Streaming,
    /// Backend B: command-line agent process.
    Subprocess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Streaming => "streaming",
            BackendKind::Subprocess => "subprocess",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session id issued by one backend.
///
/// The two backends keep disjoint id namespaces, so the issuing kind travels
/// with the id and [`BackendSessionId::for_backend`] refuses to hand an id to
/// the other backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendSessionId {
    kind: BackendKind,
    id: String,
}

impl BackendSessionId {
    pub fn new(kind: BackendKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Returns the raw id only when it was issued by `kind`.
    pub fn for_backend(&self, kind: BackendKind) -> Option<&str> {
        (self.kind == kind).then_some(self.id.as_str())
    }
}

/// Turn, wall-clock and cost ceilings for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_turns: u32,
    pub timeout: Duration,
    pub max_cost_usd: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_turns: 10,
            timeout: Duration::from_secs(300),
            max_cost_usd: 10.0,
        }
    }
}

/// Everything a backend needs to execute one prompt.
///
/// Backends receive it behind an `Arc` and never mutate it; the fallback
/// attempt gets its own request.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub run_id: Uuid,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub resume: Option<BackendSessionId>,
    pub limits: ResourceLimits,
    pub policy: ToolPolicy,
}

impl RunRequest {
    /// The resume token to pass to a backend of `kind`, if the session has one
    /// in that backend's namespace.
    pub fn resume_id(&self, kind: BackendKind) -> Option<&str> {
        self.resume.as_ref().and_then(|id| id.for_backend(kind))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Pending,
    Approved,
    Rejected,
}

/// One tool invocation requested by the agent.
///
/// Produced `Pending` by a backend; the monitor settles it exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    sequence: u64,
    call_id: String,
    name: String,
    arguments: Value,
    disposition: Disposition,
}

impl ToolEvent {
    pub fn pending(
        sequence: u64,
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self {
            sequence,
            call_id: call_id.into(),
            name: name.into(),
            arguments,
            disposition: Disposition::Pending,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &Value {
        &self.arguments
    }

    pub fn disposition(&self) -> Disposition {
        self.disposition
    }

    /// Sets the final disposition. A settled event is returned unchanged.
    pub(crate) fn settle(mut self, disposition: Disposition) -> Self {
        if self.disposition == Disposition::Pending {
            self.disposition = disposition;
        }
        self
    }

    /// The command string used for pattern matching, e.g. `Bash(ls -la)`.
    pub fn command_string(&self) -> String {
        const SUBJECT_KEYS: [&str; 5] = ["command", "file_path", "notebook_path", "path", "url"];

        let subject = SUBJECT_KEYS
            .iter()
            .find_map(|key| self.arguments.get(*key).and_then(Value::as_str));

        match subject {
            Some(subject) => format!("{}({})", self.name, subject),
            None => self.name.clone(),
        }
    }
}

/// A settled tool event as recorded in the run's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub event: ToolEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub fatal: bool,
}

impl LedgerEntry {
    pub fn sequence(&self) -> u64 {
        self.event.sequence()
    }

    pub fn disposition(&self) -> Disposition {
        self.event.disposition()
    }
}

/// Token and cost figures reported by a backend. Values are cumulative for
/// the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
    pub duration_ms: Option<u64>,
}

impl Usage {
    pub fn cost(&self) -> f64 {
        self.total_cost_usd.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TerminationReason {
    Completed,
    MaxTurns,
    Timeout,
    CostLimit,
    ToolRejectedFatal { tool_name: String },
    BackendError { message: String },
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Completed => "completed",
            TerminationReason::MaxTurns => "max_turns",
            TerminationReason::Timeout => "timeout",
            TerminationReason::CostLimit => "cost_limit",
            TerminationReason::ToolRejectedFatal { .. } => "tool_rejected_fatal",
            TerminationReason::BackendError { .. } => "backend_error",
            TerminationReason::Cancelled => "cancelled",
        }
    }

    /// Failures the caller should report as such. Limit hits are normal ends.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TerminationReason::ToolRejectedFatal { .. }
                | TerminationReason::BackendError { .. }
                | TerminationReason::Cancelled
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::ToolRejectedFatal { tool_name } => {
                write!(f, "tool_rejected_fatal ({})", tool_name)
            }
            TerminationReason::BackendError { message } => write!(f, "backend_error ({})", message),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Incremental output of a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    PartialText { text: String },
    ToolCall(ToolEvent),
    UsageUpdate(Usage),
    SessionAssigned(BackendSessionId),
    Completed {
        reason: TerminationReason,
        result_text: Option<String>,
    },
    StructuralError { message: String },
}

impl RunEvent {
    pub fn completed(reason: TerminationReason) -> Self {
        RunEvent::Completed {
            reason,
            result_text: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Completed { .. } | RunEvent::StructuralError { .. }
        )
    }
}

/// Terminal outcome of one run. Exactly one is produced per run, failures
/// included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub backend: BackendKind,
    pub text: String,
    pub ledger: Vec<LedgerEntry>,
    pub usage: Usage,
    pub termination: TerminationReason,
    pub session_id: Option<BackendSessionId>,
    pub turns: u32,
    pub notes: Vec<String>,
}

impl RunResult {
    /// A result for a run that ended before any backend output was folded.
    pub fn empty(run_id: Uuid, backend: BackendKind, termination: TerminationReason) -> Self {
        Self {
            run_id,
            backend,
            text: String::new(),
            ledger: Vec::new(),
            usage: Usage::default(),
            termination,
            session_id: None,
            turns: 0,
            notes: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        !self.termination.is_failure()
    }

    pub fn rejected_tools(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.ledger
            .iter()
            .filter(|entry| entry.disposition() == Disposition::Rejected)
    }
}
