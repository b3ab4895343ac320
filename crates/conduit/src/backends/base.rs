use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::limits::{LimitGuard, Verdict};
use super::protocol::{EventSource, SourceEvent};
use crate::errors::BackendError;
use crate::model::{BackendKind, ResourceLimits, RunEvent, RunRequest, RunResult, TerminationReason};
use crate::supervisor;

/// Capacity of the per-run event channel.
pub(crate) const EVENT_BUFFER: usize = 64;

/// A rejected tool call the backend should be told about.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDecision {
    pub call_id: String,
    pub tool_name: String,
    pub message: String,
}

/// A started run: the ordered event channel plus the handles needed to stop it.
///
/// The producer task sends exactly one terminal event (`Completed` or
/// `StructuralError`) unless it is aborted first. Dropping the run aborts it.
pub struct BackendRun {
    events: mpsc::Receiver<RunEvent>,
    decisions: Option<mpsc::UnboundedSender<ToolDecision>>,
    abort: CancellationToken,
    task: Option<JoinHandle<()>>,
    notes: Vec<String>,
}

impl BackendRun {
    pub fn new(
        events: mpsc::Receiver<RunEvent>,
        abort: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            decisions: None,
            abort,
            task: Some(task),
            notes: Vec::new(),
        }
    }

    /// Accept mid-stream denials on `decisions`.
    pub fn with_decisions(mut self, decisions: mpsc::UnboundedSender<ToolDecision>) -> Self {
        self.decisions = Some(decisions);
        self
    }

    pub fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }

    /// Next event in order, or `None` once the producer is gone.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Forwards a denial. Returns false when the backend cannot be told
    /// mid-stream; the rejection is still recorded by the caller.
    pub fn deny(&self, decision: ToolDecision) -> bool {
        match &self.decisions {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn take_notes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.notes)
    }

    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Aborts the producer and waits until it has released its resources.
    pub async fn shutdown(&mut self) {
        self.abort.cancel();
        self.events.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "backend task panicked");
                }
            }
        }
    }
}

impl Drop for BackendRun {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}

/// How one backend attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished(RunResult),
    /// An integration-layer fault. `discarded` holds whatever the attempt had
    /// produced before the fault.
    Structural { message: String, discarded: RunResult },
}

/// An execution engine for agent runs.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Starts a run. `cancel` stops the producer and every resource it holds.
    async fn start(
        &self,
        request: Arc<RunRequest>,
        cancel: CancellationToken,
    ) -> Result<BackendRun, BackendError>;

    /// Runs to completion under the tool monitor and folds the result.
    async fn run(&self, request: Arc<RunRequest>, cancel: CancellationToken) -> RunOutcome {
        supervisor::run_backend(self, request, cancel).await
    }
}

/// The note attached when a session id from the other backend is not resumed.
pub(crate) fn foreign_resume_note(request: &RunRequest, kind: BackendKind) -> Option<String> {
    let resume = request.resume.as_ref()?;
    (resume.kind() != kind).then(|| {
        format!(
            "Started a fresh {} session; the {} session {} cannot be resumed here",
            kind,
            resume.kind(),
            resume.as_str()
        )
    })
}

/// Why the pump stopped forwarding.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PumpExit {
    /// The source produced its terminal event, not yet forwarded.
    Finished(RunEvent),
    /// A turn, time or cost ceiling was hit.
    Limit(TerminationReason),
    Structural(String),
    /// The source ended without a terminal event.
    SourceClosed,
    Cancelled,
    ReceiverGone,
}

/// Forwards non-terminal events from `source` to `tx` under the run's limits.
/// Limits apply to mid-stream events only; events from the agent's closing
/// result pass through unchecked.
///
/// Terminal events are handed back to the backend, which decides how to end
/// the run; the pump itself never sends one.
pub(crate) async fn pump(
    mut source: EventSource,
    limits: ResourceLimits,
    deadline: Instant,
    abort: &CancellationToken,
    tx: &mpsc::Sender<RunEvent>,
) -> PumpExit {
    let mut guard = LimitGuard::new(limits);
    loop {
        let next = tokio::select! {
            biased;
            _ = abort.cancelled() => return PumpExit::Cancelled,
            _ = tokio::time::sleep_until(deadline) => {
                return PumpExit::Limit(TerminationReason::Timeout)
            }
            item = source.next() => item,
        };

        let SourceEvent { event, closing } = match next {
            None => return PumpExit::SourceClosed,
            Some(Err(e)) => return PumpExit::Structural(e.to_string()),
            Some(Ok(item)) if item.event.is_terminal() => return PumpExit::Finished(item.event),
            Some(Ok(item)) => item,
        };

        let stop = if closing {
            None
        } else {
            match guard.check(&event) {
                Verdict::Forward => None,
                Verdict::ForwardThenStop(reason) => Some(reason),
                Verdict::Stop(reason) => return PumpExit::Limit(reason),
            }
        };

        tokio::select! {
            biased;
            _ = abort.cancelled() => return PumpExit::Cancelled,
            sent = tx.send(event) => {
                if sent.is_err() {
                    return PumpExit::ReceiverGone;
                }
            }
        }

        if let Some(reason) = stop {
            return PumpExit::Limit(reason);
        }
    }
}
