//! A scripted backend for tests and local experiments.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::base::{foreign_resume_note, pump, Backend, BackendRun, PumpExit, ToolDecision, EVENT_BUFFER};
use super::protocol::{EventSource, ProtocolError, SourceEvent};
use crate::errors::BackendError;
use crate::model::{
    BackendKind, BackendSessionId, RunEvent, RunRequest, TerminationReason, ToolEvent, Usage,
};

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(RunEvent),
    /// Emits `SessionAssigned` with an id in the backend's namespace.
    Session(String),
    Delay(Duration),
    /// Waits until the notify is triggered.
    Hold(Arc<Notify>),
    HoldForever,
}

/// The events one run replays, in order.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<ScriptStep>,
    next_sequence: u64,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn emit(self, event: RunEvent) -> Self {
        self.step(ScriptStep::Emit(event))
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.emit(RunEvent::PartialText { text: text.into() })
    }

    /// A tool call with the next sequence number.
    pub fn tool(mut self, name: &str, arguments: Value) -> Self {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.tool_with_sequence(sequence, name, arguments)
    }

    pub fn tool_with_sequence(self, sequence: u64, name: &str, arguments: Value) -> Self {
        self.emit(RunEvent::ToolCall(ToolEvent::pending(
            sequence,
            format!("toolu_{}", sequence),
            name,
            arguments,
        )))
    }

    /// A cumulative usage report.
    pub fn usage(self, total_cost_usd: f64, num_turns: Option<u32>) -> Self {
        self.emit(RunEvent::UsageUpdate(Usage {
            total_cost_usd: Some(total_cost_usd),
            num_turns,
            ..Usage::default()
        }))
    }

    pub fn session(self, id: impl Into<String>) -> Self {
        self.step(ScriptStep::Session(id.into()))
    }

    pub fn completed(self) -> Self {
        self.emit(RunEvent::completed(TerminationReason::Completed))
    }

    pub fn completed_with(self, reason: TerminationReason) -> Self {
        self.emit(RunEvent::completed(reason))
    }

    pub fn structural(self, message: impl Into<String>) -> Self {
        self.emit(RunEvent::StructuralError {
            message: message.into(),
        })
    }

    pub fn delay(self, duration: Duration) -> Self {
        self.step(ScriptStep::Delay(duration))
    }

    pub fn hold(self, release: Arc<Notify>) -> Self {
        self.step(ScriptStep::Hold(release))
    }

    pub fn hold_forever(self) -> Self {
        self.step(ScriptStep::HoldForever)
    }
}

/// Replays scripts through the same limit pump as the real backends.
///
/// Each `start` takes the next queued script; the last one is reused once the
/// queue runs dry. Every request is recorded.
pub struct MockBackend {
    kind: BackendKind,
    scripts: Mutex<VecDeque<Script>>,
    start_error: Option<BackendError>,
    calls: AtomicUsize,
    requests: Mutex<Vec<RunRequest>>,
    decision_inboxes: Mutex<Vec<mpsc::UnboundedReceiver<ToolDecision>>>,
    denials: Mutex<Vec<ToolDecision>>,
}

impl MockBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            scripts: Mutex::new(VecDeque::new()),
            start_error: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            decision_inboxes: Mutex::new(Vec::new()),
            denials: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(self, script: Script) -> Self {
        lock(&self.scripts).push_back(script);
        self
    }

    /// Every `start` fails with `error`.
    pub fn failing_with(mut self, error: BackendError) -> Self {
        self.start_error = Some(error);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RunRequest> {
        lock(&self.requests).clone()
    }

    /// Denials received so far, across runs.
    pub fn denials(&self) -> Vec<ToolDecision> {
        let mut denials = lock(&self.denials);
        for inbox in lock(&self.decision_inboxes).iter_mut() {
            while let Ok(decision) = inbox.try_recv() {
                denials.push(decision);
            }
        }
        denials.clone()
    }

    fn next_script(&self) -> Script {
        let mut scripts = lock(&self.scripts);
        if scripts.len() > 1 {
            scripts.pop_front().unwrap_or_default()
        } else {
            scripts.front().cloned().unwrap_or_default()
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn start(
        &self,
        request: Arc<RunRequest>,
        cancel: CancellationToken,
    ) -> Result<BackendRun, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push(request.as_ref().clone());
        if let Some(error) = &self.start_error {
            return Err(error.clone());
        }

        let kind = self.kind;
        let steps = self.next_script().steps;
        let deadline = Instant::now() + request.limits.timeout;
        let limits = request.limits;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (decisions_tx, decisions_rx) = mpsc::unbounded_channel();
        lock(&self.decision_inboxes).push(decisions_rx);

        let source: EventSource = Box::pin(stream! {
            for step in steps {
                match step {
                    ScriptStep::Emit(event) => {
                        yield Ok::<_, ProtocolError>(SourceEvent::from(event));
                    }
                    ScriptStep::Session(id) => {
                        let event = RunEvent::SessionAssigned(BackendSessionId::new(kind, id));
                        yield Ok::<_, ProtocolError>(SourceEvent::from(event));
                    }
                    ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Hold(release) => release.notified().await,
                    ScriptStep::HoldForever => std::future::pending::<()>().await,
                }
            }
        });

        let abort = cancel.clone();
        let task = tokio::spawn(async move {
            let terminal = match pump(source, limits, deadline, &abort, &tx).await {
                PumpExit::Finished(event) => Some(event),
                PumpExit::Limit(reason) => Some(RunEvent::completed(reason)),
                PumpExit::Structural(message) => Some(RunEvent::StructuralError { message }),
                PumpExit::SourceClosed | PumpExit::Cancelled | PumpExit::ReceiverGone => None,
            };
            if let Some(event) = terminal {
                let _ = tx.send(event).await;
            }
        });

        let notes = foreign_resume_note(&request, kind).into_iter().collect();
        Ok(BackendRun::new(rx, cancel, task)
            .with_decisions(decisions_tx)
            .with_notes(notes))
    }
}
