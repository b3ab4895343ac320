use uuid::Uuid;

use crate::backends::TurnCounter;
use crate::model::{
    BackendKind, BackendSessionId, LedgerEntry, RunEvent, RunResult, TerminationReason, Usage,
};

/// Folds the events of one run into a [`RunResult`].
///
/// Text keeps arrival order. The ledger is ordered by tool sequence number,
/// whatever order the entries were recorded in. Usage is the last update seen,
/// since backends report cumulative figures.
#[derive(Debug)]
pub struct ResponseAssembler {
    run_id: Uuid,
    backend: BackendKind,
    text: String,
    result_text: Option<String>,
    ledger: Vec<LedgerEntry>,
    usage: Option<Usage>,
    session_id: Option<BackendSessionId>,
    turns: TurnCounter,
    notes: Vec<String>,
}

impl ResponseAssembler {
    pub fn new(run_id: Uuid, backend: BackendKind) -> Self {
        Self {
            run_id,
            backend,
            text: String::new(),
            result_text: None,
            ledger: Vec::new(),
            usage: None,
            session_id: None,
            turns: TurnCounter::new(),
            notes: Vec::new(),
        }
    }

    /// Folds one event. Tool calls only count towards turns here; their settled
    /// form arrives through [`record`](Self::record).
    pub fn push(&mut self, event: &RunEvent) {
        self.turns.observe(event);
        match event {
            RunEvent::PartialText { text } => self.text.push_str(text),
            RunEvent::UsageUpdate(usage) => self.usage = Some(usage.clone()),
            RunEvent::SessionAssigned(id) => {
                if self.session_id.is_none() {
                    self.session_id = Some(id.clone());
                }
            }
            RunEvent::Completed { result_text, .. } => {
                if result_text.is_some() {
                    self.result_text = result_text.clone();
                }
            }
            RunEvent::ToolCall(_) | RunEvent::StructuralError { .. } => {}
        }
    }

    pub fn record(&mut self, entry: LedgerEntry) {
        self.ledger.push(entry);
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn finish(mut self, termination: TerminationReason) -> RunResult {
        self.ledger.sort_by_key(LedgerEntry::sequence);
        let text = if self.text.is_empty() {
            self.result_text.unwrap_or_default()
        } else {
            self.text
        };
        let usage = self.usage.unwrap_or_default();
        let turns = usage.num_turns.unwrap_or_else(|| self.turns.turns());

        RunResult {
            run_id: self.run_id,
            backend: self.backend,
            text,
            ledger: self.ledger,
            usage,
            termination,
            session_id: self.session_id,
            turns,
            notes: self.notes,
        }
    }
}

/// Pure fold of a finished event sequence and its ledger.
///
/// The termination reason comes from the last `Completed` event; a sequence
/// without one is reported as a backend error.
pub fn assemble<'a>(
    run_id: Uuid,
    backend: BackendKind,
    events: impl IntoIterator<Item = &'a RunEvent>,
    ledger: impl IntoIterator<Item = LedgerEntry>,
) -> RunResult {
    let mut assembler = ResponseAssembler::new(run_id, backend);
    let mut termination = None;
    for event in events {
        assembler.push(event);
        if let RunEvent::Completed { reason, .. } = event {
            termination = Some(reason.clone());
        }
    }
    for entry in ledger {
        assembler.record(entry);
    }
    assembler.finish(termination.unwrap_or_else(|| TerminationReason::BackendError {
        message: "run ended without a completion event".to_string(),
    }))
}
