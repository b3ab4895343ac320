//! Drives one backend attempt: tool monitoring, cancellation and result
//! assembly on top of the backend's event channel.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::assembler::ResponseAssembler;
use crate::backends::{Backend, BackendRun, RunOutcome, ToolDecision};
use crate::model::{BackendKind, RunEvent, RunRequest, RunResult, TerminationReason};
use crate::permission::{MonitorAction, ToolMonitor};

/// Starts `backend` and drives the run to its end.
///
/// Start failures are folded: structural ones become [`RunOutcome::Structural`],
/// everything else a `backend_error` result.
#[instrument(skip_all, fields(run_id = %request.run_id, backend = %backend.kind()))]
pub async fn run_backend<B: Backend + ?Sized>(
    backend: &B,
    request: Arc<RunRequest>,
    cancel: CancellationToken,
) -> RunOutcome {
    let kind = backend.kind();
    match backend.start(Arc::clone(&request), cancel.child_token()).await {
        Ok(run) => drive(run, &request, kind, &cancel).await,
        Err(e) if e.is_structural() => {
            warn!(error = %e, "backend failed to start");
            let message = e.to_string();
            RunOutcome::Structural {
                discarded: RunResult::empty(
                    request.run_id,
                    kind,
                    TerminationReason::BackendError {
                        message: message.clone(),
                    },
                ),
                message,
            }
        }
        Err(e) => {
            warn!(error = %e, "backend failed to start");
            RunOutcome::Finished(RunResult::empty(
                request.run_id,
                kind,
                TerminationReason::BackendError {
                    message: e.to_string(),
                },
            ))
        }
    }
}

/// Consumes a started run until it completes, faults, is cancelled or hits a
/// fatal tool rejection. The producer is always shut down before returning.
pub async fn drive(
    mut run: BackendRun,
    request: &RunRequest,
    kind: BackendKind,
    cancel: &CancellationToken,
) -> RunOutcome {
    let monitor = ToolMonitor::new(request.policy.clone(), &request.working_directory);
    let mut assembler = ResponseAssembler::new(request.run_id, kind);
    for note in run.take_notes() {
        assembler.note(note);
    }

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                run.shutdown().await;
                info!("run cancelled");
                return RunOutcome::Finished(assembler.finish(TerminationReason::Cancelled));
            }
            event = run.next_event() => event,
        };

        let Some(event) = event else {
            run.shutdown().await;
            return structural(
                assembler,
                "backend closed the event stream without a terminal event".to_string(),
            );
        };

        assembler.push(&event);
        match event {
            RunEvent::ToolCall(tool) => {
                let (entry, action) = monitor.inspect(tool);
                assembler.record(entry);
                match action {
                    MonitorAction::Continue => {}
                    MonitorAction::Deny {
                        call_id,
                        tool_name,
                        message,
                    } => {
                        let delivered = run.deny(ToolDecision {
                            call_id,
                            tool_name,
                            message,
                        });
                        if !delivered {
                            debug!("denial recorded; backend takes no mid-stream decisions");
                        }
                    }
                    MonitorAction::Abort { tool_name } => {
                        run.shutdown().await;
                        return RunOutcome::Finished(
                            assembler.finish(TerminationReason::ToolRejectedFatal { tool_name }),
                        );
                    }
                }
            }
            RunEvent::Completed { reason, .. } => {
                run.shutdown().await;
                debug!(termination = %reason, "run completed");
                return RunOutcome::Finished(assembler.finish(reason));
            }
            RunEvent::StructuralError { message } => {
                run.shutdown().await;
                return structural(assembler, message);
            }
            RunEvent::PartialText { .. }
            | RunEvent::UsageUpdate(_)
            | RunEvent::SessionAssigned(_) => {}
        }
    }
}

fn structural(assembler: ResponseAssembler, message: String) -> RunOutcome {
    warn!(%message, "structural backend failure");
    let discarded = assembler.finish(TerminationReason::BackendError {
        message: message.clone(),
    });
    RunOutcome::Structural { message, discarded }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::{MockBackend, Script};
    use crate::model::{Disposition, ResourceLimits};
    use crate::permission::ToolPolicy;
    use serde_json::json;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn request(policy: ToolPolicy) -> Arc<RunRequest> {
        Arc::new(RunRequest {
            run_id: Uuid::new_v4(),
            prompt: "list files".into(),
            working_directory: PathBuf::from("/work"),
            resume: None,
            limits: ResourceLimits::default(),
            policy,
        })
    }

    #[tokio::test]
    async fn test_denials_reach_the_backend() {
        let backend = MockBackend::new(BackendKind::Streaming).with_script(
            Script::new()
                .tool("LS", json!({"path": "."}))
                .tool("Bash", json!({"command": "ls"}))
                .text("a.rs b.rs")
                .completed(),
        );
        let policy = ToolPolicy::new().allow("Glob").allow("LS");

        let outcome = backend.run(request(policy), CancellationToken::new()).await;
        let RunOutcome::Finished(result) = outcome else {
            panic!("expected a finished run");
        };
        assert_eq!(result.termination, TerminationReason::Completed);
        let dispositions: Vec<_> = result.ledger.iter().map(|e| e.disposition()).collect();
        assert_eq!(dispositions, vec![Disposition::Approved, Disposition::Rejected]);
        assert_eq!(backend.denials().len(), 1);
        assert_eq!(backend.denials()[0].tool_name, "Bash");
    }

    #[tokio::test]
    async fn test_fatal_rejection_stops_the_run() {
        let backend = MockBackend::new(BackendKind::Streaming).with_script(
            Script::new()
                .text("Cleaning up")
                .tool("Bash", json!({"command": "rm -rf /"}))
                .text("never seen")
                .completed(),
        );
        let policy = ToolPolicy::new().deny("Bash(rm:*)").fatal_on_reject("Bash");

        let RunOutcome::Finished(result) = backend.run(request(policy), CancellationToken::new()).await
        else {
            panic!("expected a finished run");
        };
        assert_eq!(
            result.termination,
            TerminationReason::ToolRejectedFatal {
                tool_name: "Bash".into()
            }
        );
        assert_eq!(result.text, "Cleaning up");
        assert!(result.ledger[0].fatal);
    }

    #[tokio::test]
    async fn test_structural_error_keeps_discarded_output() {
        let backend = MockBackend::new(BackendKind::Streaming)
            .with_script(Script::new().text("partial").structural("Unknown message type: x"));

        match backend.run(request(ToolPolicy::new()), CancellationToken::new()).await {
            RunOutcome::Structural { message, discarded } => {
                assert_eq!(message, "Unknown message type: x");
                assert_eq!(discarded.text, "partial");
            }
            other => panic!("expected structural outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_ends_the_run() {
        let backend = MockBackend::new(BackendKind::Subprocess)
            .with_script(Script::new().text("thinking").hold_forever());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let RunOutcome::Finished(result) = backend.run(request(ToolPolicy::new()), cancel).await else {
            panic!("expected a finished run");
        };
        assert_eq!(result.termination, TerminationReason::Cancelled);
        assert_eq!(result.text, "thinking");
    }

    #[tokio::test]
    async fn test_start_errors_are_classified() {
        let unavailable = MockBackend::new(BackendKind::Streaming)
            .failing_with(crate::errors::BackendError::Unavailable("503".into()));
        match unavailable.run(request(ToolPolicy::new()), CancellationToken::new()).await {
            RunOutcome::Finished(result) => {
                assert!(matches!(result.termination, TerminationReason::BackendError { .. }))
            }
            other => panic!("expected finished, got {:?}", other),
        }

        let broken = MockBackend::new(BackendKind::Streaming)
            .failing_with(crate::errors::BackendError::Protocol("bad framing".into()));
        assert!(matches!(
            broken.run(request(ToolPolicy::new()), CancellationToken::new()).await,
            RunOutcome::Structural { .. }
        ));
    }
}
