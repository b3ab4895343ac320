use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::policy::ToolPolicy;
use crate::model::{Disposition, LedgerEntry, ToolEvent};

/// Argument keys that name a filesystem location.
const PATH_ARGUMENT_KEYS: [&str; 3] = ["file_path", "notebook_path", "path"];

/// Decide a tool call against a policy.
///
/// Deny entries win over allow entries. A non-empty allow-set rejects any tool
/// it does not name.
pub fn evaluate(event: &ToolEvent, policy: &ToolPolicy) -> Disposition {
    match check(event, policy, None) {
        Ok(()) => Disposition::Approved,
        Err(_) => Disposition::Rejected,
    }
}

/// What the run should do after a tool call was inspected.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorAction {
    /// Approved; let the backend proceed.
    Continue,
    /// Rejected; tell the backend and keep running.
    Deny { call_id: String, tool_name: String, message: String },
    /// Rejected on a fatal-on-reject tool; end the run.
    Abort { tool_name: String },
}

/// Inspects the tool calls of one run.
#[derive(Debug, Clone)]
pub struct ToolMonitor {
    policy: ToolPolicy,
    working_directory: PathBuf,
}

impl ToolMonitor {
    pub fn new(policy: ToolPolicy, working_directory: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            working_directory: working_directory.into(),
        }
    }

    /// Settles `event` and returns its ledger entry with the action to take.
    pub fn inspect(&self, event: ToolEvent) -> (LedgerEntry, MonitorAction) {
        let confine = self
            .policy
            .confine_to_working_directory
            .then_some(self.working_directory.as_path());

        match check(&event, &self.policy, confine) {
            Ok(()) => {
                debug!(tool = event.name(), sequence = event.sequence(), "tool call approved");
                let entry = LedgerEntry {
                    event: event.settle(Disposition::Approved),
                    reason: None,
                    fatal: false,
                };
                (entry, MonitorAction::Continue)
            }
            Err(reason) => {
                let fatal = self.policy.is_fatal(event.name());
                warn!(
                    tool = event.name(),
                    sequence = event.sequence(),
                    fatal,
                    %reason,
                    "tool call rejected"
                );
                let action = if fatal {
                    MonitorAction::Abort {
                        tool_name: event.name().to_string(),
                    }
                } else {
                    MonitorAction::Deny {
                        call_id: event.call_id().to_string(),
                        tool_name: event.name().to_string(),
                        message: reason.clone(),
                    }
                };
                let entry = LedgerEntry {
                    event: event.settle(Disposition::Rejected),
                    reason: Some(reason),
                    fatal,
                };
                (entry, action)
            }
        }
    }
}

fn check(event: &ToolEvent, policy: &ToolPolicy, confine: Option<&Path>) -> Result<(), String> {
    let name = event.name();
    if name.trim().is_empty() {
        return Err("tool call has no name".to_string());
    }

    let command = event.command_string();
    if let Some(entry) = policy.denied_by(name, &command) {
        return Err(format!("{} is denied by policy entry '{}'", command, entry));
    }
    if !policy.admits(name, &command) {
        return Err(format!("{} is not in the allowed tool set", name));
    }

    if let Some(root) = confine {
        for key in PATH_ARGUMENT_KEYS {
            if let Some(raw) = event.arguments().get(key).and_then(Value::as_str) {
                if !is_within(root, raw) {
                    return Err(format!(
                        "{} targets {} outside the working directory {}",
                        name,
                        raw,
                        root.display()
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Lexical containment check; symlinks are not resolved.
fn is_within(root: &Path, raw: &str) -> bool {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    normalize(&joined).starts_with(normalize(root))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
