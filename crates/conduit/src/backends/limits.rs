use crate::model::{ResourceLimits, RunEvent, TerminationReason};

/// Counts agent turns from the event stream.
///
/// The first content event opens turn one. After a tool call, the next text
/// opens a new turn: the agent is replying to the tool result. Consecutive
/// tool calls belong to the same turn.
#[derive(Debug, Default, Clone)]
pub struct TurnCounter {
    turns: u32,
    after_tool_call: bool,
}

impl TurnCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one event and returns the turn count so far.
    pub fn observe(&mut self, event: &RunEvent) -> u32 {
        match event {
            RunEvent::PartialText { .. } => {
                if self.turns == 0 || self.after_tool_call {
                    self.turns += 1;
                }
                self.after_tool_call = false;
            }
            RunEvent::ToolCall(_) => {
                if self.turns == 0 {
                    self.turns = 1;
                }
                self.after_tool_call = true;
            }
            _ => {}
        }
        self.turns
    }

    pub fn turns(&self) -> u32 {
        self.turns
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Verdict {
    Forward,
    /// Deliver the event, then end the run.
    ForwardThenStop(TerminationReason),
    /// End the run without delivering the event.
    Stop(TerminationReason),
}

/// Applies the turn and cost ceilings to each non-terminal event.
/// Wall-clock time is enforced by the pump's deadline.
#[derive(Debug)]
pub(crate) struct LimitGuard {
    limits: ResourceLimits,
    turns: TurnCounter,
}

impl LimitGuard {
    pub(crate) fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            turns: TurnCounter::new(),
        }
    }

    pub(crate) fn check(&mut self, event: &RunEvent) -> Verdict {
        match event {
            RunEvent::PartialText { .. } | RunEvent::ToolCall(_) => {
                if self.turns.observe(event) > self.limits.max_turns {
                    Verdict::Stop(TerminationReason::MaxTurns)
                } else {
                    Verdict::Forward
                }
            }
            RunEvent::UsageUpdate(usage) if usage.cost() >= self.limits.max_cost_usd => {
                Verdict::ForwardThenStop(TerminationReason::CostLimit)
            }
            _ => Verdict::Forward,
        }
    }
}
