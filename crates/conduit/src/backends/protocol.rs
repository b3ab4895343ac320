//! The JSON message vocabulary both backends speak, and its translation into
//! [`RunEvent`]s.

use std::pin::Pin;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::model::{
    BackendKind, BackendSessionId, RunEvent, TerminationReason, ToolEvent, Usage,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Malformed {kind} message: {detail}")]
    Malformed { kind: String, detail: String },

    #[error("Transport interrupted: {0}")]
    Transport(String),

    #[error("Stream is not valid UTF-8")]
    InvalidUtf8,
}

/// An event decoded from a backend, tagged with whether it came from the
/// agent's closing `result` message.
///
/// Closing events report on a run that has already ended, so resource limits
/// are not applied to them.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SourceEvent {
    pub event: RunEvent,
    pub closing: bool,
}

impl From<RunEvent> for SourceEvent {
    fn from(event: RunEvent) -> Self {
        Self {
            event,
            closing: false,
        }
    }
}

/// Ordered, fallible events decoded from a backend's output.
pub(crate) type EventSource = Pin<Box<dyn Stream<Item = Result<SourceEvent, ProtocolError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultMessage {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl ResultMessage {
    fn usage(&self) -> Usage {
        let tokens = self.usage.clone().unwrap_or_default();
        Usage {
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            total_cost_usd: self.total_cost_usd,
            num_turns: self.num_turns,
            duration_ms: self.duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    System {
        subtype: String,
        session_id: Option<String>,
    },
    Assistant {
        content: Vec<ContentBlock>,
    },
    User,
    StreamEvent,
    Result(ResultMessage),
}

#[derive(Deserialize)]
struct SystemPayload {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct AssistantPayload {
    message: AssistantBody,
}

#[derive(Deserialize)]
struct AssistantBody {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

/// Parses one payload (an SSE `data:` value or one stdout line).
pub fn parse_message(payload: &str) -> Result<AgentMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
        return Err(ProtocolError::InvalidJson(
            "payload is not an object with a string `type`".to_string(),
        ));
    };
    let kind = kind.as_str();

    fn typed<T: for<'de> Deserialize<'de>>(kind: &str, value: Value) -> Result<T, ProtocolError> {
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
            kind: kind.to_string(),
            detail: e.to_string(),
        })
    }

    match kind {
        "system" => {
            let payload: SystemPayload = typed(kind, value)?;
            Ok(AgentMessage::System {
                subtype: payload.subtype,
                session_id: payload.session_id,
            })
        }
        "assistant" => {
            let payload: AssistantPayload = typed(kind, value)?;
            Ok(AgentMessage::Assistant {
                content: payload.message.content,
            })
        }
        "user" => Ok(AgentMessage::User),
        "stream_event" => Ok(AgentMessage::StreamEvent),
        "result" => Ok(AgentMessage::Result(typed(kind, value)?)),
        other => Err(ProtocolError::UnknownMessageType(other.to_string())),
    }
}

/// Stateful message → event translation for one run.
#[derive(Debug)]
pub struct Translator {
    kind: BackendKind,
    sequence: u64,
    session_assigned: bool,
    text_blocks: usize,
}

impl Translator {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            sequence: 0,
            session_assigned: false,
            text_blocks: 0,
        }
    }

    pub fn translate(&mut self, message: AgentMessage) -> Vec<RunEvent> {
        let mut events = Vec::new();
        match message {
            AgentMessage::System {
                subtype,
                session_id,
            } => {
                if subtype == "init" {
                    self.assign_session(session_id, &mut events);
                }
            }
            AgentMessage::Assistant { content } => {
                for block in content {
                    match block {
                        ContentBlock::Text { text } => self.push_text(text, &mut events),
                        ContentBlock::ToolUse { id, name, input } => {
                            self.sequence += 1;
                            events.push(RunEvent::ToolCall(ToolEvent::pending(
                                self.sequence,
                                id,
                                name,
                                input,
                            )));
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            AgentMessage::User | AgentMessage::StreamEvent => {}
            AgentMessage::Result(result) => {
                self.assign_session(result.session_id.clone(), &mut events);
                events.push(RunEvent::UsageUpdate(result.usage()));

                if result.subtype == "error_max_turns" {
                    events.push(RunEvent::completed(TerminationReason::MaxTurns));
                } else if result.is_error || result.subtype.starts_with("error") {
                    // The agent declined or failed the task itself: a normal end
                    // whose explanation is part of the answer.
                    let explanation = result
                        .result
                        .filter(|text| !text.trim().is_empty())
                        .unwrap_or_else(|| format!("The agent stopped: {}", result.subtype));
                    self.push_text(explanation, &mut events);
                    events.push(RunEvent::completed(TerminationReason::Completed));
                } else {
                    events.push(RunEvent::Completed {
                        reason: TerminationReason::Completed,
                        result_text: result.result,
                    });
                }
            }
        }
        events
    }

    fn assign_session(&mut self, session_id: Option<String>, events: &mut Vec<RunEvent>) {
        if self.session_assigned {
            return;
        }
        if let Some(id) = session_id.filter(|id| !id.is_empty()) {
            self.session_assigned = true;
            events.push(RunEvent::SessionAssigned(BackendSessionId::new(self.kind, id)));
        }
    }

    fn push_text(&mut self, text: String, events: &mut Vec<RunEvent>) {
        if text.is_empty() {
            return;
        }
        let text = if self.text_blocks > 0 {
            format!("\n\n{}", text)
        } else {
            text
        };
        self.text_blocks += 1;
        events.push(RunEvent::PartialText { text });
    }
}

/// Decodes a stream of payloads into run events for a backend of `kind`.
/// Blank payloads are skipped; the first protocol fault ends the stream.
pub(crate) fn translate_payloads<S>(mut payloads: S, kind: BackendKind) -> EventSource
where
    S: Stream<Item = Result<String, ProtocolError>> + Send + Unpin + 'static,
{
    Box::pin(try_stream! {
        let mut translator = Translator::new(kind);
        while let Some(payload) = payloads.next().await {
            let payload = payload?;
            if payload.trim().is_empty() {
                continue;
            }
            let message = parse_message(&payload)?;
            let closing = matches!(message, AgentMessage::Result(_));
            for event in translator.translate(message) {
                yield SourceEvent { event, closing };
            }
        }
    })
}
