//! Backend A: an agent service reached over HTTP with a server-sent-event
//! response stream.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::base::{foreign_resume_note, pump, Backend, BackendRun, PumpExit, ToolDecision, EVENT_BUFFER};
use super::protocol::{translate_payloads, ProtocolError};
use crate::config::ConfigError;
use crate::errors::BackendError;
use crate::model::{BackendKind, ResourceLimits, RunEvent, RunRequest, TerminationReason};
use crate::permission::ToolPolicy;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub connect_timeout_secs: u64,
    /// Upper bound for the interrupt and decision side calls.
    pub control_timeout_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_string(),
            api_key: None,
            model: None,
            connect_timeout_secs: 10,
            control_timeout_ms: 2_000,
        }
    }
}

impl StreamingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            ConfigError::Invalid(format!("streaming.base_url '{}': {}", self.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "streaming.base_url must be http or https, got {}",
                url.scheme()
            )));
        }
        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Splits a server-sent-event byte stream into `data:` payloads.
///
/// Bytes are buffered until a frame is complete, so multi-byte characters
/// split across chunks decode correctly. `\r` is dropped, comment and
/// non-data lines are skipped, and `[DONE]` sentinels are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the payloads of every completed frame.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ProtocolError> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let mut frame: Vec<u8> = self.buffer.drain(..end + 2).collect();
            frame.truncate(end);
            if let Some(payload) = frame_payload(frame)? {
                payloads.push(payload);
            }
        }
        Ok(payloads)
    }

    /// Flushes a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Result<Option<String>, ProtocolError> {
        let frame = std::mem::take(&mut self.buffer);
        frame_payload(frame)
    }
}

fn frame_payload(frame: Vec<u8>) -> Result<Option<String>, ProtocolError> {
    let frame = String::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if data.is_empty() {
        return Ok(None);
    }
    let payload = data.join("\n");
    if payload.trim() == "[DONE]" {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn sse_payloads<S, B, E>(bytes: S) -> impl Stream<Item = Result<String, ProtocolError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| ProtocolError::Transport(e.to_string()))?;
            for payload in decoder.push(chunk.as_ref())? {
                yield payload;
            }
        }
        if let Some(payload) = decoder.finish()? {
            yield payload;
        }
    }
}

/// The HTTP agent client.
#[derive(Debug, Clone)]
pub struct StreamingBackend {
    config: Arc<StreamingConfig>,
    client: Client,
}

impl StreamingBackend {
    pub fn new(config: StreamingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    fn request_body(&self, request: &RunRequest) -> serde_json::Value {
        json!({
            "run_id": request.run_id,
            "prompt": request.prompt,
            "cwd": request.working_directory,
            "resume": request.resume_id(BackendKind::Streaming),
            "model": self.config.model,
            "max_turns": request.limits.max_turns,
            "allowed_tools": ToolPolicy::tool_names(&request.policy.allowed),
            "disallowed_tools": ToolPolicy::tool_names(&request.policy.disallowed),
        })
    }
}

#[async_trait]
impl Backend for StreamingBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Streaming
    }

    async fn start(
        &self,
        request: Arc<RunRequest>,
        cancel: CancellationToken,
    ) -> Result<BackendRun, BackendError> {
        if request.prompt.trim().is_empty() {
            return Err(BackendError::InvalidRequest("prompt is empty".to_string()));
        }

        let deadline = Instant::now() + request.limits.timeout;
        let body = self.request_body(&request);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (decisions_tx, decisions_rx) = mpsc::unbounded_channel();

        let call = AgentCall {
            client: self.client.clone(),
            config: Arc::clone(&self.config),
            run_id: request.run_id,
        };
        tokio::spawn(call.clone().forward_decisions(decisions_rx));

        let limits = request.limits;
        let abort = cancel.clone();
        let task = tokio::spawn(async move {
            call.produce(body, limits, deadline, abort, tx).await;
        });

        let notes = foreign_resume_note(&request, BackendKind::Streaming)
            .into_iter()
            .collect();
        Ok(BackendRun::new(rx, cancel, task)
            .with_decisions(decisions_tx)
            .with_notes(notes))
    }
}

/// One run against the agent service.
#[derive(Debug, Clone)]
struct AgentCall {
    client: Client,
    config: Arc<StreamingConfig>,
    run_id: Uuid,
}

impl AgentCall {
    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.config.endpoint(path));
        match &self.config.api_key {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }

    fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.config.control_timeout_ms)
    }

    async fn produce(
        self,
        body: serde_json::Value,
        limits: ResourceLimits,
        deadline: Instant,
        abort: CancellationToken,
        tx: mpsc::Sender<RunEvent>,
    ) {
        let send = self
            .post("v1/agent/runs")
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            _ = tokio::time::sleep_until(deadline) => {
                let _ = tx.send(RunEvent::completed(TerminationReason::Timeout)).await;
                return;
            }
            response = send => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "agent service unreachable");
                let _ = tx
                    .send(backend_error(format!("agent service unreachable: {}", e)))
                    .await;
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let detail = tokio::time::timeout(self.control_timeout(), response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            warn!(run_id = %self.run_id, %status, "agent service rejected the run");
            let _ = tx
                .send(backend_error(format!(
                    "agent service returned {}: {}",
                    status,
                    truncate(&detail, 500)
                )))
                .await;
            return;
        }

        debug!(run_id = %self.run_id, "agent stream opened");
        let source = translate_payloads(
            Box::pin(sse_payloads(response.bytes_stream())),
            BackendKind::Streaming,
        );

        let terminal = match pump(source, limits, deadline, &abort, &tx).await {
            PumpExit::Finished(event) => event,
            PumpExit::Limit(reason) => {
                info!(run_id = %self.run_id, %reason, "limit reached; interrupting agent");
                self.interrupt().await;
                RunEvent::completed(reason)
            }
            PumpExit::Structural(message) => RunEvent::StructuralError { message },
            PumpExit::SourceClosed => RunEvent::StructuralError {
                message: "agent stream ended without a result message".to_string(),
            },
            PumpExit::Cancelled | PumpExit::ReceiverGone => {
                debug!(run_id = %self.run_id, "agent stream dropped");
                return;
            }
        };
        let _ = tx.send(terminal).await;
    }

    /// Asks the service to stop the run. Best effort.
    async fn interrupt(&self) {
        let path = format!("v1/agent/runs/{}/interrupt", self.run_id);
        match self.post(&path).timeout(self.control_timeout()).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(run_id = %self.run_id, status = %response.status(), "interrupt refused")
            }
            Err(e) => warn!(run_id = %self.run_id, error = %e, "interrupt failed"),
        }
    }

    /// Relays denials until the run handle is dropped.
    async fn forward_decisions(self, mut decisions: mpsc::UnboundedReceiver<ToolDecision>) {
        let path = format!("v1/agent/runs/{}/decisions", self.run_id);
        while let Some(decision) = decisions.recv().await {
            let body = json!({
                "tool_use_id": decision.call_id,
                "behavior": "deny",
                "message": decision.message,
            });
            let sent = self
                .post(&path)
                .timeout(self.control_timeout())
                .json(&body)
                .send()
                .await;
            match sent {
                Ok(response) if response.status().is_success() => {
                    debug!(run_id = %self.run_id, tool = %decision.tool_name, "denial delivered")
                }
                Ok(response) => warn!(
                    run_id = %self.run_id,
                    tool = %decision.tool_name,
                    status = %response.status(),
                    "denial refused"
                ),
                Err(e) => warn!(
                    run_id = %self.run_id,
                    tool = %decision.tool_name,
                    error = %e,
                    "denial not delivered"
                ),
            }
        }
    }
}

fn backend_error(message: String) -> RunEvent {
    RunEvent::completed(TerminationReason::BackendError { message })
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::RunOutcome;
    use crate::model::{BackendSessionId, Disposition};
    use std::path::PathBuf;
    use wiremock::matchers::{body_partial_json, method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse(messages: &[&str]) -> String {
        messages
            .iter()
            .map(|m| format!("data: {}\n\n", m))
            .collect::<String>()
            + "data: [DONE]\n\n"
    }

    fn backend(server: &MockServer) -> StreamingBackend {
        StreamingBackend::new(StreamingConfig {
            base_url: server.uri(),
            api_key: Some("sk-test".into()),
            ..StreamingConfig::default()
        })
        .unwrap()
    }

    fn request(policy: ToolPolicy, limits: ResourceLimits) -> Arc<RunRequest> {
        Arc::new(RunRequest {
            run_id: Uuid::new_v4(),
            prompt: "list files".into(),
            working_directory: PathBuf::from("/srv/project"),
            resume: None,
            limits,
            policy,
        })
    }

    async fn mount_stream(server: &MockServer, body: String) {
        Mock::given(method("POST"))
            .and(path("/v1/agent/runs"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(server)
            .await;
    }

    const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"sdk-7"}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","is_error":false,"result":"a.rs","session_id":"sdk-7","total_cost_usd":0.01,"num_turns":2}"#;

    #[test]
    fn test_decoder_handles_split_frames_and_sentinels() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\"").unwrap().is_empty());
        assert_eq!(decoder.push(b":1}\r\n\r\n: ping\n\n").unwrap(), vec!["{\"a\":1}"]);
        assert!(decoder.push(b"data: [DONE]\n\n").unwrap().is_empty());
        assert_eq!(
            decoder.push(b"event: x\ndata: one\ndata: two\n\n").unwrap(),
            vec!["one\ntwo"]
        );
        assert_eq!(decoder.push(b"data: tail").unwrap(), Vec::<String>::new());
        assert_eq!(decoder.finish().unwrap(), Some("tail".to_string()));
    }

    #[test]
    fn test_decoder_reassembles_multibyte_characters() {
        let mut decoder = SseDecoder::new();
        let bytes = "data: héllo\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&bytes[..split]).unwrap().is_empty());
        assert_eq!(decoder.push(&bytes[split..]).unwrap(), vec!["héllo"]);

        let mut broken = SseDecoder::new();
        assert_eq!(
            broken.push(b"data: \xff\xfe\n\n"),
            Err(ProtocolError::InvalidUtf8)
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(StreamingConfig::default().validate().is_ok());
        let bad = StreamingConfig {
            base_url: "ftp://agents.example.com".into(),
            ..StreamingConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_streams_a_full_run() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/agent/runs"))
            .and(body_partial_json(json!({"prompt": "list files", "resume": null, "max_turns": 10})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse(&[
                        INIT,
                        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking."},{"type":"tool_use","id":"toolu_1","name":"LS","input":{"path":"."}}]}}"#,
                        r#"{"type":"user","message":{"content":[]}}"#,
                        RESULT,
                    ])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let outcome = backend(&server)
            .run(
                request(ToolPolicy::new(), ResourceLimits::default()),
                CancellationToken::new(),
            )
            .await;
        let RunOutcome::Finished(result) = outcome else {
            panic!("expected finished run, got {:?}", outcome);
        };
        assert_eq!(result.termination, TerminationReason::Completed);
        assert_eq!(result.text, "Looking.");
        assert_eq!(
            result.session_id,
            Some(BackendSessionId::new(BackendKind::Streaming, "sdk-7"))
        );
        assert_eq!(result.ledger.len(), 1);
        assert_eq!(result.ledger[0].disposition(), Disposition::Approved);
        assert_eq!(result.turns, 2);
    }

    #[tokio::test]
    async fn test_unknown_message_type_is_structural() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            sse(&[INIT, r#"{"type":"rate_limit_event","retry_after":30}"#, RESULT]),
        )
        .await;

        let outcome = backend(&server)
            .run(
                request(ToolPolicy::new(), ResourceLimits::default()),
                CancellationToken::new(),
            )
            .await;
        match outcome {
            RunOutcome::Structural { message, .. } => {
                assert!(message.contains("rate_limit_event"), "{}", message)
            }
            other => panic!("expected structural failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_truncated_stream_is_structural() {
        let server = MockServer::start().await;
        mount_stream(&server, format!("data: {}\n\n", INIT)).await;

        let outcome = backend(&server)
            .run(
                request(ToolPolicy::new(), ResourceLimits::default()),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, RunOutcome::Structural { .. }));
    }

    #[tokio::test]
    async fn test_service_errors_are_not_structural() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/agent/runs"))
            .respond_with(ResponseTemplate::new(503).set_body_string("backend unavailable"))
            .mount(&server)
            .await;

        let outcome = backend(&server)
            .run(
                request(ToolPolicy::new(), ResourceLimits::default()),
                CancellationToken::new(),
            )
            .await;
        let RunOutcome::Finished(result) = outcome else {
            panic!("expected finished run, got {:?}", outcome);
        };
        match result.termination {
            TerminationReason::BackendError { message } => {
                assert!(message.contains("503"));
                assert!(message.contains("backend unavailable"));
            }
            other => panic!("expected backend_error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_denials_are_posted() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            sse(&[
                INIT,
                r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_9","name":"Bash","input":{"command":"rm -rf /"}}]}}"#,
                RESULT,
            ]),
        )
        .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1/agent/runs/[0-9a-f-]+/decisions$"))
            .and(body_partial_json(json!({"tool_use_id": "toolu_9", "behavior": "deny"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = backend(&server)
            .run(
                request(ToolPolicy::new().deny("Bash"), ResourceLimits::default()),
                CancellationToken::new(),
            )
            .await;
        let RunOutcome::Finished(result) = outcome else {
            panic!("expected finished run");
        };
        assert_eq!(result.ledger[0].disposition(), Disposition::Rejected);

        // Denials are relayed off the event path; give the relay a moment.
        for _ in 0..50 {
            let requests = server.received_requests().await.unwrap_or_default();
            if requests.iter().any(|r| r.url.path().ends_with("/decisions")) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("denial was never posted");
    }

    #[tokio::test]
    async fn test_turn_limit_interrupts_the_agent() {
        let server = MockServer::start().await;
        mount_stream(
            &server,
            sse(&[
                INIT,
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"one"},{"type":"tool_use","id":"t1","name":"LS","input":{}}]}}"#,
                r#"{"type":"assistant","message":{"content":[{"type":"text","text":"two"}]}}"#,
                RESULT,
            ]),
        )
        .await;
        Mock::given(method("POST"))
            .and(path_regex(r"^/v1/agent/runs/[0-9a-f-]+/interrupt$"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let limits = ResourceLimits {
            max_turns: 1,
            ..ResourceLimits::default()
        };
        let outcome = backend(&server)
            .run(request(ToolPolicy::new(), limits), CancellationToken::new())
            .await;
        let RunOutcome::Finished(result) = outcome else {
            panic!("expected finished run");
        };
        assert_eq!(result.termination, TerminationReason::MaxTurns);
        assert_eq!(result.text, "one");
    }

    #[tokio::test]
    async fn test_slow_service_times_out_without_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/agent/runs"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(sse(&[RESULT]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let limits = ResourceLimits {
            timeout: Duration::from_millis(200),
            ..ResourceLimits::default()
        };
        let outcome = backend(&server)
            .run(request(ToolPolicy::new(), limits), CancellationToken::new())
            .await;
        let RunOutcome::Finished(result) = outcome else {
            panic!("expected finished run");
        };
        assert_eq!(result.termination, TerminationReason::Timeout);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("short", 10), "short");
    }
}
