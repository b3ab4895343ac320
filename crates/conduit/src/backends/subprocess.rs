//! Backend B: the command-line agent, driven over stdin/stdout.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::base::{foreign_resume_note, pump, Backend, BackendRun, PumpExit, EVENT_BUFFER};
use super::protocol::{translate_payloads, ProtocolError};
use crate::config::ConfigError;
use crate::errors::BackendError;
use crate::model::{BackendKind, ResourceLimits, RunEvent, RunRequest, TerminationReason};
use crate::permission::ToolPolicy;

/// Bytes of stderr kept for error messages.
const STDERR_TAIL: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessConfig {
    pub program: PathBuf,
    /// Extra arguments placed before the generated ones.
    pub args: Vec<String>,
    pub model: Option<String>,
    pub kill_grace_ms: u64,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("claude"),
            args: Vec::new(),
            model: None,
            kill_grace_ms: 2_000,
        }
    }
}

impl SubprocessConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("subprocess.program is empty".into()));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone)]
pub struct SubprocessBackend {
    config: Arc<SubprocessConfig>,
}

impl SubprocessBackend {
    pub fn new(config: SubprocessConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Full argument list for one run.
    pub fn command_args(&self, request: &RunRequest) -> Vec<String> {
        let mut args = self.config.args.clone();
        args.extend(
            [
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--max-turns",
            ]
            .map(String::from),
        );
        args.push(request.limits.max_turns.to_string());

        if let Some(resume) = request.resume_id(BackendKind::Subprocess) {
            args.push("--resume".into());
            args.push(resume.to_string());
        }
        if let Some(model) = &self.config.model {
            args.push("--model".into());
            args.push(model.clone());
        }
        let allowed = ToolPolicy::tool_names(&request.policy.allowed);
        if !allowed.is_empty() {
            args.push("--allowedTools".into());
            args.push(allowed.join(","));
        }
        let disallowed = ToolPolicy::tool_names(&request.policy.disallowed);
        if !disallowed.is_empty() {
            args.push("--disallowedTools".into());
            args.push(disallowed.join(","));
        }
        args
    }
}

#[async_trait]
impl Backend for SubprocessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
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
        let mut command = Command::new(&self.config.program);
        command
            .args(self.command_args(&request))
            .current_dir(&request.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            BackendError::Spawn(format!("{}: {}", self.config.program.display(), e))
        })?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(BackendError::Spawn("agent stdio was not captured".to_string()));
        };
        debug!(run_id = %request.run_id, pid = ?child.id(), "agent process started");

        let guard = ProcessGuard::new(child, self.config.kill_grace());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let run = AgentProcess {
            guard,
            limits: request.limits,
            deadline,
            abort: cancel.clone(),
        };
        let prompt = request.prompt.clone();
        let task = tokio::spawn(async move {
            run.produce(prompt, stdin, stdout, stderr, tx).await;
        });

        let notes = foreign_resume_note(&request, BackendKind::Subprocess)
            .into_iter()
            .collect();
        Ok(BackendRun::new(rx, cancel, task).with_notes(notes))
    }
}

struct AgentProcess {
    guard: ProcessGuard,
    limits: ResourceLimits,
    deadline: Instant,
    abort: CancellationToken,
}

impl AgentProcess {
    async fn produce<E>(
        mut self,
        prompt: String,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: E,
        tx: mpsc::Sender<RunEvent>,
    ) where
        E: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(write_prompt(stdin, prompt));
        let stderr_tail = tokio::spawn(read_tail(stderr, STDERR_TAIL));

        let lines = Box::pin(stream! {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => yield Ok(line),
                    Ok(None) => break,
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        yield Err(ProtocolError::InvalidUtf8);
                        break;
                    }
                    Err(e) => {
                        yield Err(ProtocolError::Transport(e.to_string()));
                        break;
                    }
                }
            }
        });
        let source = translate_payloads(lines, BackendKind::Subprocess);

        let terminal = match pump(source, self.limits, self.deadline, &self.abort, &tx).await {
            PumpExit::Finished(event) => {
                let grace = self.guard.grace;
                match self.guard.reap(grace).await {
                    Some(status) if !status.success() => {
                        warn!(%status, "agent process failed after its result");
                        let message = format!("agent exited with {}", status);
                        backend_error(with_stderr(message, stderr_tail).await)
                    }
                    _ => event,
                }
            }
            PumpExit::Limit(reason) => {
                info!(%reason, "limit reached; stopping agent process");
                self.guard.terminate().await;
                RunEvent::completed(reason)
            }
            PumpExit::Structural(message) => {
                self.guard.terminate().await;
                backend_error(format!("unreadable agent output: {}", message))
            }
            PumpExit::SourceClosed => self.closed_without_result(stderr_tail).await,
            PumpExit::Cancelled | PumpExit::ReceiverGone => {
                self.guard.terminate().await;
                return;
            }
        };
        let _ = tx.send(terminal).await;
    }

    /// Stdout closed before a result message: report how the process ended.
    async fn closed_without_result(&mut self, stderr_tail: JoinHandle<String>) -> RunEvent {
        let status = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            _ = tokio::time::sleep_until(self.deadline) => None,
            status = self.guard.wait() => status,
        };
        let Some(status) = status else {
            self.guard.terminate().await;
            return if self.abort.is_cancelled() {
                RunEvent::completed(TerminationReason::Cancelled)
            } else {
                RunEvent::completed(TerminationReason::Timeout)
            };
        };
        // Leftover children may still hold the group.
        self.guard.terminate().await;

        let message = if status.success() {
            "agent exited without a result message".to_string()
        } else {
            format!("agent exited with {}", status)
        };
        warn!(%status, "agent process ended without a result");
        backend_error(with_stderr(message, stderr_tail).await)
    }
}

/// Appends whatever the agent wrote to stderr to `message`.
async fn with_stderr(message: String, stderr_tail: JoinHandle<String>) -> String {
    let stderr = stderr_tail.await.unwrap_or_default();
    let stderr = stderr.trim();
    if stderr.is_empty() {
        message
    } else {
        format!("{}: {}", message, stderr)
    }
}

fn backend_error(message: String) -> RunEvent {
    RunEvent::completed(TerminationReason::BackendError { message })
}

async fn write_prompt(mut stdin: ChildStdin, prompt: String) {
    if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
        debug!(error = %e, "agent did not read the prompt");
        return;
    }
    if let Err(e) = stdin.shutdown().await {
        debug!(error = %e, "failed to close agent stdin");
    }
}

/// Reads `reader` to the end, keeping only the last `limit` bytes.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > limit {
                    tail.drain(..tail.len() - limit);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

/// Owns the agent process and its process group.
///
/// Every exit path ends with the group signalled and the leader reaped; the
/// drop impl covers an aborted task.
struct ProcessGuard {
    child: Child,
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
    grace: Duration,
    reaped: bool,
}

impl ProcessGuard {
    fn new(child: Child, grace: Duration) -> Self {
        let pgid = child.id();
        Self {
            child,
            pgid,
            grace,
            reaped: false,
        }
    }

    async fn wait(&mut self) -> Option<ExitStatus> {
        match self.child.wait().await {
            Ok(status) => {
                self.reaped = true;
                Some(status)
            }
            Err(e) => {
                warn!(error = %e, "failed to wait for agent process");
                None
            }
        }
    }

    /// Gives the process `within` to exit on its own, then clears the group.
    /// Returns the exit status if the process exited by itself.
    async fn reap(&mut self, within: Duration) -> Option<ExitStatus> {
        let status = match tokio::time::timeout(within, self.wait()).await {
            Ok(status) => status,
            Err(_) => {
                debug!("agent process lingered after its result");
                None
            }
        };
        self.terminate().await;
        status
    }

    /// SIGTERM to the group, SIGKILL after the grace period, then reap.
    async fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if !self.reaped {
                self.signal_group(nix::sys::signal::Signal::SIGTERM);
                if tokio::time::timeout(self.grace, self.wait()).await.is_err() {
                    self.signal_group(nix::sys::signal::Signal::SIGKILL);
                }
            }
            // The leader may be gone while the rest of its group lives on.
            self.signal_group(nix::sys::signal::Signal::SIGKILL);
        }
        if !self.reaped {
            let _ = self.child.start_kill();
            self.wait().await;
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::errno::Errno;
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid else {
            return;
        };
        match killpg(Pid::from_raw(pgid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid, ?signal, error = %e, "failed to signal agent process group"),
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);
        let _ = self.child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::RunOutcome;
    use crate::model::BackendSessionId;
    use uuid::Uuid;

    fn request(resume: Option<BackendSessionId>) -> RunRequest {
        RunRequest {
            run_id: Uuid::new_v4(),
            prompt: "hello".into(),
            working_directory: std::env::temp_dir(),
            resume,
            limits: ResourceLimits::default(),
            policy: ToolPolicy::new().allow("Read").deny("Bash").deny("WebFetch"),
        }
    }

    #[test]
    fn test_command_line() {
        let backend = SubprocessBackend::new(SubprocessConfig {
            args: vec!["--debug".into()],
            model: Some("sonnet".into()),
            ..SubprocessConfig::default()
        })
        .unwrap();
        let args = backend.command_args(&request(Some(BackendSessionId::new(
            BackendKind::Subprocess,
            "cli-3",
        ))));
        assert_eq!(
            args,
            vec![
                "--debug",
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--max-turns",
                "10",
                "--resume",
                "cli-3",
                "--model",
                "sonnet",
                "--allowedTools",
                "Read",
                "--disallowedTools",
                "Bash,WebFetch",
            ]
        );
    }

    #[test]
    fn test_foreign_session_is_not_resumed() {
        let backend = SubprocessBackend::new(SubprocessConfig::default()).unwrap();
        let args = backend.command_args(&request(Some(BackendSessionId::new(
            BackendKind::Streaming,
            "sdk-1",
        ))));
        assert!(!args.contains(&"--resume".to_string()));
        assert!(!args.contains(&"sdk-1".to_string()));
    }

    #[test]
    fn test_empty_program_is_rejected() {
        let config = SubprocessConfig {
            program: PathBuf::new(),
            ..SubprocessConfig::default()
        };
        assert!(SubprocessBackend::new(config).is_err());
    }

    #[tokio::test]
    async fn test_missing_program_is_a_backend_error() {
        let backend = SubprocessBackend::new(SubprocessConfig {
            program: PathBuf::from("/nonexistent/agent-binary"),
            ..SubprocessConfig::default()
        })
        .unwrap();
        let outcome = backend
            .run(Arc::new(request(None)), CancellationToken::new())
            .await;
        let RunOutcome::Finished(result) = outcome else {
            panic!("expected a finished run");
        };
        assert!(matches!(
            result.termination,
            TerminationReason::BackendError { .. }
        ));
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        fn script(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("agent.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn backend(program: PathBuf, grace_ms: u64) -> SubprocessBackend {
            SubprocessBackend::new(SubprocessConfig {
                program,
                kill_grace_ms: grace_ms,
                ..SubprocessConfig::default()
            })
            .unwrap()
        }

        fn request_in(dir: &TempDir, limits: ResourceLimits) -> Arc<RunRequest> {
            Arc::new(RunRequest {
                run_id: Uuid::new_v4(),
                prompt: "hello".into(),
                working_directory: dir.path().to_path_buf(),
                resume: Some(BackendSessionId::new(BackendKind::Streaming, "sdk-1")),
                limits,
                policy: ToolPolicy::new(),
            })
        }

        async fn finished(backend: &SubprocessBackend, request: Arc<RunRequest>) -> crate::model::RunResult {
            match backend.run(request, CancellationToken::new()).await {
                RunOutcome::Finished(result) => result,
                other => panic!("subprocess runs never fault structurally: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_successful_run() {
            let dir = TempDir::new().unwrap();
            let program = script(
                &dir,
                r#"prompt=$(cat)
echo '{"type":"system","subtype":"init","session_id":"cli-1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Working in the directory"}]}}'
printf '{"type":"result","subtype":"success","is_error":false,"result":"echo %s","session_id":"cli-1","total_cost_usd":0.05,"num_turns":1}\n' "$prompt""#,
            );

            let result = finished(&backend(program, 500), request_in(&dir, ResourceLimits::default())).await;
            assert_eq!(result.termination, TerminationReason::Completed);
            assert_eq!(result.text, "Working in the directory");
            assert_eq!(
                result.session_id,
                Some(BackendSessionId::new(BackendKind::Subprocess, "cli-1"))
            );
            assert_eq!(result.usage.total_cost_usd, Some(0.05));
            assert_eq!(result.notes.len(), 1);
            assert!(result.notes[0].contains("sdk-1"));
        }

        #[tokio::test]
        async fn test_prompt_reaches_stdin() {
            let dir = TempDir::new().unwrap();
            let program = script(
                &dir,
                r#"prompt=$(cat)
printf '{"type":"result","subtype":"success","is_error":false,"result":"got %s"}\n' "$prompt""#,
            );
            let result = finished(&backend(program, 500), request_in(&dir, ResourceLimits::default())).await;
            assert_eq!(result.text, "got hello");
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_a_backend_error() {
            let dir = TempDir::new().unwrap();
            let program = script(&dir, "cat > /dev/null\necho 'invalid api key' >&2\nexit 3");

            let result = finished(&backend(program, 500), request_in(&dir, ResourceLimits::default())).await;
            match result.termination {
                TerminationReason::BackendError { message } => {
                    assert!(message.contains("invalid api key"), "{}", message);
                }
                other => panic!("expected backend_error, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_nonzero_exit_after_result_is_a_backend_error() {
            let dir = TempDir::new().unwrap();
            let program = script(
                &dir,
                r#"cat > /dev/null
echo '{"type":"result","subtype":"success","is_error":false,"result":"all done","session_id":"cli-2"}'
echo 'boom' >&2
exit 7"#,
            );

            let result = finished(&backend(program, 500), request_in(&dir, ResourceLimits::default())).await;
            match result.termination {
                TerminationReason::BackendError { message } => {
                    assert!(message.contains("7"), "{}", message);
                    assert!(message.contains("boom"), "{}", message);
                }
                other => panic!("expected backend_error, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_cost_reported_by_the_result_keeps_the_answer() {
            let dir = TempDir::new().unwrap();
            let program = script(
                &dir,
                r#"cat > /dev/null
echo '{"type":"result","subtype":"success","is_error":false,"result":"the answer","session_id":"cli-3","total_cost_usd":10.5}'"#,
            );
            let limits = ResourceLimits {
                max_cost_usd: 10.0,
                ..ResourceLimits::default()
            };

            let result = finished(&backend(program, 500), request_in(&dir, limits)).await;
            assert_eq!(result.termination, TerminationReason::Completed);
            assert_eq!(result.text, "the answer");
            assert_eq!(result.usage.total_cost_usd, Some(10.5));
            assert_eq!(
                result.session_id,
                Some(BackendSessionId::new(BackendKind::Subprocess, "cli-3"))
            );
        }

        #[tokio::test]
        async fn test_declined_explanation_at_the_turn_limit() {
            let dir = TempDir::new().unwrap();
            let program = script(
                &dir,
                r#"cat > /dev/null
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"LS","input":{"path":"."}}]}}'
echo '{"type":"result","subtype":"error_during_execution","is_error":true,"result":"I cannot finish this task."}'"#,
            );
            let limits = ResourceLimits {
                max_turns: 1,
                ..ResourceLimits::default()
            };

            let result = finished(&backend(program, 500), request_in(&dir, limits)).await;
            assert_eq!(result.termination, TerminationReason::Completed);
            assert_eq!(result.text, "I cannot finish this task.");
            assert_eq!(result.ledger.len(), 1);
        }

        #[tokio::test]
        async fn test_unknown_message_is_a_backend_error() {
            let dir = TempDir::new().unwrap();
            let program = script(
                &dir,
                r#"cat > /dev/null
echo '{"type":"rate_limit_event"}'
sleep 30"#,
            );

            let result = finished(&backend(program, 500), request_in(&dir, ResourceLimits::default())).await;
            match result.termination {
                TerminationReason::BackendError { message } => {
                    assert!(message.contains("rate_limit_event"), "{}", message)
                }
                other => panic!("expected backend_error, got {:?}", other),
            }
        }

        #[cfg(target_os = "linux")]
        #[tokio::test]
        async fn test_timeout_kills_the_whole_process_group() {
            let dir = TempDir::new().unwrap();
            let pid_file = dir.path().join("child.pid");
            let program = script(
                &dir,
                &format!(
                    "sleep 60 &\necho $! > '{}'\necho $$ >> '{}'\nwait",
                    pid_file.display(),
                    pid_file.display()
                ),
            );
            let limits = ResourceLimits {
                timeout: Duration::from_millis(500),
                ..ResourceLimits::default()
            };

            let result = finished(&backend(program, 200), request_in(&dir, limits)).await;
            assert_eq!(result.termination, TerminationReason::Timeout);

            let pids: Vec<u32> = std::fs::read_to_string(&pid_file)
                .unwrap()
                .lines()
                .map(|line| line.trim().parse().unwrap())
                .collect();
            assert_eq!(pids.len(), 2);
            for _ in 0..100 {
                if pids.iter().all(|pid| !alive(*pid)) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("agent processes {:?} outlived the run", pids);
        }

        /// Zombies count as dead: they hold no resources besides the pid.
        #[cfg(target_os = "linux")]
        fn alive(pid: u32) -> bool {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Ok(stat) => !stat
                    .rsplit_once(')')
                    .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                    .unwrap_or(false),
                Err(_) => false,
            }
        }
    }
}
