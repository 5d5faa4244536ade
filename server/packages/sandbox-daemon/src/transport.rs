//! Line-delimited JSON transport to a long-lived agent subprocess.
//!
//! Commands are written to the agent's stdin one JSON object per line and are
//! never awaited for a reply: whatever the agent prints on stdout is forwarded
//! verbatim into the event log as it arrives.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::event_log::EventLog;
use crate::events::{DaemonErrorKind, StreamEvent};
use crate::provider::{PromptRequest, ProviderError, StreamingBehavior};

/// Longest stdout line accepted from the agent, newline excluded.
pub const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// How long a stopping agent may keep draining before it is killed.
    pub stop_grace: Duration,
}

/// Outbound command frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcCommand<'a> {
    Prompt {
        message: &'a str,
        #[serde(rename = "streamingBehavior", skip_serializing_if = "Option::is_none")]
        streaming_behavior: Option<StreamingBehavior>,
    },
    Abort,
}

#[derive(Debug)]
struct TransportInner {
    state: TransportState,
    stdin: Option<ChildStdin>,
    stop: Option<oneshot::Sender<Duration>>,
    generation: u64,
}

#[derive(Debug)]
pub struct ProcessTransport {
    config: TransportConfig,
    events: EventLog,
    inner: Arc<Mutex<TransportInner>>,
}

impl ProcessTransport {
    pub fn new(config: TransportConfig, events: EventLog) -> Self {
        Self {
            config,
            events,
            inner: Arc::new(Mutex::new(TransportInner {
                state: TransportState::NotStarted,
                stdin: None,
                stop: None,
                generation: 0,
            })),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub async fn state(&self) -> TransportState {
        self.inner.lock().await.state
    }

    /// Spawns the agent. A no-op while it is already running; a spawn
    /// failure is returned to the caller and leaves the transport `Stopped`.
    pub async fn start(&self) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            TransportState::Starting | TransportState::Running => return Ok(()),
            TransportState::Stopping => {
                return Err(ProviderError::failed("agent process is still stopping"))
            }
            TransportState::NotStarted | TransportState::Stopped => {}
        }
        inner.state = TransportState::Starting;
        inner.generation += 1;
        let generation = inner.generation;

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                inner.state = TransportState::Stopped;
                tracing::warn!(
                    program = %self.config.program,
                    error = %source,
                    "failed to spawn agent process"
                );
                return Err(ProviderError::Spawn {
                    program: self.config.program.clone(),
                    source,
                });
            }
        };

        let Some(stdout) = child.stdout.take() else {
            inner.state = TransportState::Stopped;
            return Err(ProviderError::failed("agent stdout was not captured"));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        inner.stdin = child.stdin.take();
        inner.stop = Some(stop_tx);
        inner.state = TransportState::Running;

        tracing::info!(
            program = %self.config.program,
            pid = child.id(),
            "agent process started"
        );

        tokio::spawn(supervise(
            child,
            stdout,
            stop_rx,
            self.events.clone(),
            self.inner.clone(),
            generation,
        ));
        Ok(())
    }

    pub async fn send_prompt(&self, request: &PromptRequest) -> Result<(), ProviderError> {
        self.send(&RpcCommand::Prompt {
            message: &request.message,
            streaming_behavior: request.streaming_behavior,
        })
        .await
    }

    pub async fn abort(&self, reason: Option<&str>) -> Result<(), ProviderError> {
        tracing::info!(reason = reason.unwrap_or("unspecified"), "aborting agent work");
        self.send(&RpcCommand::Abort).await
    }

    async fn send(&self, command: &RpcCommand<'_>) -> Result<(), ProviderError> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');

        let mut inner = self.inner.lock().await;
        if inner.state != TransportState::Running {
            return Err(ProviderError::TransportNotStarted);
        }
        let stdin = inner
            .stdin
            .as_mut()
            .ok_or(ProviderError::TransportNotStarted)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Closes the agent's stdin so it can drain, then returns. The agent is
    /// killed if it is still alive once the grace period elapses.
    pub async fn stop(&self) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().await;
        if !matches!(
            inner.state,
            TransportState::Starting | TransportState::Running
        ) {
            return Ok(());
        }
        inner.state = TransportState::Stopping;
        inner.stdin = None;
        if let Some(stop) = inner.stop.take() {
            let _ = stop.send(self.config.stop_grace);
        }
        tracing::info!(program = %self.config.program, "agent process stopping");
        Ok(())
    }
}

async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    mut stop_rx: oneshot::Receiver<Duration>,
    events: EventLog,
    inner: Arc<Mutex<TransportInner>>,
    generation: u64,
) {
    let mut lines = LineReader::new(stdout, MAX_LINE_BYTES);
    let mut deadline: Option<Instant> = None;
    let mut killed = false;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(AgentLine::Complete(line))) => forward_line(&events, &line),
                Ok(Some(AgentLine::Overlong(len))) => {
                    tracing::debug!(bytes = len, "discarding overlong agent output");
                    events.append(StreamEvent::daemon_error(
                        DaemonErrorKind::InvalidAgentOutput,
                        format!("agent output line of {len} bytes exceeds the {MAX_LINE_BYTES} byte limit"),
                    ));
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read agent output");
                    break;
                }
            },
            grace = &mut stop_rx, if deadline.is_none() => {
                deadline = Some(Instant::now() + grace.unwrap_or_default());
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() && !killed => {
                killed = true;
                kill(&mut child);
            }
        }
    }

    // Stdout is closed; the process may still be alive.
    let status = loop {
        match deadline {
            Some(at) if !killed => match timeout_at(at, child.wait()).await {
                Ok(status) => break status,
                Err(_) => {
                    killed = true;
                    kill(&mut child);
                }
            },
            Some(_) => break child.wait().await,
            None => tokio::select! {
                status = child.wait() => break status,
                grace = &mut stop_rx => {
                    deadline = Some(Instant::now() + grace.unwrap_or_default());
                }
            },
        }
    };

    let mut guard = inner.lock().await;
    if guard.generation != generation {
        return;
    }
    let unexpected = guard.state == TransportState::Running;
    guard.state = TransportState::Stopped;
    guard.stdin = None;
    guard.stop = None;
    drop(guard);

    match status {
        Ok(status) if unexpected => {
            tracing::warn!(%status, "agent process exited unexpectedly");
            let code = status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            events.append(StreamEvent::daemon_error(
                DaemonErrorKind::ProviderExited,
                format!("agent process exited unexpectedly (code {code})"),
            ));
        }
        Ok(status) => tracing::info!(%status, "agent process stopped"),
        Err(err) => {
            tracing::warn!(error = %err, "failed to wait for agent process");
            if unexpected {
                events.append(StreamEvent::daemon_error(
                    DaemonErrorKind::ProviderExited,
                    format!("agent process lost: {err}"),
                ));
            }
        }
    }
}

fn kill(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        tracing::warn!(error = %err, "failed to kill agent process");
    }
}

/// One newline-terminated chunk of agent output.
#[derive(Debug, PartialEq, Eq)]
enum AgentLine {
    Complete(Vec<u8>),
    /// The line was dropped once it passed the limit; carries its length.
    Overlong(usize),
}

/// Byte-oriented line splitter with a length cap. State lives in the reader,
/// so a `next_line` future dropped by `select!` loses no data.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    discarded: Option<usize>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R, limit: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            discarded: None,
            limit,
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<AgentLine>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if let Some(len) = self.discarded.take() {
                    return Ok(Some(AgentLine::Overlong(len)));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(AgentLine::Complete(std::mem::take(&mut self.buf))));
            }

            let newline = available.iter().position(|byte| *byte == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            let used = newline.map_or(available.len(), |at| at + 1);

            if let Some(len) = self.discarded.as_mut() {
                *len += chunk.len();
            } else if self.buf.len() + chunk.len() > self.limit {
                self.discarded = Some(self.buf.len() + chunk.len());
                self.buf = Vec::new();
            } else {
                self.buf.extend_from_slice(chunk);
            }
            self.reader.consume(used);

            if newline.is_some() {
                if let Some(len) = self.discarded.take() {
                    return Ok(Some(AgentLine::Overlong(len)));
                }
                return Ok(Some(AgentLine::Complete(std::mem::take(&mut self.buf))));
            }
        }
    }
}

fn forward_line(events: &EventLog, line: &[u8]) {
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }
    match serde_json::from_slice::<Value>(line) {
        Ok(value) => {
            events.append(StreamEvent::Agent(value));
        }
        Err(err) => {
            tracing::debug!(error = %err, bytes = line.len(), "discarding unparseable agent output");
            events.append(StreamEvent::daemon_error(
                DaemonErrorKind::InvalidAgentOutput,
                format!("failed to parse agent output: {err}"),
            ));
        }
    }
}

async fn log_stderr(stderr: ChildStderr) {
    let mut lines = LineReader::new(stderr, MAX_LINE_BYTES);
    while let Ok(Some(line)) = lines.next_line().await {
        match line {
            AgentLine::Complete(line) => {
                let line = String::from_utf8_lossy(&line);
                tracing::debug!(target: "sandbox_daemon::agent", line = %line, "agent stderr");
            }
            AgentLine::Overlong(len) => {
                tracing::debug!(target: "sandbox_daemon::agent", bytes = len, "agent stderr line too long");
            }
        }
    }
}
