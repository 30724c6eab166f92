//! STDIO subprocess transport adapter.
//!
//! Spawns the source as a child process and speaks MCP over its stdin/stdout
//! through rmcp. Noisy servers are tolerated: non-JSON stdout lines are
//! dropped before rmcp sees them, and stderr is drained into a rolling buffer
//! whose tail is attached to spawn failures.
//!
//! The process is (re)started only by the health probe; calls against a dead
//! or missing process fail fast with `SourceUnavailable`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::{Peer, RoleClient, ServiceError, ServiceExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{StdioSettings, resolve_env_vars};
use crate::error::GatewayError;
use crate::source::{AdapterTimeouts, HealthResult, bounded, classify_rpc_error};
use crate::tool::{ToolArguments, ToolDescriptor, ToolResult};

/// Stderr lines kept per source for diagnostics.
const STDERR_CAPACITY: usize = 100;

/// Rolling buffer of a child's stderr output.
pub struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    /// Push a line, evicting the oldest at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn last(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }
}

/// Spawn the child with all three stdio pipes attached.
fn spawn_stdio_child(source_id: &str, settings: &StdioSettings) -> crate::Result<Child> {
    let mut cmd = Command::new(&settings.command);
    cmd.args(&settings.args);

    if !settings.env.is_empty() {
        cmd.envs(resolve_env_vars(&settings.env));
    }
    if let Some(cwd) = &settings.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    cmd.spawn().map_err(|e| {
        GatewayError::SourceUnavailable(
            source_id.to_string(),
            format!("failed to spawn '{}': {}", settings.command, e),
        )
    })
}

/// Forward only JSON lines from `stdout` into the returned stream.
///
/// The stream reaches EOF when `stdout` does or `cancel` fires.
fn start_stdout_filter<R>(stdout: R, source_id: String, cancel: CancellationToken) -> DuplexStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (filtered, mut sink) = tokio::io::duplex(64 * 1024);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if serde_json::from_str::<serde_json::Value>(&line).is_err() {
                            tracing::debug!(source = %source_id, line = %line, "discarding non-JSON stdout line");
                            continue;
                        }
                        let framed = format!("{}\n", line);
                        if sink.write_all(framed.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    });

    filtered
}

/// Drain `stderr` into `buffer`, logging each line at debug.
fn start_stderr_drain<R>(
    stderr: R,
    source_id: String,
    buffer: Arc<Mutex<StderrBuffer>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        tracing::debug!(source = %source_id, line = %line, "source stderr");
                        buffer.lock().await.push(line);
                    }
                    Ok(None) | Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    });
}

/// A spawned child with a completed MCP handshake.
struct StdioSession {
    running: RunningService<RoleClient, ()>,
    child: Child,
    io_cancel: CancellationToken,
}

impl StdioSession {
    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn shutdown(mut self) {
        self.io_cancel.cancel();
        let _ = self.child.kill().await;
        let _ = self.running.cancel().await;
    }
}

pub struct StdioAdapter {
    source_id: String,
    settings: StdioSettings,
    timeouts: AdapterTimeouts,
    session: Mutex<Option<StdioSession>>,
    stderr: Arc<Mutex<StderrBuffer>>,
}

impl StdioAdapter {
    pub fn new(source_id: String, settings: StdioSettings, timeouts: AdapterTimeouts) -> Self {
        Self {
            source_id,
            settings,
            timeouts,
            session: Mutex::new(None),
            stderr: Arc::new(Mutex::new(StderrBuffer::new(STDERR_CAPACITY))),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// `" (stderr: ...)"` with the child's last stderr line, if any.
    async fn stderr_hint(&self) -> String {
        match self.stderr.lock().await.last() {
            Some(line) => format!(" (stderr: {})", line),
            None => String::new(),
        }
    }

    async fn spawn_session(&self) -> crate::Result<StdioSession> {
        let mut child = spawn_stdio_child(&self.source_id, &self.settings)?;
        let pipe_error = |name: &str| {
            GatewayError::SourceUnavailable(self.source_id.clone(), format!("failed to open {} pipe", name))
        };
        let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;

        let io_cancel = CancellationToken::new();
        let filtered = start_stdout_filter(stdout, self.source_id.clone(), io_cancel.clone());
        start_stderr_drain(stderr, self.source_id.clone(), self.stderr.clone(), io_cancel.clone());

        let timeout_secs = self.settings.handshake_timeout_secs;
        let handshake = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            ().serve_with_ct((filtered, stdin), io_cancel.clone()),
        )
        .await;

        let reason = match handshake {
            Ok(Ok(running)) => {
                return Ok(StdioSession {
                    running,
                    child,
                    io_cancel,
                });
            }
            Ok(Err(e)) => format!("MCP handshake failed: {}", e),
            Err(_elapsed) => format!("MCP handshake timed out after {}s", timeout_secs),
        };

        io_cancel.cancel();
        let _ = child.kill().await;
        Err(GatewayError::SourceUnavailable(
            self.source_id.clone(),
            format!("{}{}", reason, self.stderr_hint().await),
        ))
    }

    /// Peer of the live session; never spawns.
    async fn peer(&self) -> crate::Result<Peer<RoleClient>> {
        let mut slot = self.session.lock().await;
        let running = slot.as_mut().map(StdioSession::is_running);
        match (slot.as_ref(), running) {
            (Some(session), Some(true)) => Ok(session.running.peer().clone()),
            (Some(_), _) => Err(GatewayError::SourceUnavailable(
                self.source_id.clone(),
                format!("process exited{}", self.stderr_hint().await),
            )),
            (None, _) => Err(GatewayError::SourceUnavailable(
                self.source_id.clone(),
                "not connected".into(),
            )),
        }
    }

    /// Liveness is the child still running; a dead or missing child is respawned here.
    pub async fn probe_health(&self) -> HealthResult {
        let started = Instant::now();

        let stale = {
            let mut slot = self.session.lock().await;
            if slot.as_mut().is_some_and(StdioSession::is_running) {
                return HealthResult::healthy(started.elapsed());
            }
            slot.take()
        };
        if let Some(stale) = stale {
            tracing::warn!(source = %self.source_id, "stdio process exited, respawning");
            stale.shutdown().await;
        }

        tracing::info!(source = %self.source_id, command = %self.settings.command, "spawning stdio source");
        match self.spawn_session().await {
            Ok(session) => {
                if let Some(raced) = self.session.lock().await.replace(session) {
                    raced.shutdown().await;
                }
                HealthResult::healthy(started.elapsed())
            }
            Err(e) => HealthResult::failed(e.to_string(), started.elapsed()),
        }
    }

    pub async fn list_tools(&self) -> crate::Result<Vec<ToolDescriptor>> {
        let peer = self.peer().await?;
        bounded(&self.source_id, "tools/list", self.timeouts.call, async {
            let tools = peer
                .list_all_tools()
                .await
                .map_err(|e| self.map_service_error(None, e))?;
            tools
                .iter()
                .map(|tool| {
                    let wire = serde_json::to_value(tool)
                        .map_err(|e| GatewayError::ProtocolMismatch(self.source_id.clone(), e.to_string()))?;
                    ToolDescriptor::from_wire(&self.source_id, &wire)
                })
                .collect()
        })
        .await
    }

    pub async fn call_tool(&self, name: &str, arguments: ToolArguments) -> crate::Result<ToolResult> {
        let peer = self.peer().await?;
        let params = CallToolRequestParams {
            name: name.to_string().into(),
            arguments,
            task: None,
            meta: None,
        };
        bounded(&self.source_id, "tools/call", self.timeouts.call, async {
            let result = peer
                .call_tool(params)
                .await
                .map_err(|e| self.map_service_error(Some(name), e))?;
            serde_json::to_value(&result)
                .map_err(|e| GatewayError::ProtocolMismatch(self.source_id.clone(), e.to_string()))
        })
        .await
    }

    fn map_service_error(&self, tool: Option<&str>, err: ServiceError) -> GatewayError {
        match err {
            ServiceError::McpError(data) => match serde_json::to_value(&data) {
                Ok(payload) => classify_rpc_error(&self.source_id, tool, &payload),
                Err(_) => GatewayError::UpstreamError {
                    source_id: self.source_id.clone(),
                    message: data.message.to_string(),
                    payload: serde_json::Value::Null,
                },
            },
            other => GatewayError::SourceUnavailable(self.source_id.clone(), other.to_string()),
        }
    }

    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::io::AsyncReadExt;

    fn settings(command: &str) -> StdioSettings {
        StdioSettings {
            command: command.to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            handshake_timeout_secs: 2,
        }
    }

    #[test]
    fn test_stderr_buffer_capacity() {
        let mut buf = StderrBuffer::new(3);
        for i in 1..=4 {
            buf.push(format!("line{}", i));
        }
        assert_eq!(buf.lines().len(), 3);
        assert_eq!(buf.lines().front().unwrap(), "line2");
        assert_eq!(buf.last(), Some("line4"));
    }

    #[tokio::test]
    async fn test_spawn_missing_command() {
        let result = spawn_stdio_child("local", &settings("/this/command/does/not/exist-toolgate"));
        assert!(matches!(result, Err(GatewayError::SourceUnavailable(id, _)) if id == "local"));
    }

    #[tokio::test]
    async fn test_stdout_filter_drops_non_json() {
        let input: &'static [u8] =
            b"starting up...\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\nwarning: noisy\n{\"x\":1}\n";
        let mut filtered = start_stdout_filter(input, "noisy".into(), CancellationToken::new());

        let mut out = String::new();
        filtered.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n{\"x\":1}\n");
    }

    #[tokio::test]
    async fn test_stderr_drain_fills_buffer() {
        let input: &'static [u8] = b"first\nsecond\n";
        let buffer = Arc::new(Mutex::new(StderrBuffer::new(10)));
        start_stderr_drain(input, "local".into(), buffer.clone(), CancellationToken::new());

        for _ in 0..50 {
            if buffer.lock().await.lines().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(buffer.lock().await.last(), Some("second"));
    }

    #[tokio::test]
    async fn test_calls_before_probe_are_unavailable() {
        let adapter = StdioAdapter::new("local".into(), settings("true"), AdapterTimeouts::default());
        assert!(matches!(
            adapter.list_tools().await,
            Err(GatewayError::SourceUnavailable(_, msg)) if msg == "not connected"
        ));
        assert!(adapter.call_tool("x", None).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_fails_when_spawn_fails() {
        let adapter = StdioAdapter::new(
            "local".into(),
            settings("/this/command/does/not/exist-toolgate"),
            AdapterTimeouts::default(),
        );
        let result = adapter.probe_health().await;
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_probe_fails_when_child_exits_before_handshake() {
        let adapter = StdioAdapter::new("local".into(), settings("true"), AdapterTimeouts::default());
        let result = adapter.probe_health().await;
        assert!(!result.ok);
        adapter.close().await;
    }

    #[cfg(all(test, feature = "integration-tests"))]
    mod integration {
        use super::*;

        #[tokio::test]
        async fn test_real_stdio_server_lists_and_calls() {
            let mut settings = settings("npx");
            settings.args = vec!["-y".into(), "@modelcontextprotocol/server-everything".into()];
            settings.handshake_timeout_secs = 60;
            let adapter = StdioAdapter::new("everything".into(), settings, AdapterTimeouts::default());

            let probe = adapter.probe_health().await;
            assert!(probe.ok, "probe failed: {:?}", probe.error);

            let tools = adapter.list_tools().await.unwrap();
            assert!(tools.iter().any(|t| t.name == "echo"));

            let mut args = serde_json::Map::new();
            args.insert("message".into(), serde_json::json!("hello"));
            let result = adapter.call_tool("echo", Some(args)).await.unwrap();
            assert!(result.to_string().contains("hello"));

            adapter.close().await;
        }
    }
}
