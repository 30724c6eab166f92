//! WebSocket transport adapter.
//!
//! Holds one persistent connection per source. A reader task dispatches
//! JSON-RPC responses to waiting callers by request id; liveness is a
//! ping/pong round trip. A dropped connection is re-established only by the
//! health probe, never inline on the call path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::config::WebSocketSettings;
use crate::error::GatewayError;
use crate::jsonrpc;
use crate::source::{AdapterTimeouts, HealthResult, bounded, rpc_result};
use crate::tool::{ToolArguments, ToolDescriptor, ToolResult};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type Pending = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// MCP protocol revision announced during the WebSocket handshake.
const PROTOCOL_VERSION: &str = "2025-03-26";

struct WsConnection {
    sink: Mutex<WsSink>,
    pending: Pending,
    pong: Arc<Notify>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl WsConnection {
    async fn open(source_id: &str, url: &str) -> crate::Result<Self> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| GatewayError::SourceUnavailable(source_id.to_string(), e.to_string()))?;
        let (sink, mut read) = stream.split();

        let pending: Pending = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let pong = Arc::new(Notify::new());
        let alive = Arc::new(AtomicBool::new(true));

        let reader = {
            let pending = pending.clone();
            let pong = pong.clone();
            let alive = alive.clone();
            let source_id = source_id.to_string();
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => dispatch(&source_id, &pending, text.as_str()),
                        Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                            Ok(text) => dispatch(&source_id, &pending, text),
                            Err(_) => tracing::debug!(source = %source_id, "discarding non-UTF-8 binary frame"),
                        },
                        Ok(Message::Pong(_)) => pong.notify_waiters(),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!(source = %source_id, error = %e, "websocket read failed");
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                // dropping the senders wakes every waiting caller
                if let Ok(mut pending) = pending.lock() {
                    pending.clear();
                }
                tracing::info!(source = %source_id, "websocket connection closed");
            })
        };

        Ok(Self {
            sink: Mutex::new(sink),
            pending,
            pong,
            alive,
            reader,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send(&self, source_id: &str, value: &Value) -> crate::Result<()> {
        self.sink
            .lock()
            .await
            .send(Message::text(value.to_string()))
            .await
            .map_err(|e| GatewayError::SourceUnavailable(source_id.to_string(), e.to_string()))
    }

    /// Send one request and wait for the response with the same id.
    async fn request(&self, source_id: &str, id: u64, method: &str, params: Value) -> crate::Result<Value> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }

        if let Err(e) = self.send(source_id, &jsonrpc::request(id, method, params)).await {
            self.forget(id);
            return Err(e);
        }

        rx.await.map_err(|_| {
            GatewayError::SourceUnavailable(source_id.to_string(), "connection closed before response".into())
        })
    }

    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
    }

    async fn ping(&self, source_id: &str, limit: Duration) -> crate::Result<()> {
        let notified = self.pong.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        self.sink
            .lock()
            .await
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| GatewayError::SourceUnavailable(source_id.to_string(), e.to_string()))?;

        tokio::time::timeout(limit, notified).await.map_err(|_| {
            GatewayError::SourceUnavailable(
                source_id.to_string(),
                format!("no pong within {}ms", limit.as_millis()),
            )
        })
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.send(Message::Close(None)).await;
        self.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Route one inbound text frame to the caller waiting on its id.
fn dispatch(source_id: &str, pending: &Pending, text: &str) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        tracing::debug!(source = %source_id, "discarding non-JSON websocket frame");
        return;
    };
    let Some(id) = value.get("id").and_then(Value::as_u64) else {
        // server-initiated notifications are not consumed
        return;
    };
    let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
    if let Some(tx) = waiter {
        let _ = tx.send(value);
    }
}

pub struct WebSocketAdapter {
    source_id: String,
    settings: WebSocketSettings,
    timeouts: AdapterTimeouts,
    connection: Mutex<Option<Arc<WsConnection>>>,
    next_id: AtomicU64,
}

impl WebSocketAdapter {
    pub fn new(source_id: String, settings: WebSocketSettings, timeouts: AdapterTimeouts) -> Self {
        Self {
            source_id,
            settings,
            timeouts,
            connection: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a connection and run the MCP initialize exchange on it.
    async fn connect(&self) -> crate::Result<Arc<WsConnection>> {
        let limit = Duration::from_secs(self.settings.handshake_timeout_secs);
        bounded(&self.source_id, "websocket handshake", limit, async {
            let conn = WsConnection::open(&self.source_id, &self.settings.url).await?;
            let params = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "toolgate", "version": env!("CARGO_PKG_VERSION")},
            });
            let response = conn
                .request(&self.source_id, self.next_id(), "initialize", params)
                .await?;
            rpc_result(&self.source_id, None, response)?;
            conn.send(&self.source_id, &jsonrpc::notification("notifications/initialized", json!({})))
                .await?;
            Ok(Arc::new(conn))
        })
        .await
    }

    /// Live connection, if any. Does not reconnect.
    async fn current(&self) -> crate::Result<Arc<WsConnection>> {
        match self.connection.lock().await.as_ref() {
            Some(conn) if conn.is_alive() => Ok(conn.clone()),
            _ => Err(GatewayError::SourceUnavailable(
                self.source_id.clone(),
                "not connected".into(),
            )),
        }
    }

    pub async fn probe_health(&self) -> HealthResult {
        let started = Instant::now();

        let existing = {
            let mut slot = self.connection.lock().await;
            match slot.as_ref() {
                Some(conn) if conn.is_alive() => Some(conn.clone()),
                _ => {
                    slot.take();
                    None
                }
            }
        };

        // connect outside the lock so calls fail fast meanwhile
        let conn = match existing {
            Some(conn) => conn,
            None => match self.connect().await {
                Ok(conn) => {
                    tracing::info!(source = %self.source_id, "websocket connected");
                    *self.connection.lock().await = Some(conn.clone());
                    conn
                }
                Err(e) => return HealthResult::failed(e.to_string(), started.elapsed()),
            },
        };

        match conn.ping(&self.source_id, self.timeouts.probe).await {
            Ok(()) => HealthResult::healthy(started.elapsed()),
            Err(e) => HealthResult::failed(e.to_string(), started.elapsed()),
        }
    }

    async fn rpc(&self, method: &str, params: Value, tool: Option<&str>) -> crate::Result<Value> {
        let conn = self.current().await?;
        let id = self.next_id();
        let result = bounded(
            &self.source_id,
            method,
            self.timeouts.call,
            conn.request(&self.source_id, id, method, params),
        )
        .await;
        if result.is_err() {
            conn.forget(id);
        }
        rpc_result(&self.source_id, tool, result?)
    }

    pub async fn list_tools(&self) -> crate::Result<Vec<ToolDescriptor>> {
        let result = self.rpc("tools/list", json!({}), None).await?;
        ToolDescriptor::list_from_wire(&self.source_id, &result)
    }

    pub async fn call_tool(&self, name: &str, arguments: ToolArguments) -> crate::Result<ToolResult> {
        let params = json!({
            "name": name,
            "arguments": Value::Object(arguments.unwrap_or_default()),
        });
        self.rpc("tools/call", params, Some(name)).await
    }

    pub async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.close().await;
        }
    }
}
