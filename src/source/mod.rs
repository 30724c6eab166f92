//! Transport adapters for tool sources.
//!
//! One adapter per transport kind, selected by an exhaustive match on the
//! source's transport settings. Every adapter exposes the same three
//! operations: probe health, list tools, and call a tool.

pub mod bridge;
pub mod health;
pub mod http;
pub mod memory;
pub mod stdio;
pub mod websocket;

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::config::{GatewaySettings, TransportConfig};
use crate::error::GatewayError;
use crate::jsonrpc;
use crate::registry::SourceDescriptor;
use crate::tool::{ToolArguments, ToolDescriptor, ToolResult};

use self::bridge::{BridgeAdapter, BridgeCatalog};
use self::http::HttpAdapter;
use self::stdio::StdioAdapter;
use self::websocket::WebSocketAdapter;

/// Bounds applied to outbound adapter work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterTimeouts {
    /// Liveness checks.
    pub probe: Duration,
    /// `tools/list` and `tools/call`.
    pub call: Duration,
}

impl AdapterTimeouts {
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            probe: settings.probe_timeout(),
            call: settings.call_timeout(),
        }
    }
}

impl Default for AdapterTimeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(5),
            call: Duration::from_secs(30),
        }
    }
}

/// Outcome of a liveness check. Probes never return errors.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthResult {
    pub ok: bool,
    pub error: Option<String>,
    pub latency: Duration,
}

impl HealthResult {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            ok: true,
            error: None,
            latency,
        }
    }

    pub fn failed(error: impl Into<String>, latency: Duration) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            latency,
        }
    }
}

/// Adapter for one registered source.
pub enum SourceAdapter {
    Stdio(StdioAdapter),
    Http(HttpAdapter),
    WebSocket(WebSocketAdapter),
    Bridge(BridgeAdapter),
}

impl SourceAdapter {
    /// Build the adapter for `descriptor`. Performs no I/O.
    pub fn for_source(
        descriptor: &SourceDescriptor,
        bridges: &BridgeCatalog,
        timeouts: AdapterTimeouts,
    ) -> crate::Result<Self> {
        let id = descriptor.id.clone();
        Ok(match &descriptor.transport {
            TransportConfig::Stdio(settings) => {
                SourceAdapter::Stdio(StdioAdapter::new(id, settings.clone(), timeouts))
            }
            TransportConfig::Http(settings) => {
                SourceAdapter::Http(HttpAdapter::new(id, settings.clone(), timeouts)?)
            }
            TransportConfig::Websocket(settings) => {
                SourceAdapter::WebSocket(WebSocketAdapter::new(id, settings.clone(), timeouts))
            }
            TransportConfig::BridgeInternal(settings) => {
                let bridge = bridges.get(&settings.bridge).ok_or_else(|| {
                    GatewayError::InvalidConfig(
                        id.clone(),
                        format!("no internal bridge named '{}' is registered", settings.bridge),
                    )
                })?;
                SourceAdapter::Bridge(BridgeAdapter::new(id, bridge, timeouts))
            }
        })
    }

    pub fn source_id(&self) -> &str {
        match self {
            SourceAdapter::Stdio(a) => a.source_id(),
            SourceAdapter::Http(a) => a.source_id(),
            SourceAdapter::WebSocket(a) => a.source_id(),
            SourceAdapter::Bridge(a) => a.source_id(),
        }
    }

    /// Cheapest liveness check for the transport; reconnects persistent
    /// transports whose connection is gone.
    pub async fn probe_health(&self) -> HealthResult {
        match self {
            SourceAdapter::Stdio(a) => a.probe_health().await,
            SourceAdapter::Http(a) => a.probe_health().await,
            SourceAdapter::WebSocket(a) => a.probe_health().await,
            SourceAdapter::Bridge(a) => a.probe_health().await,
        }
    }

    pub async fn list_tools(&self) -> crate::Result<Vec<ToolDescriptor>> {
        match self {
            SourceAdapter::Stdio(a) => a.list_tools().await,
            SourceAdapter::Http(a) => a.list_tools().await,
            SourceAdapter::WebSocket(a) => a.list_tools().await,
            SourceAdapter::Bridge(a) => a.list_tools().await,
        }
    }

    /// Invoke `name` with opaque `arguments`.
    pub async fn call_tool(&self, name: &str, arguments: ToolArguments) -> crate::Result<ToolResult> {
        match self {
            SourceAdapter::Stdio(a) => a.call_tool(name, arguments).await,
            SourceAdapter::Http(a) => a.call_tool(name, arguments).await,
            SourceAdapter::WebSocket(a) => a.call_tool(name, arguments).await,
            SourceAdapter::Bridge(a) => a.call_tool(name, arguments).await,
        }
    }

    /// Release persistent connections. HTTP and bridge adapters hold none.
    pub async fn close(&self) {
        match self {
            SourceAdapter::Stdio(a) => a.close().await,
            SourceAdapter::WebSocket(a) => a.close().await,
            SourceAdapter::Http(_) | SourceAdapter::Bridge(_) => {}
        }
    }
}

/// Run `fut` under `limit`; an elapsed timer becomes `SourceUnavailable`.
pub(crate) async fn bounded<T>(
    source_id: &str,
    what: &str,
    limit: Duration,
    fut: impl Future<Output = crate::Result<T>>,
) -> crate::Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_elapsed) => Err(GatewayError::SourceUnavailable(
            source_id.to_string(),
            format!("{} timed out after {}ms", what, limit.as_millis()),
        )),
    }
}

/// Map an upstream JSON-RPC error object onto the error taxonomy.
///
/// Unknown-tool answers become `ToolNotFound`; everything else is a
/// tool-level `UpstreamError` carrying the original object.
pub(crate) fn classify_rpc_error(source_id: &str, tool: Option<&str>, error: &Value) -> GatewayError {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(jsonrpc::INTERNAL_ERROR);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("upstream error")
        .to_string();

    if let Some(tool) = tool {
        let lower = message.to_ascii_lowercase();
        let mentions_missing_tool = lower.contains("unknown tool") || lower.contains("tool not found");
        if code == jsonrpc::TOOL_NOT_FOUND
            || ((code == jsonrpc::METHOD_NOT_FOUND || code == jsonrpc::INVALID_PARAMS) && mentions_missing_tool)
        {
            return GatewayError::ToolNotFound(tool.to_string());
        }
    }

    GatewayError::UpstreamError {
        source_id: source_id.to_string(),
        message,
        payload: error.clone(),
    }
}

/// Extract `result` from an upstream JSON-RPC response envelope.
pub(crate) fn rpc_result(source_id: &str, tool: Option<&str>, response: Value) -> crate::Result<Value> {
    if let Some(error) = response.get("error") {
        return Err(classify_rpc_error(source_id, tool, error));
    }
    match response {
        Value::Object(mut obj) => obj.remove("result").ok_or_else(|| {
            GatewayError::ProtocolMismatch(source_id.to_string(), "response has neither result nor error".into())
        }),
        _ => Err(GatewayError::ProtocolMismatch(
            source_id.to_string(),
            "response is not a JSON object".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeSettings, TransportConfig};
    use serde_json::json;

    #[test]
    fn test_classify_tool_not_found_code() {
        let err = classify_rpc_error("aux", Some("x"), &json!({"code": -32002, "message": "nope"}));
        assert!(matches!(err, GatewayError::ToolNotFound(name) if name == "x"));
    }

    #[test]
    fn test_classify_unknown_tool_message() {
        let err = classify_rpc_error(
            "aux",
            Some("x"),
            &json!({"code": -32602, "message": "Unknown tool: x"}),
        );
        assert!(matches!(err, GatewayError::ToolNotFound(_)));
    }

    #[test]
    fn test_classify_other_errors_are_upstream() {
        let payload = json!({"code": -32000, "message": "rate limited", "data": {"retry": 5}});
        let err = classify_rpc_error("aux", Some("x"), &payload);
        match err {
            GatewayError::UpstreamError { source_id, message, payload: p } => {
                assert_eq!(source_id, "aux");
                assert_eq!(message, "rate limited");
                assert_eq!(p, payload);
            }
            other => panic!("expected UpstreamError, got {:?}", other),
        }
    }

    #[test]
    fn test_rpc_result_extracts_result() {
        let result = rpc_result("aux", None, json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}}));
        assert_eq!(result.unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_rpc_result_missing_both() {
        let result = rpc_result("aux", None, json!({"jsonrpc": "2.0", "id": 1}));
        assert!(matches!(result, Err(GatewayError::ProtocolMismatch(_, _))));
    }

    #[tokio::test]
    async fn test_bounded_times_out_as_unavailable() {
        let result: crate::Result<()> = bounded("slow", "tools/list", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(
            matches!(result, Err(GatewayError::SourceUnavailable(id, msg)) if id == "slow" && msg.contains("timed out"))
        );
    }

    #[test]
    fn test_unknown_bridge_rejected() {
        let descriptor = SourceDescriptor {
            id: "memory".into(),
            display_name: "memory".into(),
            transport: TransportConfig::BridgeInternal(BridgeSettings {
                bridge: "nope".into(),
            }),
            categories: Default::default(),
            tool_count_hint: None,
        };
        let result = SourceAdapter::for_source(&descriptor, &BridgeCatalog::new(), AdapterTimeouts::default());
        assert!(matches!(result, Err(GatewayError::InvalidConfig(id, msg)) if id == "memory" && msg.contains("nope")));
    }
}
