//! HTTP front door of the gateway.
//!
//! `POST /mcp` carries MCP JSON-RPC; `/health` and `/admin/*` are plain JSON.
//! This is the only place where [`GatewayError`] becomes a JSON-RPC error
//! envelope. Dispatch runs behind a panic boundary.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION,
};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::FutureExt;
use serde_json::{Value, json};

use crate::config::AuthSettings;
use crate::error::GatewayError;
use crate::gateway::{GatewayInstance, OverallStatus};
use crate::jsonrpc::{self, JsonRpcResponse, NOTIFICATION_PREFIX};
use crate::tool::{ToolArguments, ToolDescriptor};

/// Protocol revision answered when the client does not name one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

/// Methods served on `/mcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMethod {
    Initialize,
    Ping,
    ToolsList,
    ToolsCall,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 4] = [
        RpcMethod::Initialize,
        RpcMethod::Ping,
        RpcMethod::ToolsList,
        RpcMethod::ToolsCall,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RpcMethod::Initialize => "initialize",
            RpcMethod::Ping => "ping",
            RpcMethod::ToolsList => "tools/list",
            RpcMethod::ToolsCall => "tools/call",
        }
    }

    pub fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.name() == name)
    }
}

/// Build the axum app for one gateway.
pub fn app(gateway: Arc<GatewayInstance>) -> Router {
    Router::new()
        .route("/mcp", post(handle_rpc))
        .route("/health", get(handle_health))
        .route("/admin/sources", get(admin_sources))
        .route("/admin/refresh", post(admin_refresh))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(middleware::from_fn(cors))
        .with_state(gateway)
}

/// Answer preflights and stamp CORS headers on every response.
async fn cors(request: Request, next: Next) -> Response {
    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else {
        next.run(request).await
    };
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-API-Key"),
    );
    response
}

enum KeyCheck {
    Granted,
    Denied,
    NotConfigured,
}

/// Key presented via `X-API-Key` or `Authorization: Bearer`.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

fn check_master_key(auth: &AuthSettings, headers: &HeaderMap) -> KeyCheck {
    let Some(expected) = auth.master_api_key.as_deref() else {
        return KeyCheck::NotConfigured;
    };
    match presented_key(headers) {
        Some(key) if key == expected => KeyCheck::Granted,
        _ => KeyCheck::Denied,
    }
}

fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response {
    (status, Json(body)).into_response()
}

fn rpc_response(status: StatusCode, response: JsonRpcResponse) -> Response {
    json_response(status, &response.to_value())
}

async fn handle_rpc(State(gateway): State<Arc<GatewayInstance>>, headers: HeaderMap, body: Bytes) -> Response {
    if gateway.auth().protect_rpc {
        let status = match check_master_key(gateway.auth(), &headers) {
            KeyCheck::Granted => None,
            KeyCheck::Denied => Some(StatusCode::UNAUTHORIZED),
            KeyCheck::NotConfigured => Some(StatusCode::SERVICE_UNAVAILABLE),
        };
        if let Some(status) = status {
            let id = serde_json::from_slice::<Value>(&body)
                .map(|v| jsonrpc::recover_id(&v))
                .unwrap_or(Value::Null);
            return rpc_response(
                status,
                JsonRpcResponse::error(id, jsonrpc::INVALID_REQUEST, "Unauthorized"),
            );
        }
    }

    let request = match jsonrpc::parse_request(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e.message, "rejecting malformed request");
            let err = GatewayError::ParseError(e.message);
            return rpc_response(StatusCode::OK, JsonRpcResponse::from_error(e.id, &err));
        }
    };

    let notification = request.is_notification();
    let id = request.id.clone();
    let method = request.method.clone();
    let outcome = match AssertUnwindSafe(dispatch(&gateway, &request.method, request.params))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".into());
            tracing::error!(method = %method, panic = %detail, "dispatch panicked");
            Err(GatewayError::Internal(format!("dispatch panicked: {}", detail)))
        }
    };

    // notifications are processed like requests, but never answered
    if notification {
        match &outcome {
            Err(GatewayError::MethodNotFound(_)) if method.starts_with(NOTIFICATION_PREFIX) => {}
            Err(err) => log_failure(&method, err),
            Ok(_) => {}
        }
        tracing::debug!(method = %method, "notification handled");
        return StatusCode::ACCEPTED.into_response();
    }

    let response = match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(err) => {
            log_failure(&method, &err);
            JsonRpcResponse::from_error(id, &err)
        }
    };
    rpc_response(StatusCode::OK, response)
}

fn log_failure(method: &str, err: &GatewayError) {
    match err {
        GatewayError::Internal(detail) => tracing::error!(method = %method, error = %detail, "internal error"),
        GatewayError::SourceUnavailable(..) | GatewayError::ProtocolMismatch(..) => {
            tracing::warn!(method = %method, error = %err, "request failed")
        }
        _ => tracing::debug!(method = %method, error = %err, "request failed"),
    }
}

async fn dispatch(gateway: &GatewayInstance, method: &str, params: Value) -> crate::Result<Value> {
    let method = RpcMethod::lookup(method).ok_or_else(|| GatewayError::MethodNotFound(method.to_string()))?;
    match method {
        RpcMethod::Initialize => Ok(initialize_result(&params)),
        RpcMethod::Ping => Ok(json!({})),
        RpcMethod::ToolsList => {
            let index = gateway.router().snapshot().await;
            let tools: Vec<Value> = index.tools().iter().map(ToolDescriptor::to_wire).collect();
            Ok(json!({ "tools": tools }))
        }
        RpcMethod::ToolsCall => {
            let (name, arguments) = call_params(params)?;
            gateway.router().call_tool(&name, arguments).await
        }
    }
}

fn initialize_result(params: &Value) -> Value {
    let version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    json!({
        "protocolVersion": version,
        "capabilities": {"tools": {"listChanged": false}},
        "serverInfo": {"name": "toolgate", "version": env!("CARGO_PKG_VERSION")},
    })
}

/// `{name, arguments?}` from `tools/call` params.
fn call_params(params: Value) -> crate::Result<(String, ToolArguments)> {
    let Value::Object(mut obj) = params else {
        return Err(GatewayError::InvalidParams("params must be an object".into()));
    };
    let name = match obj.remove("name") {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => return Err(GatewayError::InvalidParams("'name' must be a non-empty string".into())),
    };
    let arguments = match obj.remove("arguments") {
        None | Some(Value::Null) => None,
        Some(Value::Object(args)) => Some(args),
        Some(_) => return Err(GatewayError::InvalidParams("'arguments' must be an object".into())),
    };
    Ok((name, arguments))
}

async fn handle_health(State(gateway): State<Arc<GatewayInstance>>) -> Response {
    let report = gateway.health_report().await;
    let status = match report.status {
        OverallStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
    };
    json_response(status, &report)
}

/// Gate for `/admin/*`; `Err` carries the rejection response.
fn require_admin(gateway: &GatewayInstance, headers: &HeaderMap) -> Result<(), Response> {
    match check_master_key(gateway.auth(), headers) {
        KeyCheck::Granted => Ok(()),
        KeyCheck::Denied => Err(json_response(
            StatusCode::UNAUTHORIZED,
            &json!({"error": "invalid or missing API key"}),
        )),
        KeyCheck::NotConfigured => Err(json_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({"error": "admin endpoints are disabled: no master API key configured"}),
        )),
    }
}

async fn admin_sources(State(gateway): State<Arc<GatewayInstance>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = require_admin(&gateway, &headers) {
        return rejection;
    }
    let sources = gateway.source_details().await;
    json_response(StatusCode::OK, &json!({ "sources": sources }))
}

async fn admin_refresh(State(gateway): State<Arc<GatewayInstance>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = require_admin(&gateway, &headers) {
        return rejection;
    }
    let count = gateway.router().refresh_index().await;
    tracing::info!(tool_count = count, "tool index refreshed by admin request");
    json_response(StatusCode::OK, &json!({ "tools": count }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::gateway::testing::{bridge_config, catalog};
    use crate::source::bridge::{BridgeCatalog, BridgeError, BridgeTool, InternalBridge};
    use axum::body::Body;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use axum::http::header::CONTENT_TYPE;
    use std::collections::HashSet;
    use tower::ServiceExt;

    async fn gateway_with(config: GatewayConfig, bridges: &BridgeCatalog) -> Arc<GatewayInstance> {
        let gateway = Arc::new(GatewayInstance::from_config(config, bridges).unwrap());
        gateway.initialize().await;
        gateway.listeners().set_primary(true);
        gateway
    }

    async fn echo_gateway() -> Arc<GatewayInstance> {
        gateway_with(bridge_config(&[("a", "first"), ("b", "second")]), &catalog()).await
    }

    fn post_mcp(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/mcp")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    async fn rpc(gateway: &Arc<GatewayInstance>, body: &str) -> Value {
        let (status, _, bytes) = send(app(gateway.clone()), post_mcp(body)).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_method_names_unique_and_resolvable() {
        let names: HashSet<&str> = RpcMethod::ALL.iter().map(|m| m.name()).collect();
        assert_eq!(names.len(), RpcMethod::ALL.len());
        for method in RpcMethod::ALL {
            assert_eq!(RpcMethod::lookup(method.name()), Some(method));
        }
        assert_eq!(RpcMethod::lookup("resources/list"), None);
    }

    #[tokio::test]
    async fn test_malformed_json_is_parse_error_with_null_id() {
        let gateway = echo_gateway().await;
        let response = rpc(&gateway, "{not json").await;
        assert_eq!(response["error"]["code"], jsonrpc::PARSE_ERROR);
        assert!(response["id"].is_null());
    }

    #[tokio::test]
    async fn test_bad_envelope_keeps_recovered_id() {
        let gateway = echo_gateway().await;
        let response = rpc(&gateway, r#"{"jsonrpc":"1.0","id":9,"method":"ping"}"#).await;
        assert_eq!(response["error"]["code"], jsonrpc::PARSE_ERROR);
        assert_eq!(response["id"], 9);
    }

    #[tokio::test]
    async fn test_unknown_tool_envelope() {
        let gateway = echo_gateway().await;
        let response = rpc(
            &gateway,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"ping","arguments":{}}}"#,
        )
        .await;
        assert_eq!(response["id"], 1);
        assert_eq!(response["error"]["code"], jsonrpc::TOOL_NOT_FOUND);
        assert!(response["error"]["message"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_tools_list_and_call_through_router() {
        let gateway = echo_gateway().await;
        let list = rpc(&gateway, r#"{"jsonrpc":"2.0","id":"l","method":"tools/list"}"#).await;
        let names: Vec<&str> = list["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["echo", "sum"]);
        assert!(list["result"]["tools"][0]["inputSchema"].is_object());

        let call = rpc(
            &gateway,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"text":"hi"}}}"#,
        )
        .await;
        assert_eq!(call["result"]["arguments"]["text"], "hi");
    }

    #[tokio::test]
    async fn test_method_not_found_and_invalid_params() {
        let gateway = echo_gateway().await;
        let response = rpc(&gateway, r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#).await;
        assert_eq!(response["error"]["code"], jsonrpc::METHOD_NOT_FOUND);

        let response = rpc(
            &gateway,
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"arguments":{}}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], jsonrpc::INVALID_PARAMS);

        let response = rpc(
            &gateway,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"echo","arguments":[1]}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], jsonrpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_initialize_echoes_protocol_version() {
        let gateway = echo_gateway().await;
        let response = rpc(
            &gateway,
            r#"{"jsonrpc":"2.0","id":0,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#,
        )
        .await;
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(response["result"]["serverInfo"]["name"], "toolgate");
        assert!(response["result"]["capabilities"]["tools"].is_object());

        let ping = rpc(&gateway, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;
        assert_eq!(ping["result"], json!({}));
    }

    #[tokio::test]
    async fn test_notification_is_accepted_without_body() {
        let gateway = echo_gateway().await;
        let (status, _, body) = send(
            app(gateway),
            post_mcp(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.is_empty());
    }

    /// Counts calls to its single `log` tool.
    #[derive(Default)]
    struct CountingBridge {
        calls: AtomicUsize,
    }

    impl InternalBridge for CountingBridge {
        fn tools(&self) -> Vec<BridgeTool> {
            vec![BridgeTool {
                name: "log".into(),
                description: "records a call".into(),
                input_schema: json!({"type": "object"}),
            }]
        }

        fn call<'a>(
            &'a self,
            _name: &'a str,
            _arguments: ToolArguments,
        ) -> BoxFuture<'a, Result<Value, BridgeError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(json!({"content": [], "isError": false})) })
        }
    }

    #[tokio::test]
    async fn test_notification_call_is_dispatched() {
        let counter = Arc::new(CountingBridge::default());
        let mut bridges = BridgeCatalog::new();
        bridges.register("counting", counter.clone()).unwrap();
        let gateway = gateway_with(bridge_config(&[("a", "counting")]), &bridges).await;

        let (status, _, body) = send(
            app(gateway.clone()),
            post_mcp(r#"{"jsonrpc":"2.0","method":"tools/call","params":{"name":"log","arguments":{}}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.is_empty());
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);

        // null id counts as a notification too; failures stay silent
        let (status, _, body) = send(
            app(gateway),
            post_mcp(r#"{"jsonrpc":"2.0","id":null,"method":"tools/call","params":{"name":"missing"}}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_options_preflight_on_any_path() {
        let gateway = echo_gateway().await;
        for uri in ["/mcp", "/anything"] {
            let request = Request::builder()
                .method(Method::OPTIONS)
                .uri(uri)
                .body(Body::empty())
                .unwrap();
            let (status, headers, _) = send(app(gateway.clone()), request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
            assert_eq!(headers[ACCESS_CONTROL_ALLOW_METHODS], "GET, POST, OPTIONS");
            assert_eq!(
                headers[ACCESS_CONTROL_ALLOW_HEADERS],
                "Content-Type, Authorization, X-API-Key"
            );
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let gateway = echo_gateway().await;
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, headers, body) = send(app(gateway), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let report: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["status"], "healthy");
        assert_eq!(report["sources"][0]["id"], "a");
        assert_eq!(report["sources"][0]["state"], "healthy");
        assert!(report["sources"][0]["lastCheckedAt"].is_u64());
        assert_eq!(report["listeners"]["primary"], true);
    }

    #[tokio::test]
    async fn test_health_unhealthy_is_503() {
        // never initialized: every source still unknown
        let gateway = Arc::new(
            GatewayInstance::from_config(bridge_config(&[("a", "first")]), &catalog()).unwrap(),
        );
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, _, body) = send(app(gateway), request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let report: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(report["status"], "unhealthy");
    }

    fn admin_request(method: Method, uri: &str, key: Option<(&str, &str)>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some((header, value)) = key {
            builder = builder.header(header, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn keyed_config(protect_rpc: bool) -> GatewayConfig {
        let mut config = bridge_config(&[("a", "first")]);
        config.auth.master_api_key = Some("master".into());
        config.auth.protect_rpc = protect_rpc;
        config
    }

    #[tokio::test]
    async fn test_admin_disabled_without_master_key() {
        let gateway = echo_gateway().await;
        let (status, _, _) = send(
            app(gateway),
            admin_request(Method::GET, "/admin/sources", Some(("x-api-key", "anything"))),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_admin_requires_master_key() {
        let gateway = gateway_with(keyed_config(false), &catalog()).await;

        let (status, _, _) = send(app(gateway.clone()), admin_request(Method::GET, "/admin/sources", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, _) = send(
            app(gateway.clone()),
            admin_request(Method::GET, "/admin/sources", Some(("x-api-key", "wrong"))),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _, body) = send(
            app(gateway.clone()),
            admin_request(Method::GET, "/admin/sources", Some(("x-api-key", "master"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["sources"][0]["id"], "a");
        assert_eq!(body["sources"][0]["health"]["state"], "healthy");

        let (status, _, body) = send(
            app(gateway),
            admin_request(Method::POST, "/admin/refresh", Some(("authorization", "Bearer master"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["tools"], 1);
    }

    #[tokio::test]
    async fn test_protected_rpc_rejects_missing_key() {
        let gateway = gateway_with(keyed_config(true), &catalog()).await;
        let (status, _, body) = send(
            app(gateway.clone()),
            post_mcp(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["code"], jsonrpc::INVALID_REQUEST);
        assert_eq!(body["id"], 7);

        let mut request = post_mcp(r#"{"jsonrpc":"2.0","id":8,"method":"tools/list"}"#);
        request.headers_mut().insert("x-api-key", HeaderValue::from_static("master"));
        let (status, _, _) = send(app(gateway), request).await;
        assert_eq!(status, StatusCode::OK);
    }
}
