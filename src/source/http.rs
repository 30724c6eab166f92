//! HTTP transport adapter.
//!
//! Each operation is one stateless request: liveness is a `GET` on the
//! source's health path, tool traffic is a JSON-RPC `POST` on its RPC path.
//! Streamable-HTTP servers that answer with an SSE frame are accepted too.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::{Value, json};

use crate::config::HttpSettings;
use crate::error::GatewayError;
use crate::jsonrpc;
use crate::source::{AdapterTimeouts, HealthResult, bounded, rpc_result};
use crate::tool::{ToolArguments, ToolDescriptor, ToolResult};

/// Upper bound on `nextCursor` pages followed during one listing.
const MAX_LIST_PAGES: usize = 100;

pub struct HttpAdapter {
    source_id: String,
    settings: HttpSettings,
    timeouts: AdapterTimeouts,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpAdapter {
    pub fn new(source_id: String, settings: HttpSettings, timeouts: AdapterTimeouts) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::InvalidConfig(source_id.clone(), e.to_string()))?;
        Ok(Self {
            source_id,
            settings,
            timeouts,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self.settings.url.trim_end_matches('/');
        if path.is_empty() {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.api_key {
            Some(key) => request.header("X-API-Key", key),
            None => request,
        }
    }

    pub async fn probe_health(&self) -> HealthResult {
        let started = Instant::now();
        let request = self
            .authorize(self.client.get(self.endpoint(&self.settings.health_path)))
            .timeout(self.timeouts.probe);
        match request.send().await {
            Ok(response) if response.status().is_success() => HealthResult::healthy(started.elapsed()),
            Ok(response) => HealthResult::failed(format!("HTTP {}", response.status()), started.elapsed()),
            Err(e) if e.is_timeout() => HealthResult::failed(
                format!("health check timed out after {}ms", self.timeouts.probe.as_millis()),
                started.elapsed(),
            ),
            Err(e) => HealthResult::failed(e.to_string(), started.elapsed()),
        }
    }

    /// POST one JSON-RPC request and return the response envelope.
    async fn rpc(&self, method: &str, params: Value) -> crate::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = jsonrpc::request(id, method, params);

        let response = self
            .authorize(self.client.post(self.endpoint(&self.settings.rpc_path)))
            .header(ACCEPT, "application/json, text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::SourceUnavailable(self.source_id.clone(), e.to_string()))?;

        let status = response.status();
        let is_sse = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::SourceUnavailable(self.source_id.clone(), e.to_string()))?;

        let parsed = if is_sse {
            sse_payload(&text)
        } else {
            serde_json::from_str::<Value>(&text).ok()
        };

        match parsed {
            Some(envelope) => Ok(envelope),
            None if !status.is_success() => Err(GatewayError::SourceUnavailable(
                self.source_id.clone(),
                format!("HTTP {}", status),
            )),
            None => Err(GatewayError::ProtocolMismatch(
                self.source_id.clone(),
                format!("{} response is not JSON-RPC", method),
            )),
        }
    }

    pub async fn list_tools(&self) -> crate::Result<Vec<ToolDescriptor>> {
        bounded(&self.source_id, "tools/list", self.timeouts.call, async {
            let mut tools = Vec::new();
            let mut cursor: Option<String> = None;
            for _ in 0..MAX_LIST_PAGES {
                let params = match &cursor {
                    Some(c) => json!({"cursor": c}),
                    None => json!({}),
                };
                let result = rpc_result(&self.source_id, None, self.rpc("tools/list", params).await?)?;
                tools.extend(ToolDescriptor::list_from_wire(&self.source_id, &result)?);

                cursor = result
                    .get("nextCursor")
                    .and_then(Value::as_str)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string);
                if cursor.is_none() {
                    return Ok(tools);
                }
            }
            tracing::warn!(source = %self.source_id, pages = MAX_LIST_PAGES, "tools/list pagination truncated");
            Ok(tools)
        })
        .await
    }

    pub async fn call_tool(&self, name: &str, arguments: ToolArguments) -> crate::Result<ToolResult> {
        bounded(&self.source_id, "tools/call", self.timeouts.call, async {
            let params = json!({
                "name": name,
                "arguments": Value::Object(arguments.unwrap_or_default()),
            });
            let response = self.rpc("tools/call", params).await?;
            rpc_result(&self.source_id, Some(name), response)
        })
        .await
    }
}

/// Last JSON `data:` payload of an SSE body.
fn sse_payload(body: &str) -> Option<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .last()
}
