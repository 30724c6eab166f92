//! Built-in `memory` bridge: a thin client for the memory service REST API.
//!
//! The memory service is opaque to the gateway; this bridge only maps four
//! tools onto its endpoints and forwards arguments as request bodies or query
//! strings. Auth is the service's own `X-API-Key`.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Method, StatusCode, Url};
use serde_json::{Value, json};

use crate::config::MemoryBridgeConfig;
use crate::error::GatewayError;
use crate::source::bridge::{BridgeError, BridgeTool, InternalBridge};
use crate::tool::{ToolArguments, ToolResult, text_result};

pub struct MemoryBridge {
    base_url: Url,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl MemoryBridge {
    pub fn new(config: &MemoryBridgeConfig) -> crate::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| GatewayError::InvalidConfig("bridges.memory".into(), e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidConfig(
                "bridges.memory".into(),
                format!("'{}' cannot be used as a base URL", config.base_url),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GatewayError::InvalidConfig("bridges.memory".into(), e.to_string()))?;
        Ok(Self {
            base_url,
            api_key: config.api_key.clone(),
            client,
        })
    }

    /// `{base}/api/v1/memory[/extra...]`, with each segment percent-encoded.
    fn endpoint(&self, extra: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["api", "v1", "memory"]).extend(extra);
        }
        url
    }

    async fn send(&self, method: Method, url: Url, body: Option<Value>) -> Result<ToolResult, BridgeError> {
        let mut request = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::Unavailable(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BridgeError::Unavailable(e.to_string()))?;
        let parsed: Option<Value> = serde_json::from_str(&text).ok();

        if status.is_success() {
            let rendered = match &parsed {
                Some(value) => serde_json::to_string_pretty(value).unwrap_or(text),
                None => text,
            };
            return Ok(text_result(rendered));
        }

        if status == StatusCode::BAD_GATEWAY || status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(BridgeError::Unavailable(format!("memory service returned {}", status)));
        }
        Err(BridgeError::ToolFailed {
            message: format!("memory service returned {}", status),
            payload: json!({
                "status": status.as_u16(),
                "body": parsed.unwrap_or(Value::String(text)),
            }),
        })
    }
}

fn arguments_object(arguments: ToolArguments) -> Value {
    Value::Object(arguments.unwrap_or_default())
}

fn required_str<'a>(arguments: &'a ToolArguments, key: &str) -> Result<&'a str, BridgeError> {
    arguments
        .as_ref()
        .and_then(|args| args.get(key))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BridgeError::ToolFailed {
            message: format!("missing required argument '{}'", key),
            payload: json!({"argument": key}),
        })
}

impl InternalBridge for MemoryBridge {
    fn tools(&self) -> Vec<BridgeTool> {
        vec![
            BridgeTool {
                name: "memory_search".into(),
                description: "Semantic search over stored memories".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "limit": {"type": "integer", "minimum": 1},
                        "threshold": {"type": "number"}
                    },
                    "required": ["query"]
                }),
            },
            BridgeTool {
                name: "memory_create".into(),
                description: "Store a new memory".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "title": {"type": "string"},
                        "content": {"type": "string"},
                        "memory_type": {"type": "string"},
                        "tags": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["title", "content"]
                }),
            },
            BridgeTool {
                name: "memory_get".into(),
                description: "Fetch one memory by id".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"id": {"type": "string"}},
                    "required": ["id"]
                }),
            },
            BridgeTool {
                name: "memory_list".into(),
                description: "List stored memories, paginated".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "limit": {"type": "integer", "minimum": 1},
                        "page": {"type": "integer", "minimum": 1}
                    }
                }),
            },
        ]
    }

    fn call<'a>(
        &'a self,
        name: &'a str,
        arguments: ToolArguments,
    ) -> BoxFuture<'a, Result<ToolResult, BridgeError>> {
        Box::pin(async move {
            match name {
                "memory_search" => {
                    let url = self.endpoint(&["search"]);
                    self.send(Method::POST, url, Some(arguments_object(arguments))).await
                }
                "memory_create" => {
                    let url = self.endpoint(&[]);
                    self.send(Method::POST, url, Some(arguments_object(arguments))).await
                }
                "memory_get" => {
                    let id = required_str(&arguments, "id")?;
                    let url = self.endpoint(&[id]);
                    self.send(Method::GET, url, None).await
                }
                "memory_list" => {
                    let mut url = self.endpoint(&[]);
                    if let Some(args) = &arguments {
                        let mut query = url.query_pairs_mut();
                        for key in ["limit", "page"] {
                            if let Some(value) = args.get(key) {
                                let rendered = match value {
                                    Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                };
                                query.append_pair(key, &rendered);
                            }
                        }
                    }
                    if url.query() == Some("") {
                        url.set_query(None);
                    }
                    self.send(Method::GET, url, None).await
                }
                other => Err(BridgeError::UnknownTool(other.to_string())),
            }
        })
    }
}
