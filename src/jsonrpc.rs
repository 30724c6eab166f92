//! JSON-RPC 2.0 envelopes and error codes shared by the front door, the
//! HTTP/WebSocket adapters, and the stdio bridge.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::GatewayError;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const SOURCE_UNAVAILABLE: i64 = -32001;
pub const TOOL_NOT_FOUND: i64 = -32002;
pub const UPSTREAM_ERROR: i64 = -32003;
pub const PROTOCOL_MISMATCH: i64 = -32004;

/// Notification methods live under this prefix and never get a response.
pub const NOTIFICATION_PREFIX: &str = "notifications/";

/// A validated inbound request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    /// `Value::Null` for notifications.
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_null()
    }
}

/// Why an inbound body could not become a [`JsonRpcRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeError {
    /// Request id, when it could be recovered from the body.
    pub id: Value,
    pub message: String,
}

/// Parse and validate one request body.
///
/// Invalid JSON and malformed envelopes both surface as parse errors; when
/// the body is JSON with a usable `id`, that id is carried on the error.
pub fn parse_request(body: &[u8]) -> Result<JsonRpcRequest, EnvelopeError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| EnvelopeError {
        id: Value::Null,
        message: format!("invalid JSON: {}", e),
    })?;
    parse_request_value(value)
}

/// Validate an already-decoded envelope.
pub fn parse_request_value(value: Value) -> Result<JsonRpcRequest, EnvelopeError> {
    let Value::Object(mut obj) = value else {
        return Err(EnvelopeError {
            id: Value::Null,
            message: "request must be a JSON object".into(),
        });
    };

    let id = match obj.remove("id") {
        None | Some(Value::Null) => Value::Null,
        Some(id @ (Value::String(_) | Value::Number(_))) => id,
        Some(_) => {
            return Err(EnvelopeError {
                id: Value::Null,
                message: "'id' must be a string, number, or null".into(),
            });
        }
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(EnvelopeError {
            id,
            message: "'jsonrpc' must equal \"2.0\"".into(),
        });
    }

    let method = match obj.remove("method") {
        Some(Value::String(m)) if !m.is_empty() => m,
        _ => {
            return Err(EnvelopeError {
                id,
                message: "'method' must be a non-empty string".into(),
            });
        }
    };

    Ok(JsonRpcRequest {
        id,
        method,
        params: obj.remove("params").unwrap_or(Value::Null),
    })
}

/// Recover the `id` from a raw JSON value, if it is a usable id.
pub fn recover_id(value: &Value) -> Value {
    match value.get("id") {
        Some(id @ (Value::String(_) | Value::Number(_))) => id.clone(),
        _ => Value::Null,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.data = Some(data);
        }
        self
    }

    /// Translate a domain error into an error envelope.
    ///
    /// Internal errors are reduced to a generic message; their detail is
    /// expected to have been logged by the caller.
    pub fn from_error(id: Value, err: &GatewayError) -> Self {
        match err {
            GatewayError::ParseError(msg) => Self::error(id, PARSE_ERROR, format!("Parse error: {}", msg)),
            GatewayError::MethodNotFound(method) => {
                Self::error(id, METHOD_NOT_FOUND, format!("Method not found: {}", method))
            }
            GatewayError::InvalidParams(msg) => {
                Self::error(id, INVALID_PARAMS, format!("Invalid params: {}", msg))
            }
            GatewayError::ToolNotFound(name) => {
                Self::error(id, TOOL_NOT_FOUND, format!("Tool not found: {}", name))
            }
            GatewayError::SourceUnavailable(..) => Self::error(id, SOURCE_UNAVAILABLE, err.to_string()),
            GatewayError::ProtocolMismatch(..) => Self::error(id, PROTOCOL_MISMATCH, err.to_string()),
            GatewayError::UpstreamError { payload, .. } => {
                Self::error(id, UPSTREAM_ERROR, err.to_string()).with_data(payload.clone())
            }
            _ => Self::error(id, INTERNAL_ERROR, "Internal error"),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            json!({"jsonrpc": "2.0", "id": null, "error": {"code": INTERNAL_ERROR, "message": "Internal error"}})
        })
    }
}

/// Build an outbound request envelope.
pub fn request(id: impl Into<Value>, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id.into(), "method": method, "params": params})
}

/// Build an outbound notification envelope.
pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}
