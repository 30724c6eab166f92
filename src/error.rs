//! Error types for gateway operations.

use serde_json::Value;
use thiserror::Error;

/// Main error type for gateway operations.
///
/// Adapters turn every transport or protocol failure into one of these kinds
/// before it crosses the router boundary; the front door is the only place
/// that maps them onto JSON-RPC error envelopes.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A source with the same id is already registered
    #[error("duplicate source id: {0}")]
    DuplicateSourceId(String),

    /// Invalid configuration for a named source or section
    #[error("invalid config for '{0}': {1}")]
    InvalidConfig(String, String),

    /// Request body or envelope could not be parsed
    #[error("parse error: {0}")]
    ParseError(String),

    /// JSON-RPC method is not supported
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Params of a known method have the wrong shape
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// No source owns the named tool
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The adapter could not reach its backend (includes timeouts)
    #[error("source '{0}' unavailable: {1}")]
    SourceUnavailable(String, String),

    /// The source answered, but not in a shape we understand
    #[error("protocol mismatch for source '{0}': {1}")]
    ProtocolMismatch(String, String),

    /// The source reported a tool-level failure; payload is passed through
    #[error("upstream error from source '{source_id}': {message}")]
    UpstreamError {
        source_id: String,
        message: String,
        payload: Value,
    },

    /// Unexpected failure; detail is logged, never sent to callers
    #[error("internal error: {0}")]
    Internal(String),

    /// A listener could not bind its address
    #[error("failed to bind {0}: {1}")]
    Bind(String, String),

    /// Neither the primary nor the fallback listener is serving
    #[error("all listeners are down")]
    AllListenersDown,
}

impl GatewayError {
    /// Id of the source this error is attributed to, if any.
    pub fn source_id(&self) -> Option<&str> {
        match self {
            GatewayError::SourceUnavailable(id, _) | GatewayError::ProtocolMismatch(id, _) => {
                Some(id)
            }
            GatewayError::UpstreamError { source_id, .. } => Some(source_id),
            _ => None,
        }
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
