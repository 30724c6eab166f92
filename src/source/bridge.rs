//! In-process tool sources (`bridge-internal` transport).
//!
//! An [`InternalBridge`] is a trait object living in the gateway process,
//! typically a thin client for an internal service such as the memory API.
//! Bridges are looked up by identifier in a [`BridgeCatalog`] when adapters
//! are built; an unknown identifier fails startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::config::BridgesConfig;
use crate::error::GatewayError;
use crate::source::memory::MemoryBridge;
use crate::source::{AdapterTimeouts, HealthResult, bounded};
use crate::tool::{ToolArguments, ToolDescriptor, ToolResult};

/// A tool offered by an internal bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Failure reported by an internal bridge.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// The backend behind the bridge could not be reached
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with a tool-level failure
    #[error("{message}")]
    ToolFailed { message: String, payload: Value },

    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// An in-process tool provider.
pub trait InternalBridge: Send + Sync {
    fn tools(&self) -> Vec<BridgeTool>;

    fn call<'a>(
        &'a self,
        name: &'a str,
        arguments: ToolArguments,
    ) -> BoxFuture<'a, Result<ToolResult, BridgeError>>;
}

/// Bridge identifier → bridge implementation.
#[derive(Clone, Default)]
pub struct BridgeCatalog {
    bridges: HashMap<String, Arc<dyn InternalBridge>>,
}

impl std::fmt::Debug for BridgeCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeCatalog")
            .field("bridges", &self.names())
            .finish()
    }
}

impl BridgeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the built-in bridges enabled in config.
    pub fn from_config(config: &BridgesConfig) -> crate::Result<Self> {
        let mut catalog = Self::new();
        if let Some(memory) = &config.memory {
            catalog.register("memory", Arc::new(MemoryBridge::new(memory)?))?;
        }
        Ok(catalog)
    }

    pub fn register(&mut self, name: impl Into<String>, bridge: Arc<dyn InternalBridge>) -> crate::Result<()> {
        let name = name.into();
        if self.bridges.contains_key(&name) {
            return Err(GatewayError::InvalidConfig(
                format!("bridges.{}", name),
                "bridge registered twice".into(),
            ));
        }
        self.bridges.insert(name, bridge);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InternalBridge>> {
        self.bridges.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bridges.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Adapter over an in-process bridge.
pub struct BridgeAdapter {
    source_id: String,
    bridge: Arc<dyn InternalBridge>,
    timeouts: AdapterTimeouts,
}

impl BridgeAdapter {
    pub fn new(source_id: String, bridge: Arc<dyn InternalBridge>, timeouts: AdapterTimeouts) -> Self {
        Self {
            source_id,
            bridge,
            timeouts,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Bridges live in-process; there is nothing to check.
    pub async fn probe_health(&self) -> HealthResult {
        HealthResult::healthy(Duration::ZERO)
    }

    pub async fn list_tools(&self) -> crate::Result<Vec<ToolDescriptor>> {
        Ok(self
            .bridge
            .tools()
            .into_iter()
            .map(|tool| ToolDescriptor {
                upstream_name: tool.name.clone(),
                name: tool.name,
                source_id: self.source_id.clone(),
                description: Some(tool.description),
                input_schema: tool.input_schema,
            })
            .collect())
    }

    pub async fn call_tool(&self, name: &str, arguments: ToolArguments) -> crate::Result<ToolResult> {
        if !self.bridge.tools().iter().any(|t| t.name == name) {
            return Err(GatewayError::ToolNotFound(name.to_string()));
        }
        bounded(&self.source_id, "tools/call", self.timeouts.call, async {
            self.bridge
                .call(name, arguments)
                .await
                .map_err(|e| self.map_error(name, e))
        })
        .await
    }

    fn map_error(&self, name: &str, err: BridgeError) -> GatewayError {
        match err {
            BridgeError::Unavailable(reason) => GatewayError::SourceUnavailable(self.source_id.clone(), reason),
            BridgeError::ToolFailed { message, payload } => GatewayError::UpstreamError {
                source_id: self.source_id.clone(),
                message,
                payload,
            },
            BridgeError::UnknownTool(_) => GatewayError::ToolNotFound(name.to_string()),
        }
    }
}
