//! SourceRegistry: the ordered catalog of known tool sources.
//!
//! Pure in-memory lookup. Registration order is significant: it decides which
//! source keeps a tool name under the first-wins collision policy.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::{SourceConfig, TransportConfig, TransportKind};
use crate::error::GatewayError;

/// Immutable description of one tool source.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceDescriptor {
    pub id: String,
    pub display_name: String,
    pub transport: TransportConfig,
    pub categories: BTreeSet<String>,
    pub tool_count_hint: Option<u32>,
}

impl SourceDescriptor {
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// URL, command line, or bridge identifier, for logs and admin output.
    pub fn address(&self) -> String {
        match &self.transport {
            TransportConfig::Stdio(stdio) if stdio.args.is_empty() => stdio.command.clone(),
            TransportConfig::Stdio(stdio) => format!("{} {}", stdio.command, stdio.args.join(" ")),
            TransportConfig::Http(http) => http.url.clone(),
            TransportConfig::Websocket(ws) => ws.url.clone(),
            TransportConfig::BridgeInternal(bridge) => format!("bridge:{}", bridge.bridge),
        }
    }
}

impl From<SourceConfig> for SourceDescriptor {
    fn from(config: SourceConfig) -> Self {
        Self {
            display_name: config.display_name.unwrap_or_else(|| config.id.clone()),
            id: config.id,
            transport: config.transport,
            categories: config.categories.into_iter().collect(),
            tool_count_hint: config.tool_count_hint,
        }
    }
}

/// Ordered catalog of source descriptors.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<SourceDescriptor>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source. Fails with `DuplicateSourceId` if the id is taken.
    pub fn register(&mut self, descriptor: SourceDescriptor) -> crate::Result<()> {
        if self.get(&descriptor.id).is_some() {
            return Err(GatewayError::DuplicateSourceId(descriptor.id));
        }
        tracing::debug!(
            source = %descriptor.id,
            transport = ?descriptor.kind(),
            address = %descriptor.address(),
            "registered source"
        );
        self.sources.push(descriptor);
        Ok(())
    }

    /// All descriptors in registration order.
    pub fn list(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    /// Descriptors tagged with `tag`, in registration order.
    pub fn filter_by_category(&self, tag: &str) -> Vec<&SourceDescriptor> {
        self.sources
            .iter()
            .filter(|s| s.categories.contains(tag))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&SourceDescriptor> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Registration index of `id`, used to order merges.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.sources.iter().position(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
