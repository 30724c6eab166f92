//! AggregatingRouter: one merged tool namespace over every source.
//!
//! The index is rebuilt from a per-source catalog cache and published as a
//! whole snapshot, so `tools/list` never observes a half-merged index. Calls
//! go to the owning source's adapter with the upstream tool name; outcomes
//! are reported to the supervisor as health signals.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{RwLock, mpsc};

use crate::config::CollisionPolicy;
use crate::error::GatewayError;
use crate::namespace::{namespace_tool, unnamespace_tool_name};
use crate::source::SourceAdapter;
use crate::source::health::{HealthBoard, HealthState};
use crate::tool::{ToolArguments, ToolDescriptor, ToolResult};

/// Call outcome forwarded to the supervisor's health state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    /// The source answered (including tool-level failures).
    Reachable(String),
    /// The source could not be reached or timed out.
    Unreachable { source_id: String, reason: String },
}

/// Immutable merged view published by the router.
#[derive(Debug, Default)]
pub struct ToolIndex {
    tools: Vec<ToolDescriptor>,
    owners: HashMap<String, usize>,
    /// Last successful listing per source, in upstream form.
    by_source: HashMap<String, Vec<ToolDescriptor>>,
}

impl ToolIndex {
    /// Merge cached catalogs in registration `order` under `policy`.
    fn merge(order: &[String], by_source: HashMap<String, Vec<ToolDescriptor>>, policy: CollisionPolicy) -> Self {
        let mut tools: Vec<ToolDescriptor> = Vec::new();
        let mut owners: HashMap<String, usize> = HashMap::new();

        for source_id in order {
            let Some(catalog) = by_source.get(source_id) else {
                continue;
            };
            for tool in catalog {
                let tool = match policy {
                    CollisionPolicy::FirstWins => tool.clone(),
                    CollisionPolicy::Namespaced => namespace_tool(tool.clone()),
                };
                if let Some(&existing) = owners.get(&tool.name) {
                    tracing::warn!(
                        tool = %tool.name,
                        kept = %tools[existing].source_id,
                        dropped = %tool.source_id,
                        "tool name collision, keeping first registered source"
                    );
                    continue;
                }
                owners.insert(tool.name.clone(), tools.len());
                tools.push(tool);
            }
        }

        Self {
            tools,
            owners,
            by_source,
        }
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn owner(&self, name: &str) -> Option<&ToolDescriptor> {
        self.owners.get(name).map(|&i| &self.tools[i])
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

pub struct AggregatingRouter {
    /// Source ids in registration order.
    order: Vec<String>,
    adapters: HashMap<String, Arc<SourceAdapter>>,
    health: Arc<HealthBoard>,
    policy: CollisionPolicy,
    index: RwLock<Arc<ToolIndex>>,
    signals: Option<mpsc::Sender<HealthSignal>>,
}

impl AggregatingRouter {
    /// `adapters` must be in registration order.
    pub fn new(adapters: Vec<Arc<SourceAdapter>>, health: Arc<HealthBoard>, policy: CollisionPolicy) -> Self {
        let order = adapters.iter().map(|a| a.source_id().to_string()).collect();
        let adapters = adapters
            .into_iter()
            .map(|a| (a.source_id().to_string(), a))
            .collect();
        Self {
            order,
            adapters,
            health,
            policy,
            index: RwLock::new(Arc::new(ToolIndex::default())),
            signals: None,
        }
    }

    /// Report call outcomes on `tx`.
    pub fn with_signals(mut self, tx: mpsc::Sender<HealthSignal>) -> Self {
        self.signals = Some(tx);
        self
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Re-list every source that is not unreachable and publish a new index.
    ///
    /// Returns the number of tools in the published index.
    pub async fn refresh_index(&self) -> usize {
        let health = self.health.snapshot().await;
        let is_down = |id: &str| health.get(id).is_some_and(|h| h.state == HealthState::Unreachable);

        let live: Vec<&Arc<SourceAdapter>> = self
            .order
            .iter()
            .filter(|id| !is_down(id.as_str()))
            .filter_map(|id| self.adapters.get(id))
            .collect();

        let listings = join_all(live.into_iter().map(|adapter| async move {
            (adapter.source_id().to_string(), adapter.list_tools().await)
        }))
        .await;

        let mut guard = self.index.write().await;
        // a source may have been demoted while the listings were in flight
        let health = self.health.snapshot().await;
        let is_down = |id: &str| health.get(id).is_some_and(|h| h.state == HealthState::Unreachable);
        let mut cache = guard.by_source.clone();
        cache.retain(|id, _| !is_down(id.as_str()));
        for (source_id, listing) in listings {
            if is_down(source_id.as_str()) {
                tracing::debug!(source = %source_id, "source went unreachable during refresh, dropping listing");
                continue;
            }
            match listing {
                Ok(tools) => {
                    tracing::debug!(source = %source_id, tool_count = tools.len(), "source listed");
                    cache.insert(source_id, tools);
                }
                Err(e) => {
                    tracing::warn!(source = %source_id, error = %e, "tools/list failed, keeping cached catalog");
                }
            }
        }

        let next = ToolIndex::merge(&self.order, cache, self.policy);
        let count = next.len();
        *guard = Arc::new(next);
        tracing::info!(tool_count = count, "tool index rebuilt");
        count
    }

    /// Re-list one source (or drop it when unreachable) and re-merge.
    pub async fn refresh_source(&self, source_id: &str) -> crate::Result<usize> {
        let adapter = self
            .adapters
            .get(source_id)
            .ok_or_else(|| GatewayError::Internal(format!("no adapter for source '{}'", source_id)))?;

        let listing = match self.health.state(source_id).await {
            Some(HealthState::Unreachable) => None,
            _ => Some(adapter.list_tools().await),
        };

        let mut guard = self.index.write().await;
        let mut cache = guard.by_source.clone();
        match listing {
            None => {
                if cache.remove(source_id).is_some() {
                    tracing::info!(source = %source_id, "removed unreachable source from tool index");
                }
            }
            Some(Ok(tools)) => {
                cache.insert(source_id.to_string(), tools);
            }
            Some(Err(e)) => {
                tracing::warn!(source = %source_id, error = %e, "tools/list failed, keeping cached catalog");
            }
        }

        let next = ToolIndex::merge(&self.order, cache, self.policy);
        let count = next.len();
        *guard = Arc::new(next);
        Ok(count)
    }

    /// Current index snapshot.
    pub async fn snapshot(&self) -> Arc<ToolIndex> {
        self.index.read().await.clone()
    }

    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.snapshot().await.tools().to_vec()
    }

    /// Route a call to the tool's owner. No retry.
    pub async fn call_tool(&self, name: &str, arguments: ToolArguments) -> crate::Result<ToolResult> {
        let owner = self
            .snapshot()
            .await
            .owner(name)
            .map(|t| (t.source_id.clone(), t.upstream_name.clone()));

        let Some((source_id, upstream_name)) = owner else {
            return Err(GatewayError::ToolNotFound(self.describe_missing(name)));
        };

        let adapter = self
            .adapters
            .get(&source_id)
            .ok_or_else(|| GatewayError::Internal(format!("tool '{}' owned by unknown source '{}'", name, source_id)))?;

        let result = adapter.call_tool(&upstream_name, arguments).await;
        match &result {
            Ok(_) | Err(GatewayError::UpstreamError { .. }) => self.signal(HealthSignal::Reachable(source_id)),
            Err(GatewayError::SourceUnavailable(_, reason)) => {
                tracing::warn!(source = %source_id, tool = %name, error = %reason, "tool call failed");
                self.signal(HealthSignal::Unreachable {
                    source_id,
                    reason: reason.clone(),
                });
            }
            Err(_) => {}
        }
        result
    }

    /// Name reported for a missing tool; names an unknown source prefix in namespaced mode.
    fn describe_missing(&self, name: &str) -> String {
        match unnamespace_tool_name(name) {
            Some((prefix, _)) if self.policy == CollisionPolicy::Namespaced && !self.adapters.contains_key(prefix) => {
                format!("{} (no source '{}')", name, prefix)
            }
            _ => name.to_string(),
        }
    }

    fn signal(&self, signal: HealthSignal) {
        if let Some(tx) = &self.signals {
            // a full channel only delays health bookkeeping until the next probe
            if tx.try_send(signal).is_err() {
                tracing::debug!("health signal channel full or closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpSettings;
    use crate::source::AdapterTimeouts;
    use crate::source::bridge::testing::{FailingBridge, StaticBridge};
    use crate::source::bridge::{BridgeAdapter, BridgeError, BridgeTool, InternalBridge};
    use crate::source::health::Backoff;
    use crate::source::http::HttpAdapter;
    use std::collections::HashSet;
    use std::time::Duration;

    fn bridge(id: &str, bridge: Arc<dyn InternalBridge>) -> Arc<SourceAdapter> {
        Arc::new(SourceAdapter::Bridge(BridgeAdapter::new(
            id.to_string(),
            bridge,
            AdapterTimeouts::default(),
        )))
    }

    fn dead_http(id: &str) -> Arc<SourceAdapter> {
        let settings = HttpSettings {
            url: "http://127.0.0.1:1".into(),
            rpc_path: "/mcp".into(),
            health_path: "/health".into(),
            api_key: None,
        };
        let timeouts = AdapterTimeouts {
            probe: Duration::from_millis(500),
            call: Duration::from_millis(500),
        };
        Arc::new(SourceAdapter::Http(
            HttpAdapter::new(id.to_string(), settings, timeouts).unwrap(),
        ))
    }

    fn board(ids: &[&str]) -> Arc<HealthBoard> {
        Arc::new(HealthBoard::new(
            ids.iter().copied(),
            Backoff::new(Duration::from_secs(30), Duration::from_secs(300)),
        ))
    }

    fn names(tools: &[ToolDescriptor]) -> Vec<&str> {
        tools.iter().map(|t| t.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_first_wins_echo_owned_by_first_source() {
        let router = AggregatingRouter::new(
            vec![bridge("a", StaticBridge::new(&["echo"])), bridge("b", StaticBridge::new(&["echo", "sum"]))],
            board(&["a", "b"]),
            CollisionPolicy::FirstWins,
        );
        router.refresh_index().await;

        let tools = router.list_tools().await;
        assert_eq!(names(&tools), vec!["echo", "sum"]);
        assert_eq!(tools[0].source_id, "a");
        assert_eq!(tools[1].source_id, "b");

        let snapshot = router.snapshot().await;
        assert_eq!(snapshot.owner("echo").unwrap().source_id, "a");
    }

    #[tokio::test]
    async fn test_names_are_unique() {
        let router = AggregatingRouter::new(
            vec![
                bridge("a", StaticBridge::new(&["x", "y"])),
                bridge("b", StaticBridge::new(&["y", "z"])),
                bridge("c", StaticBridge::new(&["x", "z", "w"])),
            ],
            board(&["a", "b", "c"]),
            CollisionPolicy::FirstWins,
        );
        router.refresh_index().await;
        let tools = router.list_tools().await;
        let unique: HashSet<&str> = names(&tools).into_iter().collect();
        assert_eq!(unique.len(), tools.len());
        assert_eq!(tools.len(), 4);
    }

    #[tokio::test]
    async fn test_namespaced_keeps_both() {
        let router = AggregatingRouter::new(
            vec![bridge("a", StaticBridge::new(&["echo"])), bridge("b", StaticBridge::new(&["echo"]))],
            board(&["a", "b"]),
            CollisionPolicy::Namespaced,
        );
        router.refresh_index().await;
        assert_eq!(names(&router.list_tools().await), vec!["a__echo", "b__echo"]);

        // routed with the upstream name
        let result = router.call_tool("b__echo", None).await.unwrap();
        assert_eq!(result["content"][0]["text"], "echo");
        assert!(matches!(router.call_tool("echo", None).await, Err(GatewayError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn test_namespaced_miss_names_unknown_source() {
        let router = AggregatingRouter::new(
            vec![bridge("a", StaticBridge::new(&["echo"]))],
            board(&["a"]),
            CollisionPolicy::Namespaced,
        );
        router.refresh_index().await;

        assert!(matches!(
            router.call_tool("a__missing", None).await,
            Err(GatewayError::ToolNotFound(name)) if name == "a__missing"
        ));
        assert!(matches!(
            router.call_tool("zz__echo", None).await,
            Err(GatewayError::ToolNotFound(name)) if name == "zz__echo (no source 'zz')"
        ));
    }

    #[tokio::test]
    async fn test_unreachable_source_excluded_after_refresh() {
        let health = board(&["a", "b"]);
        let router = AggregatingRouter::new(
            vec![bridge("a", StaticBridge::new(&["alpha"])), bridge("b", StaticBridge::new(&["beta"]))],
            health.clone(),
            CollisionPolicy::FirstWins,
        );
        router.refresh_index().await;
        assert_eq!(router.snapshot().await.len(), 2);

        for _ in 0..3 {
            health.update("b", |h| h.record_failure("down", 3)).await;
        }
        router.refresh_index().await;
        assert_eq!(names(&router.list_tools().await), vec!["alpha"]);
        assert!(matches!(
            router.call_tool("beta", None).await,
            Err(GatewayError::ToolNotFound(name)) if name == "beta"
        ));
    }

    /// Lists one tool, and marks its own source unreachable while doing so.
    struct DemotedWhileListing {
        source_id: String,
        health: Arc<HealthBoard>,
    }

    impl InternalBridge for DemotedWhileListing {
        fn tools(&self) -> Vec<BridgeTool> {
            futures::executor::block_on(self.health.update(&self.source_id, |h| h.record_failure("went away", 1)));
            vec![BridgeTool {
                name: "late".into(),
                description: String::new(),
                input_schema: serde_json::json!({"type": "object"}),
            }]
        }

        fn call<'a>(
            &'a self,
            _name: &'a str,
            _arguments: ToolArguments,
        ) -> futures::future::BoxFuture<'a, Result<ToolResult, BridgeError>> {
            Box::pin(async { Err(BridgeError::Unavailable("went away".into())) })
        }
    }

    #[tokio::test]
    async fn test_source_demoted_mid_refresh_is_not_published() {
        let health = board(&["a", "b"]);
        let demoted = Arc::new(DemotedWhileListing {
            source_id: "b".into(),
            health: health.clone(),
        });
        let router = AggregatingRouter::new(
            vec![bridge("a", StaticBridge::new(&["alpha"])), bridge("b", demoted)],
            health.clone(),
            CollisionPolicy::FirstWins,
        );

        assert_eq!(router.refresh_index().await, 1);
        assert_eq!(health.state("b").await, Some(HealthState::Unreachable));
        assert_eq!(names(&router.list_tools().await), vec!["alpha"]);
        assert!(matches!(router.call_tool("late", None).await, Err(GatewayError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn test_refresh_source_drops_and_restores() {
        let health = board(&["a"]);
        let router = AggregatingRouter::new(
            vec![bridge("a", StaticBridge::new(&["alpha"]))],
            health.clone(),
            CollisionPolicy::FirstWins,
        );
        router.refresh_index().await;

        health.update("a", |h| h.record_failure("down", 1)).await;
        assert_eq!(router.refresh_source("a").await.unwrap(), 0);

        health.update("a", |h| h.record_success()).await;
        assert_eq!(router.refresh_source("a").await.unwrap(), 1);
        assert!(router.refresh_source("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_cached_catalog() {
        let router = AggregatingRouter::new(
            vec![bridge("a", StaticBridge::new(&["alpha"])), dead_http("remote")],
            board(&["a", "remote"]),
            CollisionPolicy::FirstWins,
        );
        assert_eq!(router.refresh_index().await, 1);
        // remote never listed successfully; a second refresh changes nothing
        assert_eq!(router.refresh_index().await, 1);
    }

    #[tokio::test]
    async fn test_listing_is_idempotent() {
        let router = AggregatingRouter::new(
            vec![bridge("a", StaticBridge::new(&["x", "y"]))],
            board(&["a"]),
            CollisionPolicy::FirstWins,
        );
        router.refresh_index().await;
        let first = router.list_tools().await;
        let second = router.list_tools().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let router = AggregatingRouter::new(vec![], board(&[]), CollisionPolicy::FirstWins);
        router.refresh_index().await;
        assert!(matches!(
            router.call_tool("ping", None).await,
            Err(GatewayError::ToolNotFound(name)) if name == "ping"
        ));
    }

    #[tokio::test]
    async fn test_call_outcomes_become_health_signals() {
        let (tx, mut rx) = mpsc::channel(8);
        let router = AggregatingRouter::new(
            vec![
                bridge("a", StaticBridge::new(&["ok"])),
                bridge(
                    "b",
                    Arc::new(FailingBridge {
                        names: vec!["flaky".into()],
                        error: BridgeError::Unavailable("connection refused".into()),
                    }),
                ),
            ],
            board(&["a", "b"]),
            CollisionPolicy::FirstWins,
        )
        .with_signals(tx);
        router.refresh_index().await;

        router.call_tool("ok", None).await.unwrap();
        assert_eq!(rx.recv().await, Some(HealthSignal::Reachable("a".into())));

        assert!(matches!(
            router.call_tool("flaky", None).await,
            Err(GatewayError::SourceUnavailable(id, _)) if id == "b"
        ));
        assert!(matches!(
            rx.recv().await,
            Some(HealthSignal::Unreachable { source_id, .. }) if source_id == "b"
        ));
    }
}
