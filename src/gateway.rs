//! GatewayInstance: the explicitly owned process state.
//!
//! Built once from a validated config, shared by `Arc` between the front
//! door and the supervisor. Nothing here is global, so several gateways can
//! coexist in one process (tests do this).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};

use crate::config::{AuthSettings, GatewayConfig, GatewaySettings};
use crate::registry::{SourceDescriptor, SourceRegistry};
use crate::router::{AggregatingRouter, HealthSignal};
use crate::source::bridge::BridgeCatalog;
use crate::source::health::{Backoff, HealthBoard, HealthState, SourceHealth, Transition};
use crate::source::{AdapterTimeouts, SourceAdapter};

/// Buffered call outcomes awaiting the supervisor.
const SIGNAL_CAPACITY: usize = 256;

/// Which listeners are currently serving.
#[derive(Debug, Default)]
pub struct ListenerStatus {
    primary: AtomicBool,
    fallback: AtomicBool,
}

impl ListenerStatus {
    pub fn set_primary(&self, up: bool) {
        self.primary.store(up, Ordering::SeqCst);
    }

    pub fn set_fallback(&self, up: bool) {
        self.fallback.store(up, Ordering::SeqCst);
    }

    pub fn primary_up(&self) -> bool {
        self.primary.load(Ordering::SeqCst)
    }

    pub fn fallback_up(&self) -> bool {
        self.fallback.load(Ordering::SeqCst)
    }

    pub fn any_up(&self) -> bool {
        self.primary_up() || self.fallback_up()
    }
}

/// Aggregate status reported by `GET /health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    pub id: String,
    pub state: HealthState,
    pub last_checked_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ListenerReport {
    pub primary: bool,
    pub fallback: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub sources: Vec<SourceStatus>,
    pub listeners: ListenerReport,
}

/// One entry of `GET /admin/sources`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDetail<'a> {
    #[serde(flatten)]
    pub descriptor: &'a SourceDescriptor,
    pub address: String,
    pub health: Option<SourceHealth>,
}

pub struct GatewayInstance {
    registry: SourceRegistry,
    adapters: Vec<Arc<SourceAdapter>>,
    health: Arc<HealthBoard>,
    router: AggregatingRouter,
    listeners: ListenerStatus,
    settings: GatewaySettings,
    auth: AuthSettings,
    signals: Mutex<Option<mpsc::Receiver<HealthSignal>>>,
}

impl GatewayInstance {
    /// Validate `config` and build every adapter. Performs no I/O.
    pub fn from_config(config: GatewayConfig, bridges: &BridgeCatalog) -> crate::Result<Self> {
        config.validate()?;

        let mut registry = SourceRegistry::new();
        for source in config.enabled_sources() {
            registry.register(SourceDescriptor::from(source.clone()))?;
        }

        let timeouts = AdapterTimeouts::from_settings(&config.gateway);
        let adapters = registry
            .list()
            .iter()
            .map(|descriptor| SourceAdapter::for_source(descriptor, bridges, timeouts).map(Arc::new))
            .collect::<crate::Result<Vec<_>>>()?;

        let backoff = Backoff::new(config.gateway.probe_interval(), config.gateway.max_backoff());
        let health = Arc::new(HealthBoard::new(
            registry.list().iter().map(|d| d.id.as_str()),
            backoff,
        ));

        let (tx, rx) = mpsc::channel(SIGNAL_CAPACITY);
        let router = AggregatingRouter::new(adapters.clone(), health.clone(), config.gateway.collision_policy)
            .with_signals(tx);

        Ok(Self {
            registry,
            adapters,
            health,
            router,
            listeners: ListenerStatus::default(),
            settings: config.gateway,
            auth: config.auth,
            signals: Mutex::new(Some(rx)),
        })
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn router(&self) -> &AggregatingRouter {
        &self.router
    }

    pub fn health(&self) -> &HealthBoard {
        &self.health
    }

    pub fn listeners(&self) -> &ListenerStatus {
        &self.listeners
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn auth(&self) -> &AuthSettings {
        &self.auth
    }

    /// Router call outcomes; can be taken once.
    pub async fn take_signals(&self) -> Option<mpsc::Receiver<HealthSignal>> {
        self.signals.lock().await.take()
    }

    /// Probe every source once and build the first tool index.
    ///
    /// Returns the number of tools indexed.
    pub async fn initialize(&self) -> usize {
        tracing::info!(sources = self.registry.len(), "probing sources");
        join_all(self.adapters.iter().map(|adapter| async move {
            let result = adapter.probe_health().await;
            self.record(adapter.source_id(), result.ok, result.error).await;
        }))
        .await;
        self.router.refresh_index().await
    }

    /// Probe the sources whose backoff allows it, concurrently.
    pub async fn probe_due(&self) {
        let now = Instant::now();
        let snapshot = self.health.snapshot().await;
        let due = self
            .adapters
            .iter()
            .filter(|a| snapshot.get(a.source_id()).is_none_or(|h| h.probe_due(now)));

        join_all(due.map(|adapter| async move {
            let result = adapter.probe_health().await;
            tracing::debug!(
                source = %adapter.source_id(),
                ok = result.ok,
                latency_ms = result.latency.as_millis() as u64,
                "probe finished"
            );
            self.apply_outcome(adapter.source_id(), result.ok, result.error).await;
        }))
        .await;
    }

    /// Feed a router call outcome into the state machine.
    pub async fn apply_signal(&self, signal: HealthSignal) {
        match signal {
            HealthSignal::Reachable(id) => self.apply_outcome(&id, true, None).await,
            HealthSignal::Unreachable { source_id, reason } => {
                self.apply_outcome(&source_id, false, Some(reason)).await
            }
        }
    }

    /// Record an outcome and refresh the source's tools on promotion or demotion.
    async fn apply_outcome(&self, id: &str, ok: bool, error: Option<String>) {
        match self.record(id, ok, error).await {
            Some(Transition::Promoted | Transition::Demoted) => {
                if let Err(e) = self.router.refresh_source(id).await {
                    tracing::warn!(source = %id, error = %e, "targeted refresh failed");
                }
            }
            _ => {}
        }
    }

    async fn record(&self, id: &str, ok: bool, error: Option<String>) -> Option<Transition> {
        let threshold = self.settings.failure_threshold;
        let transition = self
            .health
            .update(id, |h| {
                if ok {
                    h.record_success()
                } else {
                    h.record_failure(error.unwrap_or_else(|| "unknown failure".into()), threshold)
                }
            })
            .await;

        match transition {
            Some(Transition::Promoted) => tracing::info!(source = %id, "source healthy"),
            Some(Transition::Degraded) => tracing::warn!(source = %id, "source degraded"),
            Some(Transition::Demoted) => tracing::error!(source = %id, "source unreachable"),
            _ => {}
        }
        transition
    }

    pub async fn health_report(&self) -> HealthReport {
        let snapshot = self.health.snapshot().await;
        let sources: Vec<SourceStatus> = self
            .registry
            .list()
            .iter()
            .map(|d| {
                let health = snapshot.get(&d.id);
                SourceStatus {
                    id: d.id.clone(),
                    state: health.map_or(HealthState::Unknown, |h| h.state),
                    last_checked_at: health.and_then(|h| h.last_checked_at),
                }
            })
            .collect();

        let healthy = sources.iter().filter(|s| s.state == HealthState::Healthy).count();
        let status = if !sources.is_empty() && healthy == 0 {
            OverallStatus::Unhealthy
        } else if healthy < sources.len() || (self.settings.enable_primary && !self.listeners.primary_up()) {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        };

        HealthReport {
            status,
            sources,
            listeners: ListenerReport {
                primary: self.listeners.primary_up(),
                fallback: self.listeners.fallback_up(),
            },
        }
    }

    /// Descriptors joined with their full health records.
    pub async fn source_details(&self) -> serde_json::Value {
        let snapshot = self.health.snapshot().await;
        let details: Vec<SourceDetail<'_>> = self
            .registry
            .list()
            .iter()
            .map(|d| SourceDetail {
                descriptor: d,
                address: d.address(),
                health: snapshot.get(&d.id).cloned(),
            })
            .collect();
        serde_json::to_value(details).unwrap_or_default()
    }

    /// Close every adapter's persistent connection.
    pub async fn shutdown(&self) {
        join_all(self.adapters.iter().map(|a| a.close())).await;
        tracing::info!("adapters closed");
    }
}
