//! Resilience supervisor for `toolgate serve`.
//!
//! Owns the listeners and the background probe loop. Primary and fallback
//! listeners are bound independently; the process keeps serving as long as
//! one of them is up. On cancellation the listeners stop accepting, in-flight
//! requests get `shutdown_timeout_secs` to finish, then every adapter is closed.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::gateway::GatewayInstance;
use crate::router::HealthSignal;
use crate::standalone::front_door;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Primary,
    Fallback,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Fallback => "fallback",
        }
    }
}

/// Listeners that bound successfully.
#[derive(Debug, Default)]
pub struct Listeners {
    pub primary: Option<TcpListener>,
    pub fallback: Option<TcpListener>,
}

impl Listeners {
    pub fn primary_addr(&self) -> Option<SocketAddr> {
        self.primary.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn fallback_addr(&self) -> Option<SocketAddr> {
        self.fallback.as_ref().and_then(|l| l.local_addr().ok())
    }
}

pub struct Supervisor {
    gateway: Arc<GatewayInstance>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(gateway: Arc<GatewayInstance>, cancel: CancellationToken) -> Self {
        Self { gateway, cancel }
    }

    /// Bind the enabled listeners. Fails only when none could be bound.
    pub async fn bind(&self) -> crate::Result<Listeners> {
        let settings = self.gateway.settings();
        let mut listeners = Listeners::default();
        if settings.enable_primary {
            listeners.primary = bind_one(Role::Primary, &settings.host, settings.primary_port).await;
        }
        if settings.enable_fallback {
            listeners.fallback = bind_one(Role::Fallback, &settings.host, settings.fallback_port).await;
        }
        if listeners.primary.is_none() && listeners.fallback.is_none() {
            return Err(GatewayError::AllListenersDown);
        }
        Ok(listeners)
    }

    /// Bind, then serve until cancelled.
    pub async fn run(&self) -> crate::Result<()> {
        let listeners = self.bind().await?;
        self.serve(listeners).await
    }

    /// Serve on the given listeners and run the probe loop.
    ///
    /// Returns `AllListenersDown` if every listener exits before cancellation.
    pub async fn serve(&self, listeners: Listeners) -> crate::Result<()> {
        let mut tasks = JoinSet::new();
        for (role, listener) in [
            (Role::Primary, listeners.primary),
            (Role::Fallback, listeners.fallback),
        ] {
            if let Some(listener) = listener {
                tasks.spawn(serve_one(role, listener, self.gateway.clone(), self.cancel.clone()));
            }
        }

        let probe_cancel = self.cancel.child_token();
        let probes = tokio::spawn(run_probe_loop(self.gateway.clone(), probe_cancel.clone()));

        let stopped_early = tokio::select! {
            _ = wait_listeners(&mut tasks) => !self.cancel.is_cancelled(),
            _ = self.cancel.cancelled() => false,
        };

        let outcome = if stopped_early {
            tracing::error!("every listener has stopped");
            Err(GatewayError::AllListenersDown)
        } else {
            tracing::info!("shutting down, draining in-flight requests");
            let grace = self.gateway.settings().shutdown_timeout();
            if tokio::time::timeout(grace, wait_listeners(&mut tasks)).await.is_err() {
                tracing::warn!(
                    timeout_secs = grace.as_secs(),
                    "drain timed out, aborting remaining connections"
                );
                tasks.abort_all();
                self.gateway.listeners().set_primary(false);
                self.gateway.listeners().set_fallback(false);
            }
            Ok(())
        };

        probe_cancel.cancel();
        if let Err(e) = probes.await {
            tracing::warn!(error = %e, "probe loop ended abnormally");
        }
        self.gateway.shutdown().await;
        tracing::info!("toolgate stopped");
        outcome
    }
}

async fn bind_one(role: Role, host: &str, port: u16) -> Option<TcpListener> {
    let addr = format!("{}:{}", host, port);
    match TcpListener::bind(&addr).await {
        Ok(listener) => {
            tracing::info!(listener = role.as_str(), addr = %addr, "listener bound");
            Some(listener)
        }
        Err(e) => {
            let err = GatewayError::Bind(addr, e.to_string());
            tracing::warn!(listener = role.as_str(), error = %err, "listener unavailable");
            None
        }
    }
}

async fn serve_one(role: Role, listener: TcpListener, gateway: Arc<GatewayInstance>, cancel: CancellationToken) {
    let set_up = |up: bool| match role {
        Role::Primary => gateway.listeners().set_primary(up),
        Role::Fallback => gateway.listeners().set_fallback(up),
    };

    if let Ok(addr) = listener.local_addr() {
        tracing::info!(listener = role.as_str(), "serving MCP on http://{}/mcp", addr);
    }
    set_up(true);
    let result = axum::serve(listener, front_door::app(gateway.clone()))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await;
    set_up(false);

    match result {
        Ok(()) => tracing::debug!(listener = role.as_str(), "listener stopped"),
        Err(e) => tracing::error!(listener = role.as_str(), error = %e, "listener failed"),
    }
}

async fn wait_listeners(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!(error = %e, "listener task panicked");
            }
        }
    }
}

/// Periodic probes plus router call signals, until cancelled.
async fn run_probe_loop(gateway: Arc<GatewayInstance>, cancel: CancellationToken) {
    let mut signals = gateway.take_signals().await;
    let mut ticker = tokio::time::interval(gateway.settings().probe_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately; startup already probed every source
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => gateway.probe_due().await,
            Some(signal) = next_signal(&mut signals) => gateway.apply_signal(signal).await,
            _ = cancel.cancelled() => {
                tracing::debug!("probe loop cancelled");
                return;
            }
        }
    }
}

async fn next_signal(signals: &mut Option<mpsc::Receiver<HealthSignal>>) -> Option<HealthSignal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves on SIGINT, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
