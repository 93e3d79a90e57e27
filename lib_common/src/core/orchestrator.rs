//! # Orchestrator
//!
//! Builds the engine from its upstream collaborators and owns its lifecycle.
//!
//! `initialize` authenticates, opens the stream, binds the relay and starts the
//! health monitor. Only failures of that first authentication or that first
//! connect reach the caller; afterwards every failure is absorbed by the
//! component that saw it and becomes visible through [`DashboardEvent`]s, the
//! health snapshot and the error feed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::configs::RelayConfig;
use crate::connections::{DatabaseProbe, KeyValueCache};
use crate::core::event_relay::EventRelay;
use crate::core::health_monitor::{Component, HealthMonitor, HealthStatus, StateChange};
use crate::core::stream_session::{
    SessionEvent, StreamConnector, StreamError, StreamSession, Subscription,
};
use crate::core::token_provider::{AuthError, TokenExchange, TokenProvider};
use crate::errors::{DiagnosticEvent, ErrorTracker};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// The concrete upstreams the engine talks to.
pub struct Upstreams {
    pub database: Arc<dyn DatabaseProbe>,
    pub token_exchange: Arc<dyn TokenExchange>,
    pub stream_connector: Arc<dyn StreamConnector>,
    /// Optional store for the latest state of each component.
    pub cache: Option<Arc<dyn KeyValueCache>>,
}

/// Everything an observer such as a dashboard needs to stay current.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DashboardEvent {
    StateChange(StateChange),
    NewError(DiagnosticEvent),
    StreamExhausted { attempts: u32 },
}

/// # Orchestrator
pub struct Orchestrator {
    tracker: Arc<ErrorTracker>,
    tokens: Arc<TokenProvider>,
    stream: Arc<StreamSession>,
    relay: Arc<EventRelay>,
    monitor: Arc<HealthMonitor>,
    dashboard: broadcast::Sender<DashboardEvent>,
    binding: Mutex<Option<Subscription>>,
    cancel: CancellationToken,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Orchestrator {
    /// Wires and starts the engine.
    pub async fn initialize(config: RelayConfig, upstreams: Upstreams) -> Result<Self, OrchestratorError> {
        let tracker = Arc::new(ErrorTracker::new(&config.tracker));
        let tokens = Arc::new(TokenProvider::new(
            upstreams.token_exchange,
            tracker.clone(),
            &config.token,
        ));
        let stream = Arc::new(StreamSession::new(
            upstreams.stream_connector,
            tracker.clone(),
            &config.stream,
        ));
        let relay = Arc::new(EventRelay::new());
        let monitor = Arc::new(HealthMonitor::new(
            upstreams.database,
            tokens.clone(),
            stream.clone(),
            tracker.clone(),
            &config.health,
        ));
        let (dashboard, _) = broadcast::channel(config.tracker.notify_buffer.max(1));

        tokens.authenticate().await?;
        let binding = relay.bind(&stream);
        if let Err(e) = stream.connect().await {
            binding.unsubscribe();
            return Err(e.into());
        }

        let orchestrator = Self {
            tracker,
            tokens,
            stream,
            relay,
            monitor,
            dashboard,
            binding: Mutex::new(Some(binding)),
            cancel: CancellationToken::new(),
            forwarders: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        };
        // TTL spans a few missed cycles so a stopped engine ages out of the cache.
        let cache_ttl = config.health.check_interval() * 3;
        orchestrator.spawn_forwarders(upstreams.cache, cache_ttl);
        orchestrator.monitor.start_monitoring();
        log::info!("Relay engine initialized");
        Ok(orchestrator)
    }

    fn spawn_forwarders(&self, cache: Option<Arc<dyn KeyValueCache>>, cache_ttl: Duration) {
        let mut changes = self.monitor.subscribe();
        let mut errors = self.tracker.subscribe();
        let mut session = self.stream.events();
        let mut handles = Vec::with_capacity(3);

        let (cancel, dashboard) = (self.cancel.clone(), self.dashboard.clone());
        handles.push(tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = recv_skipping_lag(&mut changes, "state change") => match next {
                        Some(change) => change,
                        None => return,
                    },
                };
                if let Some(cache) = &cache {
                    write_state(cache.as_ref(), &change, cache_ttl).await;
                }
                let _ = dashboard.send(DashboardEvent::StateChange(change));
            }
        }));

        let (cancel, dashboard) = (self.cancel.clone(), self.dashboard.clone());
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = recv_skipping_lag(&mut errors, "error") => match next {
                        Some(event) => {
                            let _ = dashboard.send(DashboardEvent::NewError(event));
                        }
                        None => return,
                    },
                }
            }
        }));

        let (cancel, dashboard) = (self.cancel.clone(), self.dashboard.clone());
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = recv_skipping_lag(&mut session, "session") => match next {
                        Some(SessionEvent::ReconnectExhausted { attempts }) => {
                            let _ = dashboard.send(DashboardEvent::StreamExhausted { attempts });
                        }
                        Some(_) => {}
                        None => return,
                    },
                }
            }
        }));

        self.forwarders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(handles);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.dashboard.subscribe()
    }

    /// Operator-initiated reconnect of one component.
    pub async fn reconnect(&self, component: Component) -> bool {
        log::info!("Reconnect requested for {}", component);
        self.monitor.reconnect(component).await
    }

    pub fn status(&self) -> HealthStatus {
        self.monitor.get_status()
    }

    pub fn errors(&self) -> &Arc<ErrorTracker> {
        &self.tracker
    }

    pub fn relay(&self) -> &Arc<EventRelay> {
        &self.relay
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn stream(&self) -> &Arc<StreamSession> {
        &self.stream
    }

    pub fn tokens(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }

    /// Stops polling, closes the stream and ends the forwarders. Calling it
    /// again does nothing.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitor.stop_monitoring().await;
        if let Some(binding) = self.binding.lock().unwrap_or_else(|p| p.into_inner()).take() {
            binding.unsubscribe();
        }
        self.stream.close().await;
        self.cancel.cancel();
        let forwarders: Vec<_> = self
            .forwarders
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in forwarders {
            let _ = handle.await;
        }
        log::info!("Relay engine stopped");
    }
}

async fn recv_skipping_lag<T: Clone>(rx: &mut broadcast::Receiver<T>, what: &str) -> Option<T> {
    loop {
        match rx.recv().await {
            Ok(value) => return Some(value),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Dashboard forwarder skipped {} {} notifications", n, what);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

async fn write_state(cache: &dyn KeyValueCache, change: &StateChange, ttl: Duration) {
    let key = format!("health:{}", change.component);
    let value = match serde_json::to_string(change) {
        Ok(value) => value,
        Err(e) => {
            log::debug!("Skipping cache write for {}: {}", key, e);
            return;
        }
    };
    if let Err(e) = cache.set(&key, &value, ttl).await {
        log::debug!("Cache write for {} failed: {}", key, e);
    }
}
