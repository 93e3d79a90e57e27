//! # Health Monitor
//!
//! Polls the three upstreams on a fixed cadence and publishes a [`StateChange`]
//! whenever a component's status differs from the one recorded before.
//!
//! - **database**: one no-op round trip through the [`DatabaseProbe`], latency
//!   measured client side.
//! - **token-source**: [`TokenProvider::ensure_valid`], connected unless it fails.
//! - **stream**: a read of [`StreamSession::ready_state`]. No network I/O.
//!
//! The three checks of a cycle run concurrently and each one is bounded by the
//! configured check timeout, so a hung upstream only turns its own component
//! into `error`.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::configs::HealthConfig;
use crate::connections::DatabaseProbe;
use crate::core::stream_session::{ReadyState, StreamSession};
use crate::core::token_provider::TokenProvider;
use crate::errors::{ErrorTracker, Severity};

/// The named upstreams tracked by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    Database,
    TokenSource,
    Stream,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Database, Component::TokenSource, Component::Stream];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Database => "database",
            Component::TokenSource => "token-source",
            Component::Stream => "stream",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Component::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown component: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Last recorded health of one component.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Snapshot of every component, keyed by component.
pub type HealthStatus = BTreeMap<Component, ConnectionState>;

/// Published exactly once per status change of a component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub component: Component,
    pub previous: ConnectionStatus,
    pub current: ConnectionStatus,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Why a single check of a single component failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CheckFailure {
    #[error("check timed out after {0} ms")]
    TimedOut(u128),
    #[error("{0}")]
    Upstream(String),
}

struct Poller {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// # Health Monitor
pub struct HealthMonitor {
    database: Arc<dyn DatabaseProbe>,
    tokens: Arc<TokenProvider>,
    stream: Arc<StreamSession>,
    tracker: Arc<ErrorTracker>,
    config: HealthConfig,
    states: RwLock<HealthStatus>,
    changes: broadcast::Sender<StateChange>,
    poller: Mutex<Option<Poller>>,
}

impl HealthMonitor {
    pub fn new(
        database: Arc<dyn DatabaseProbe>,
        tokens: Arc<TokenProvider>,
        stream: Arc<StreamSession>,
        tracker: Arc<ErrorTracker>,
        config: &HealthConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(config.event_buffer.max(1));
        let states = Component::ALL
            .into_iter()
            .map(|c| (c, ConnectionState::default()))
            .collect();
        Self {
            database,
            tokens,
            stream,
            tracker,
            config: config.clone(),
            states: RwLock::new(states),
            changes,
            poller: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    /// Copy of the current per-component states.
    pub fn get_status(&self) -> HealthStatus {
        self.states.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Starts the periodic cycle. The first cycle is issued immediately.
    /// Calling it while already monitoring does nothing.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut poller = self.poller.lock().unwrap_or_else(|p| p.into_inner());
        if poller.as_ref().is_some_and(|p| !p.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(self),
            self.config.check_interval(),
            cancel.clone(),
        ));
        *poller = Some(Poller { cancel, handle });
        log::info!(
            "Health monitoring started, interval {} ms",
            self.config.check_interval_ms
        );
    }

    /// Stops the cycle. No check is issued after this returns. Safe to call
    /// when not monitoring.
    pub async fn stop_monitoring(&self) {
        let poller = self.poller.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(poller) = poller {
            poller.cancel.cancel();
            if let Err(e) = poller.handle.await {
                log::warn!("Health poller ended abnormally: {}", e);
            }
            log::info!("Health monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|p| !p.handle.is_finished())
    }

    /// Runs one full cycle and waits for all three checks.
    pub async fn check_now(&self) {
        tokio::join!(
            self.check_database(),
            self.check_token_source(),
            self.check_stream()
        );
    }

    async fn bounded<F, E>(&self, check: F) -> Result<(), CheckFailure>
    where
        F: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let limit = self.config.check_timeout();
        match tokio::time::timeout(limit, check).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(CheckFailure::Upstream(e.to_string())),
            Err(_) => Err(CheckFailure::TimedOut(limit.as_millis())),
        }
    }

    async fn check_database(&self) {
        let started = Instant::now();
        let outcome = self.bounded(self.database.ping()).await;
        self.settle(Component::Database, outcome, started);
    }

    async fn check_token_source(&self) {
        let started = Instant::now();
        let outcome = self.bounded(self.tokens.ensure_valid()).await;
        self.settle(Component::TokenSource, outcome, started);
    }

    async fn check_stream(&self) {
        let (status, error) = match self.stream.ready_state() {
            ReadyState::Open => (ConnectionStatus::Connected, None),
            ReadyState::Connecting => (ConnectionStatus::Connecting, None),
            ReadyState::Exhausted => (
                ConnectionStatus::Disconnected,
                Some("reconnect attempts exhausted".to_string()),
            ),
            ReadyState::Idle | ReadyState::Closed => (ConnectionStatus::Disconnected, None),
        };
        self.record(Component::Stream, status, None, error);
    }

    fn settle(&self, component: Component, outcome: Result<(), CheckFailure>, started: Instant) {
        let latency = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                self.record(component, ConnectionStatus::Connected, Some(latency), None);
            }
            Err(failure) => {
                let message = failure.to_string();
                let changed = self.record(component, ConnectionStatus::Error, None, Some(message.clone()));
                // Repeated failures of the same outage are reported once.
                if changed {
                    self.tracker.log_error(
                        component.as_str(),
                        Severity::Error,
                        format!("health check failed: {}", message),
                        None,
                    );
                }
            }
        }
    }

    /// Stores the new state; emits a notification when the status changed.
    fn record(
        &self,
        component: Component,
        status: ConnectionStatus,
        latency_ms: Option<u64>,
        error: Option<String>,
    ) -> bool {
        let now = Utc::now();
        let mut states = self.states.write().unwrap_or_else(|p| p.into_inner());
        let state = states.entry(component).or_default();
        let previous = state.status;
        *state = ConnectionState {
            status,
            latency_ms,
            last_error: error.clone(),
            last_checked: Some(now),
        };

        if previous == status {
            return false;
        }
        log::info!("{} status {:?} -> {:?}", component, previous, status);
        let _ = self.changes.send(StateChange {
            component,
            previous,
            current: status,
            latency_ms,
            error,
            timestamp: now,
        });
        true
    }

    fn reconnect_failed(&self, component: Component, operation: &str, message: String) -> bool {
        self.tracker.log_error(
            component.as_str(),
            Severity::Error,
            format!("{} failed: {}", operation, message),
            None,
        );
        self.record(component, ConnectionStatus::Error, None, Some(message));
        false
    }

    /// Drops and recreates the database connection, then re-checks it.
    pub async fn reconnect_database(&self) -> bool {
        self.record(Component::Database, ConnectionStatus::Connecting, None, None);
        match self.database.reconnect().await {
            Ok(()) => {
                self.check_database().await;
                true
            }
            Err(e) => self.reconnect_failed(Component::Database, "reconnect_database", e.to_string()),
        }
    }

    /// Discards the credential and authenticates again.
    pub async fn reconnect_token_source(&self) -> bool {
        self.record(Component::TokenSource, ConnectionStatus::Connecting, None, None);
        match self.tokens.force_reauthenticate().await {
            Ok(()) => {
                self.check_token_source().await;
                true
            }
            Err(e) => {
                self.reconnect_failed(Component::TokenSource, "reconnect_token_source", e.to_string())
            }
        }
    }

    /// Closes the stream and connects it again, resetting its attempt counter.
    pub async fn reconnect_stream(&self) -> bool {
        self.stream.close().await;
        self.record(Component::Stream, ConnectionStatus::Connecting, None, None);
        match self.stream.connect().await {
            Ok(()) => {
                self.check_stream().await;
                true
            }
            Err(e) => self.reconnect_failed(Component::Stream, "reconnect_stream", e.to_string()),
        }
    }

    pub async fn reconnect(&self, component: Component) -> bool {
        match component {
            Component::Database => self.reconnect_database().await,
            Component::TokenSource => self.reconnect_token_source().await,
            Component::Stream => self.reconnect_stream().await,
        }
    }
}

async fn poll_loop(monitor: Weak<HealthMonitor>, interval: std::time::Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let Some(monitor) = monitor.upgrade() else {
            return;
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = monitor.check_now() => {}
        }
    }
}
