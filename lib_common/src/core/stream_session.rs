//! # Stream Session
//!
//! Owns exactly one live connection to the event-streaming upstream.
//!
//! The session is a small state machine, `idle → connecting → open → closed →
//! connecting → …`, driven by a background task. The task reads frames,
//! answers pings, parses text frames as JSON and hands every message to the
//! registered listeners before reading the next one. When the socket closes
//! the task consults its [`ReconnectPolicy`]: either it sleeps and dials again
//! or, once the attempt ceiling is reached, it parks the session in
//! `exhausted` and stops until someone calls [`StreamSession::connect`].
//!
//! The transport sits behind [`StreamConnector`] / [`StreamTransport`], with
//! [`WsConnector`] being the `tokio-tungstenite` implementation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::configs::StreamConfig;
use crate::core::health_monitor::Component;
use crate::core::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::errors::{ErrorTracker, Severity};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamError {
    /// The opening handshake failed (bad credentials, TLS, unreachable host).
    #[error("connect failed: {0}")]
    ConnectFailure(String),
    /// An open socket went away.
    #[error("connection lost: {0}")]
    TransientDisconnect(String),
    #[error("reconnect attempts exhausted after {0} attempts")]
    ReconnectExhausted(u32),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

/// Transport-level state exposed for health polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Idle,
    Connecting,
    Open,
    Closed,
    /// The reconnect ceiling was hit; only an explicit `connect` leaves this state.
    Exhausted,
}

/// Notifications published by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    /// The socket closed; `reason` is `None` for a clean close frame.
    Closed { reason: Option<String> },
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectExhausted { attempts: u32 },
}

/// A frame as seen by the session, independent of the websocket library.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close,
}

/// One established connection.
#[async_trait]
pub trait StreamTransport: Send {
    /// Next inbound frame; `None` once the peer is gone.
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>>;
    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), StreamError>;
    async fn close(&mut self);
}

/// Dials the upstream; one call per connection attempt.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, StreamError>;
}

/// Callback invoked for every parsed inbound message.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: AtomicU64,
    entries: RwLock<Vec<(u64, Listener)>>,
}

impl Listeners {
    fn add(&self, listener: Listener) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, listener));
        id
    }

    fn remove(&self, id: u64) {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|(entry, _)| *entry != id);
    }

    fn snapshot(&self) -> Vec<Listener> {
        self.entries
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect()
    }
}

/// Handle returned by [`StreamSession::subscribe`]. Dropping it keeps the
/// listener registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    listeners: Weak<Listeners>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

struct Shared {
    connector: Arc<dyn StreamConnector>,
    tracker: Arc<ErrorTracker>,
    config: StreamConfig,
    listeners: Arc<Listeners>,
    state: watch::Sender<ReadyState>,
    events: broadcast::Sender<SessionEvent>,
    attempts: AtomicU32,
}

impl Shared {
    fn set_state(&self, state: ReadyState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, severity: Severity, message: String, details: Option<Value>) {
        self.tracker
            .log_error(Component::Stream.as_str(), severity, message, details);
    }

    fn mark_open(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.set_state(ReadyState::Open);
        self.emit(SessionEvent::Opened);
        log::info!("Stream session open");
    }

    /// Reads until the socket closes. Returns the close reason.
    async fn pump(&self, transport: &mut dyn StreamTransport) -> Option<String> {
        loop {
            match transport.next_frame().await {
                Some(Ok(Frame::Text(text))) => self.dispatch(&text),
                Some(Ok(Frame::Ping(payload))) => {
                    if let Err(e) = transport.send_pong(payload).await {
                        return Some(e.to_string());
                    }
                }
                Some(Ok(Frame::Close)) => return None,
                Some(Ok(Frame::Binary(data))) => {
                    log::debug!("Ignoring {} byte binary frame", data.len());
                }
                Some(Ok(Frame::Pong)) => {}
                Some(Err(e)) => return Some(e.to_string()),
                None => return Some("stream ended".to_string()),
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(message) => {
                for listener in self.listeners.snapshot() {
                    listener(&message);
                }
            }
            Err(e) => {
                let preview: String = text.chars().take(200).collect();
                self.report(
                    Severity::Error,
                    StreamError::MalformedMessage(e.to_string()).to_string(),
                    Some(json!({ "preview": preview })),
                );
            }
        }
    }
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Driver {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            log::warn!("Stream driver ended abnormally: {}", e);
        }
    }
}

/// # Stream Session
pub struct StreamSession {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl StreamSession {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        tracker: Arc<ErrorTracker>,
        config: &StreamConfig,
    ) -> Self {
        let (state, _) = watch::channel(ReadyState::Idle);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            shared: Arc::new(Shared {
                connector,
                tracker,
                config: config.clone(),
                listeners: Arc::new(Listeners::default()),
                state,
                events,
                attempts: AtomicU32::new(0),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Opens the socket and starts the reader task. Returns once the socket is
    /// open; a no-op when it already is. Any previous driver (for instance one
    /// parked in `exhausted`) is replaced, which resets the attempt counter.
    pub async fn connect(&self) -> Result<(), StreamError> {
        let mut driver = self.driver.lock().await;
        if let Some(active) = driver.as_ref() {
            if !active.handle.is_finished() && self.ready_state() == ReadyState::Open {
                return Ok(());
            }
        }
        if let Some(stale) = driver.take() {
            stale.stop().await;
        }

        self.shared.attempts.store(0, Ordering::Relaxed);
        self.shared.set_state(ReadyState::Connecting);
        let transport = match self.shared.connector.connect().await {
            Ok(transport) => transport,
            Err(e) => {
                self.shared.set_state(ReadyState::Closed);
                self.shared.report(Severity::Error, e.to_string(), None);
                return Err(match e {
                    StreamError::ConnectFailure(_) => e,
                    other => StreamError::ConnectFailure(other.to_string()),
                });
            }
        };
        self.shared.mark_open();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_driver(
            Arc::clone(&self.shared),
            transport,
            cancel.clone(),
        ));
        *driver = Some(Driver { cancel, handle });
        Ok(())
    }

    /// Deliberately closes the socket. No reconnect is scheduled afterwards.
    /// Safe to call at any time, including when already closed.
    pub async fn close(&self) {
        let driver = self.driver.lock().await.take();
        if let Some(driver) = driver {
            driver.stop().await;
            log::info!("Stream session closed on request");
        }
        if self.ready_state() != ReadyState::Idle {
            self.shared.set_state(ReadyState::Closed);
        }
    }

    /// Registers a callback for every parsed inbound message.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.shared.listeners.add(Arc::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.shared.listeners),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.shared.state.borrow()
    }

    /// Watch channel following every state change.
    pub fn watch_state(&self) -> watch::Receiver<ReadyState> {
        self.shared.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Consecutive failed cycles since the socket was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::Relaxed)
    }
}

async fn run_driver(
    shared: Arc<Shared>,
    mut transport: Box<dyn StreamTransport>,
    cancel: CancellationToken,
) {
    let mut policy = ReconnectPolicy::new(&shared.config);

    loop {
        let closed = tokio::select! {
            _ = cancel.cancelled() => None,
            reason = shared.pump(transport.as_mut()) => Some(reason),
        };
        let Some(reason) = closed else {
            transport.close().await;
            return;
        };

        shared.set_state(ReadyState::Closed);
        shared.emit(SessionEvent::Closed {
            reason: reason.clone(),
        });
        let message = reason.unwrap_or_else(|| "closed by remote".to_string());
        shared.report(
            Severity::Warning,
            StreamError::TransientDisconnect(message).to_string(),
            None,
        );

        // Each failed dial counts as one more close.
        loop {
            match policy.on_close() {
                ReconnectDecision::Exhausted { attempts } => {
                    shared.set_state(ReadyState::Exhausted);
                    shared.emit(SessionEvent::ReconnectExhausted { attempts });
                    shared.report(
                        Severity::Critical,
                        StreamError::ReconnectExhausted(attempts).to_string(),
                        None,
                    );
                    return;
                }
                ReconnectDecision::Retry { attempt, delay } => {
                    shared.attempts.store(attempt, Ordering::Relaxed);
                    shared.emit(SessionEvent::ReconnectScheduled { attempt, delay });
                    log::info!(
                        "Stream reconnect attempt {} in {} ms",
                        attempt,
                        delay.as_millis()
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }

                    shared.set_state(ReadyState::Connecting);
                    let dialed = tokio::select! {
                        _ = cancel.cancelled() => return,
                        dialed = shared.connector.connect() => dialed,
                    };
                    match dialed {
                        Ok(fresh) => {
                            transport = fresh;
                            policy.on_open();
                            shared.mark_open();
                            break;
                        }
                        Err(e) => {
                            shared.set_state(ReadyState::Closed);
                            shared.report(
                                Severity::Warning,
                                format!("reconnect attempt {} failed: {}", attempt, e),
                                None,
                            );
                        }
                    }
                }
            }
        }
    }
}

/// `tokio-tungstenite` connector with Basic credentials on the handshake.
pub struct WsConnector {
    url: String,
    credentials: Option<(String, String)>,
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn StreamTransport>, StreamError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::ConnectFailure(e.to_string()))?;

        if let Some((username, password)) = &self.credentials {
            let encoded = general_purpose::STANDARD.encode(format!("{}:{}", username, password));
            let value = HeaderValue::from_str(&format!("Basic {}", encoded))
                .map_err(|e| StreamError::ConnectFailure(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        log::info!("Connecting to stream upstream: {}", self.url);
        let (inner, response) = tokio::time::timeout(self.handshake_timeout, connect_async(request))
            .await
            .map_err(|_| StreamError::ConnectFailure("handshake timed out".to_string()))?
            .map_err(|e| StreamError::ConnectFailure(e.to_string()))?;
        log::debug!("Stream handshake answered with {}", response.status());

        Ok(Box::new(WsTransport { inner }))
    }
}

struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl StreamTransport for WsTransport {
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
        let message = match self.inner.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(StreamError::TransientDisconnect(e.to_string()))),
        };
        let frame = match message {
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Binary(data) => Frame::Binary(data.to_vec()),
            Message::Ping(payload) => Frame::Ping(payload.to_vec()),
            Message::Pong(_) | Message::Frame(_) => Frame::Pong,
            Message::Close(_) => Frame::Close,
        };
        Some(Ok(frame))
    }

    async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), StreamError> {
        self.inner
            .send(Message::Pong(payload.into()))
            .await
            .map_err(|e| StreamError::TransientDisconnect(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = tokio::time::timeout(Duration::from_secs(2), self.inner.close(None)).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::ErrorFilter;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    pub(crate) struct FakeTransport {
        frames: mpsc::UnboundedReceiver<Frame>,
        pongs: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    }

    #[async_trait]
    impl StreamTransport for FakeTransport {
        async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
            self.frames.recv().await.map(Ok)
        }

        async fn send_pong(&mut self, payload: Vec<u8>) -> Result<(), StreamError> {
            self.pongs.lock().unwrap().push(payload);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// Connector double: each dial pops the next scripted outcome; an empty
    /// script means the upstream is unreachable.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        script: std::sync::Mutex<VecDeque<Option<mpsc::UnboundedReceiver<Frame>>>>,
        pub dials: AtomicUsize,
        pub pongs: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    }

    impl FakeConnector {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Next dial succeeds; frames sent on the returned sender reach the session.
        pub(crate) fn push_ok(&self) -> mpsc::UnboundedSender<Frame> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.script.lock().unwrap().push_back(Some(rx));
            tx
        }

        pub(crate) fn push_fail(&self) {
            self.script.lock().unwrap().push_back(None);
        }

        pub(crate) fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StreamConnector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn StreamTransport>, StreamError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front().flatten() {
                Some(frames) => Ok(Box::new(FakeTransport {
                    frames,
                    pongs: self.pongs.clone(),
                })),
                None => Err(StreamError::ConnectFailure("connection refused".into())),
            }
        }
    }

    fn session(connector: Arc<FakeConnector>) -> (StreamSession, Arc<ErrorTracker>) {
        let tracker = Arc::new(ErrorTracker::default());
        let session = StreamSession::new(connector, tracker.clone(), &StreamConfig::default());
        (session, tracker)
    }

    fn forward_to(session: &StreamSession) -> (Subscription, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = session.subscribe(move |v| {
            let _ = tx.send(v.clone());
        });
        (sub, rx)
    }

    #[tokio::test]
    async fn delivers_messages_to_every_listener_in_order() {
        let connector = FakeConnector::new();
        let frames = connector.push_ok();
        let (session, _) = session(connector);
        let (_a, mut rx_a) = forward_to(&session);
        let (_b, mut rx_b) = forward_to(&session);

        session.connect().await.expect("connect");
        assert_eq!(session.ready_state(), ReadyState::Open);
        for n in 1..=3 {
            frames.send(Frame::Text(format!(r#"{{"seq":{n}}}"#))).unwrap();
        }

        for rx in [&mut rx_a, &mut rx_b] {
            for n in 1..=3 {
                assert_eq!(rx.recv().await, Some(json!({ "seq": n })));
            }
        }
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_and_reported() {
        let connector = FakeConnector::new();
        let frames = connector.push_ok();
        let (session, tracker) = session(connector);
        let (_sub, mut rx) = forward_to(&session);
        session.connect().await.expect("connect");

        frames.send(Frame::Text("{not json".into())).unwrap();
        frames.send(Frame::Text(r#"{"ok":true}"#.into())).unwrap();

        assert_eq!(rx.recv().await, Some(json!({ "ok": true })));
        let errors = tracker.get_errors(&ErrorFilter::component("stream"));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity, Severity::Error);
        assert!(errors[0].message.starts_with("malformed message"));
        assert_eq!(session.ready_state(), ReadyState::Open);
    }

    #[tokio::test]
    async fn pings_are_answered_and_binary_is_ignored() {
        let connector = FakeConnector::new();
        let frames = connector.push_ok();
        let (session, _) = session(connector.clone());
        let (_sub, mut rx) = forward_to(&session);
        session.connect().await.expect("connect");

        frames.send(Frame::Ping(vec![7, 7])).unwrap();
        frames.send(Frame::Binary(vec![1, 2, 3])).unwrap();
        frames.send(Frame::Text("1".into())).unwrap();

        assert_eq!(rx.recv().await, Some(json!(1)));
        assert_eq!(*connector.pongs.lock().unwrap(), vec![vec![7, 7]]);
    }

    #[tokio::test]
    async fn unsubscribed_listener_stops_receiving() {
        let connector = FakeConnector::new();
        let frames = connector.push_ok();
        let (session, _) = session(connector);
        let (gone, mut rx_gone) = forward_to(&session);
        let (_kept, mut rx_kept) = forward_to(&session);
        session.connect().await.expect("connect");

        gone.unsubscribe();
        frames.send(Frame::Text("42".into())).unwrap();

        assert_eq!(rx_kept.recv().await, Some(json!(42)));
        assert!(rx_gone.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_is_idempotent_while_open() {
        let connector = FakeConnector::new();
        let _frames = connector.push_ok();
        let (session, _) = session(connector.clone());

        session.connect().await.expect("connect");
        session.connect().await.expect("connect again");
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test]
    async fn failed_handshake_raises_connect_failure() {
        let connector = FakeConnector::new();
        connector.push_fail();
        let (session, tracker) = session(connector);

        let result = session.connect().await;
        assert!(matches!(result, Err(StreamError::ConnectFailure(_))));
        assert_eq!(session.ready_state(), ReadyState::Closed);
        assert_eq!(tracker.get_errors(&ErrorFilter::component("stream")).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_closes_back_off_then_exhaust() {
        let connector = FakeConnector::new();
        let frames = connector.push_ok();
        let (session, tracker) = session(connector.clone());
        let mut events = session.events();
        session.connect().await.expect("connect");

        drop(frames);

        let mut scheduled = Vec::new();
        loop {
            match events.recv().await.expect("event") {
                SessionEvent::ReconnectScheduled { attempt, delay } => scheduled.push((attempt, delay)),
                SessionEvent::ReconnectExhausted { attempts } => {
                    assert_eq!(attempts, 10);
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(scheduled.len(), 10);
        for (attempt, delay) in &scheduled {
            let expected = Duration::from_millis(5_000).mul_f64(1.5f64.powi(*attempt as i32 - 1));
            assert_eq!(*delay, expected);
        }
        assert_eq!(session.ready_state(), ReadyState::Exhausted);
        assert_eq!(connector.dials(), 11);
        let critical = tracker.get_errors(&ErrorFilter {
            severity: Some(Severity::Critical),
            ..Default::default()
        });
        assert_eq!(critical.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_attempts() {
        let connector = FakeConnector::new();
        let first = connector.push_ok();
        connector.push_fail();
        let _second = connector.push_ok();
        let (session, _) = session(connector.clone());
        let mut events = session.events();
        session.connect().await.expect("connect");
        assert_eq!(events.recv().await, Ok(SessionEvent::Opened));

        drop(first);

        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.expect("event");
            let done = event == SessionEvent::Opened;
            seen.push(event);
            if done {
                break;
            }
        }
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, SessionEvent::ReconnectScheduled { .. }))
                .count(),
            2
        );
        assert_eq!(session.ready_state(), ReadyState::Open);
        assert_eq!(session.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_session_recovers_on_explicit_connect() {
        let connector = FakeConnector::new();
        let frames = connector.push_ok();
        let (session, _) = session(connector.clone());
        let mut state = session.watch_state();
        session.connect().await.expect("connect");

        drop(frames);
        state
            .wait_for(|s| *s == ReadyState::Exhausted)
            .await
            .expect("exhausted");

        let _fresh = connector.push_ok();
        session.connect().await.expect("reconnect");
        assert_eq!(session.ready_state(), ReadyState::Open);
        assert_eq!(session.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_prevents_any_further_reconnect() {
        let connector = FakeConnector::new();
        let _frames = connector.push_ok();
        let (session, _) = session(connector.clone());
        session.connect().await.expect("connect");

        session.close().await;
        session.close().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(session.ready_state(), ReadyState::Closed);
        assert_eq!(connector.dials(), 1);
    }
}
