//! # Core Engine Module
//!
//! This module holds the connection-resilience and event-relay engine. Each
//! component owns its own state and talks to the others only through method
//! calls and notification channels.
//!
//! ## Core Components:
//!
//! - **`token_provider`**: Keeps the OAuth2 bearer credential for the REST
//!   upstream fresh, refreshing it shortly before it expires.
//!
//! - **`stream_session`**: Owns the single persistent socket to the streaming
//!   upstream and reconnects it with exponential backoff (`reconnect`) until an
//!   attempt ceiling is reached.
//!
//! - **`event_relay`**: Fans every stream message out to the attached
//!   downstream subscribers, preserving arrival order.
//!
//! - **`health_monitor`**: Polls database, token source and stream on a fixed
//!   cadence and publishes status transitions.
//!
//! - **`orchestrator`**: Wires everything together and owns startup, shutdown
//!   and operator-initiated reconnects.

/// Exponential backoff state machine for the stream.
pub mod reconnect;
/// OAuth2 client-credentials token lifecycle.
pub mod token_provider;
/// The persistent streaming socket.
pub mod stream_session;
/// Fan-out of stream messages to downstream subscribers.
pub mod event_relay;
/// Periodic health checks and state transitions.
pub mod health_monitor;
/// Engine wiring and lifecycle.
pub mod orchestrator;

// --- Public API Re-exports ---
pub use event_relay::{EventRelay, SubscriberId, SubscriberTransport, RELAY_EVENT_TYPE};
pub use health_monitor::{
    CheckFailure, Component, ConnectionState, ConnectionStatus, HealthMonitor, HealthStatus,
    StateChange,
};
pub use orchestrator::{DashboardEvent, Orchestrator, OrchestratorError, Upstreams};
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use stream_session::{
    Frame, ReadyState, SessionEvent, StreamConnector, StreamError, StreamSession,
    StreamTransport, Subscription, WsConnector,
};
pub use token_provider::{
    AuthError, Credential, HttpTokenExchange, IssuedToken, TokenExchange, TokenProvider,
};
