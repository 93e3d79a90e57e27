//! # Event Relay
//!
//! Fans every message delivered by the [`StreamSession`] out to all attached
//! downstream subscribers.
//!
//! ## Delivery rules:
//!
//! 1.  **Envelope**: the upstream payload is opaque. It is wrapped as
//!     `{"type": "call_event", "data": <payload>, "timestamp": <now>}` and
//!     serialized once; every subscriber receives an `Arc` to the same text.
//!
//! 2.  **Open subscribers only**: a subscriber whose transport no longer
//!     reports itself open is skipped silently. It stays attached until it is
//!     detached by whoever owns the transport.
//!
//! 3.  **Ordering**: `publish` is synchronous and the session calls it once per
//!     inbound message, in wire order, so every subscriber observes the
//!     upstream order.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::stream_session::{StreamSession, Subscription};

/// Type discriminator carried by every relayed envelope.
pub const RELAY_EVENT_TYPE: &str = "call_event";

/// A downstream duplex channel as seen by the relay.
pub trait SubscriberTransport: Send + Sync {
    fn is_open(&self) -> bool;
    /// Hands over one serialized envelope. Returns `false` if it was not accepted.
    fn send_text(&self, text: Arc<str>) -> bool;
}

/// Opaque handle of one attached subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber-{}", self.0)
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: &'a Value,
    timestamp: DateTime<Utc>,
}

/// Subscriber backed by an unbounded channel; open while the receiver lives.
struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<Arc<str>>,
}

impl SubscriberTransport for ChannelSubscriber {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    fn send_text(&self, text: Arc<str>) -> bool {
        self.sender.send(text).is_ok()
    }
}

/// # Event Relay
#[derive(Default)]
pub struct EventRelay {
    subscribers: RwLock<HashMap<SubscriberId, Arc<dyn SubscriberTransport>>>,
    next_id: AtomicU64,
    delivered: AtomicU64,
}

impl EventRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber to the live set. It receives every event published
    /// from now on.
    pub fn attach(&self, transport: Arc<dyn SubscriberTransport>) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let total = {
            let mut subscribers = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
            subscribers.insert(id, transport);
            subscribers.len()
        };
        log::info!("{} attached, {} live", id, total);
        id
    }

    /// Attaches a channel-backed subscriber and returns its receiving half.
    /// Dropping the receiver makes the subscriber report itself closed.
    pub fn attach_channel(&self) -> (SubscriberId, mpsc::UnboundedReceiver<Arc<str>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.attach(Arc::new(ChannelSubscriber { sender }));
        (id, receiver)
    }

    /// Removes a subscriber. Returns `false` if it was not attached.
    pub fn detach(&self, id: SubscriberId) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            log::info!("{} detached", id);
        }
        removed
    }

    /// Wraps one upstream message and delivers it to every open subscriber.
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, message: &Value) -> usize {
        let envelope = Envelope {
            kind: RELAY_EVENT_TYPE,
            data: message,
            timestamp: Utc::now(),
        };
        let text: Arc<str> = match serde_json::to_string(&envelope) {
            Ok(text) => text.into(),
            Err(e) => {
                log::error!("Failed to serialize relay envelope: {}", e);
                return 0;
            }
        };

        let mut accepted = 0;
        let mut closed = Vec::new();
        for (id, subscriber) in self.subscribers.read().unwrap_or_else(|p| p.into_inner()).iter() {
            if subscriber.is_open() && subscriber.send_text(Arc::clone(&text)) {
                accepted += 1;
            } else if !subscriber.is_open() {
                closed.push(*id);
            }
        }
        self.delivered.fetch_add(accepted as u64, Ordering::Relaxed);
        self.prune(&closed);
        accepted
    }

    /// Drops subscribers whose transport reported closure.
    fn prune(&self, closed: &[SubscriberId]) {
        if closed.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
        for id in closed {
            if subscribers.get(id).is_some_and(|s| !s.is_open()) {
                subscribers.remove(id);
                log::info!("{} closed, removed", id);
            }
        }
    }

    /// Registers the relay as a listener of `session`.
    pub fn bind(self: &Arc<Self>, session: &StreamSession) -> Subscription {
        let relay = Arc::downgrade(self);
        session.subscribe(move |message| {
            if let Some(relay) = relay.upgrade() {
                relay.publish(message);
            }
        })
    }

    /// Attached subscribers. Closed ones count until the next publish prunes them.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Envelopes accepted by subscribers since creation.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}
