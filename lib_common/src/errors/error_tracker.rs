//! # Error Tracker
//!
//! A fixed-capacity, newest-first buffer of [`DiagnosticEvent`]s shared by all
//! components. Insertion always happens at the head; once the buffer grows past
//! its capacity the oldest entry (the tail) is evicted.
//!
//! The buffer sits behind a mutex: `log_error` may be called concurrently from
//! the stream driver, the health monitor and reconnect operations, and the
//! capacity check must not race with insertion.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::configs::TrackerConfig;

/// Severity of a diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl Severity {
    /// The lowercase name used on the wire and as statistics key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }

    fn log_level(&self) -> log::Level {
        match self {
            Severity::Critical | Severity::Error => log::Level::Error,
            Severity::Warning => log::Level::Warn,
            Severity::Info => log::Level::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// # Diagnostic Event
///
/// One structured entry in the tracker. Only `acknowledged` ever changes after
/// creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEvent {
    /// Monotonic identifier, unique for the lifetime of the tracker.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    /// Name of the reporting component (e.g. `database`, `stream`).
    pub component: String,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub acknowledged: bool,
}

/// Conjunctive filter for [`ErrorTracker::get_errors`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFilter {
    pub component: Option<String>,
    pub severity: Option<Severity>,
    pub acknowledged: Option<bool>,
    pub limit: Option<usize>,
}

impl ErrorFilter {
    /// Filter on a single component.
    pub fn component(component: impl Into<String>) -> Self {
        Self {
            component: Some(component.into()),
            ..Default::default()
        }
    }

    fn matches(&self, event: &DiagnosticEvent) -> bool {
        self.component.as_deref().map_or(true, |c| event.component == c)
            && self.severity.map_or(true, |s| event.severity == s)
            && self.acknowledged.map_or(true, |a| event.acknowledged == a)
    }
}

/// Aggregate counts over the buffer contents at call time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorStatistics {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_component: BTreeMap<String, usize>,
    pub acknowledged: usize,
    pub unacknowledged: usize,
    pub last24_hours: usize,
}

/// # Error Tracker
///
/// Shared, thread-safe diagnostic buffer. Hold it in an `Arc` and hand clones
/// to every component.
pub struct ErrorTracker {
    capacity: usize,
    buffer: Mutex<VecDeque<DiagnosticEvent>>,
    next_id: AtomicU64,
    observers: broadcast::Sender<DiagnosticEvent>,
}

impl ErrorTracker {
    /// Creates a tracker with the configured capacity.
    pub fn new(config: &TrackerConfig) -> Self {
        let (observers, _) = broadcast::channel(config.notify_buffer.max(1));
        Self {
            capacity: config.capacity.max(1),
            buffer: Mutex::new(VecDeque::with_capacity(config.capacity.max(1))),
            next_id: AtomicU64::new(1),
            observers,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DiagnosticEvent>> {
        // A panic while holding the lock leaves the deque itself intact.
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records a new event at the head of the buffer and returns its id.
    pub fn log_error(
        &self,
        component: &str,
        severity: Severity,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> u64 {
        self.insert_at(component, severity, message.into(), details, Utc::now())
    }

    fn insert_at(
        &self,
        component: &str,
        severity: Severity,
        message: String,
        details: Option<Value>,
        timestamp: DateTime<Utc>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = DiagnosticEvent {
            id,
            timestamp,
            component: component.to_string(),
            severity,
            message,
            details,
            acknowledged: false,
        };

        log::log!(
            target: "error_tracker",
            severity.log_level(),
            "[{}][{}] {}",
            event.component,
            severity,
            event.message
        );

        {
            let mut buffer = self.lock();
            buffer.push_front(event.clone());
            while buffer.len() > self.capacity {
                buffer.pop_back();
            }
        }

        // No observers is not an error.
        let _ = self.observers.send(event);
        id
    }

    /// Returns matching entries, newest first, truncated to `filter.limit`.
    pub fn get_errors(&self, filter: &ErrorFilter) -> Vec<DiagnosticEvent> {
        let buffer = self.lock();
        let matching = buffer.iter().filter(|e| filter.matches(e)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    /// Marks the entry acknowledged. Returns `true` only on the first
    /// acknowledgement of an id still in the buffer.
    pub fn acknowledge_error(&self, id: u64) -> bool {
        let mut buffer = self.lock();
        match buffer.iter_mut().find(|e| e.id == id) {
            Some(event) if !event.acknowledged => {
                event.acknowledged = true;
                true
            }
            _ => false,
        }
    }

    /// Whether an entry with this id is still buffered.
    pub fn contains(&self, id: u64) -> bool {
        self.lock().iter().any(|e| e.id == id)
    }

    /// Computes statistics relative to the current wall clock.
    pub fn get_statistics(&self) -> ErrorStatistics {
        self.statistics_at(Utc::now())
    }

    fn statistics_at(&self, now: DateTime<Utc>) -> ErrorStatistics {
        let cutoff = now - Duration::hours(24);
        let buffer = self.lock();
        let mut stats = ErrorStatistics {
            total: buffer.len(),
            ..Default::default()
        };

        for event in buffer.iter() {
            *stats.by_severity.entry(event.severity).or_insert(0) += 1;
            *stats.by_component.entry(event.component.clone()).or_insert(0) += 1;
            if event.acknowledged {
                stats.acknowledged += 1;
            } else {
                stats.unacknowledged += 1;
            }
            if event.timestamp >= cutoff {
                stats.last24_hours += 1;
            }
        }
        stats
    }

    /// Drops every acknowledged entry and returns how many were removed.
    pub fn clear_acknowledged(&self) -> usize {
        let mut buffer = self.lock();
        let before = buffer.len();
        buffer.retain(|e| !e.acknowledged);
        before - buffer.len()
    }

    /// Receiver for events logged after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.observers.subscribe()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new(&TrackerConfig::default())
    }
}
