//! Log streaming bus.
//!
//! Process-wide pub/sub of structured events with a bounded backlog:
//!
//! - publishers call [`LogBus::publish`]; delivery is fan-out over a
//!   broadcast channel (capacity 1000 per subscriber, oldest dropped on
//!   lag with a `SubscriberLagged` notice)
//! - a ring buffer (default 2000 events) retains recent history for
//!   late subscribers
//! - sessions group the events of one run with a lifecycle
//!   `running -> success | failure | cancelled`
//!
//! One instance is created and owned by the orchestrator and threaded
//! through all executions; there is no module-level state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::Error;

/// Default ring buffer capacity.
pub const DEFAULT_BUFFER_CAPACITY: usize = 2000;
/// Per-subscriber pending-event cap before the oldest are dropped.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1000;
/// Depth cap applied when sanitizing metadata values.
const MAX_SANITIZE_DEPTH: usize = 64;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail
    Debug,
    /// Progress information
    Info,
    /// Recoverable anomaly
    Warn,
    /// Failure
    Error,
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// An error normalized for transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizedError {
    /// Display message
    pub message: String,
    /// Error kind tag
    pub name: String,
    /// Optional source chain rendering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl From<&Error> for SanitizedError {
    fn from(error: &Error) -> Self {
        let mut stack = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            name: error.kind().to_string(),
            stack: if stack.is_empty() {
                None
            } else {
                Some(stack.join("\n"))
            },
        }
    }
}

/// Structured context attached to an event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContext {
    /// Suite the event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Step the event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// Duration of the operation, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Free-form metadata (sanitized on publish)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Normalized error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SanitizedError>,
}

impl EventContext {
    /// Context scoped to a suite.
    #[must_use]
    pub fn for_suite(node_id: &str) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            ..Self::default()
        }
    }

    /// Context scoped to a step.
    #[must_use]
    pub fn for_step(node_id: &str, step_name: &str) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            step_name: Some(step_name.to_string()),
            ..Self::default()
        }
    }

    /// Attach a normalized error.
    #[must_use]
    pub fn with_error(mut self, error: &Error) -> Self {
        self.error = Some(SanitizedError::from(error));
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Monotonic event id (`evt-N`)
    pub id: String,
    /// Publication timestamp
    pub ts: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Message text
    pub message: String,
    /// Run this event belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Structured context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<EventContext>,
}

/// Subscriber filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events of this run
    pub run_id: Option<String>,
    /// Only these severities
    pub levels: Option<Vec<LogLevel>>,
}

impl EventFilter {
    /// Whether an event passes the filter.
    #[must_use]
    pub fn matches(&self, event: &LogEvent) -> bool {
        if let Some(ref run_id) = self.run_id {
            if event.run_id.as_deref() != Some(run_id.as_str()) {
                return false;
            }
        }
        if let Some(ref levels) = self.levels {
            if !levels.contains(&event.level) {
                return false;
            }
        }
        true
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// In progress
    Running,
    /// Completed successfully
    Success,
    /// Completed with failures
    Failure,
    /// Cancelled or timed out
    Cancelled,
}

/// Descriptor of a run-associated event grouping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    /// Session id
    pub id: String,
    /// Human-readable label
    pub label: String,
    /// Origin (cli, api, ...)
    pub source: String,
    /// Run this session tracks
    pub run_id: String,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// End timestamp, set on finalize
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Free-form metadata
    pub metadata: Value,
}

/// Options for [`LogBus::begin_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Run id the session tracks
    pub run_id: String,
    /// Display label
    pub label: String,
    /// Origin tag
    pub source: String,
    /// Initial metadata
    pub metadata: Value,
}

/// Handle finalizing a session.
pub struct SessionHandle {
    bus: Arc<LogBus>,
    id: String,
}

impl SessionHandle {
    /// The session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Finalize the session, merging extra metadata into the descriptor.
    pub fn end(self, status: SessionStatus, extra_metadata: Option<Value>) {
        self.bus.end_session(&self.id, status, extra_metadata);
    }
}

/// The streaming bus.
pub struct LogBus {
    tx: broadcast::Sender<LogEvent>,
    buffer: Mutex<VecDeque<LogEvent>>,
    buffer_capacity: usize,
    sessions: RwLock<HashMap<String, SessionDescriptor>>,
    event_counter: AtomicU64,
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBus {
    /// Create a bus with default capacities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    /// Create a bus with a custom ring buffer capacity.
    #[must_use]
    pub fn with_capacity(buffer_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE_CAPACITY);
        Self {
            tx,
            buffer: Mutex::new(VecDeque::with_capacity(buffer_capacity.min(256))),
            buffer_capacity,
            sessions: RwLock::new(HashMap::new()),
            event_counter: AtomicU64::new(1),
        }
    }

    /// Publish an event.
    pub fn publish(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        run_id: Option<&str>,
        context: Option<EventContext>,
    ) -> LogEvent {
        let context = context.map(|mut ctx| {
            if let Some(metadata) = ctx.metadata.take() {
                ctx.metadata = Some(sanitize_value(&metadata, 0));
            }
            ctx
        });

        let event = LogEvent {
            id: format!("evt-{}", self.event_counter.fetch_add(1, Ordering::Relaxed)),
            ts: Utc::now(),
            level,
            message: message.into(),
            run_id: run_id.map(String::from),
            context,
        };

        {
            let mut buffer = self.buffer.lock();
            if buffer.len() >= self.buffer_capacity {
                buffer.pop_front();
            }
            buffer.push_back(event.clone());
        }

        // Send fails only when nobody is subscribed, which is fine.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Register a subscriber with an optional filter.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, filter: EventFilter) -> BusSubscriber {
        BusSubscriber {
            bus: Arc::clone(self),
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Snapshot of buffered events matching a filter, oldest first.
    #[must_use]
    pub fn buffered_events(&self, filter: &EventFilter, limit: usize) -> Vec<LogEvent> {
        let buffer = self.buffer.lock();
        let matching: Vec<LogEvent> = buffer
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Begin a session.
    #[must_use]
    pub fn begin_session(self: &Arc<Self>, options: SessionOptions) -> SessionHandle {
        let id = format!("sess-{}", Uuid::new_v4());
        let descriptor = SessionDescriptor {
            id: id.clone(),
            label: options.label,
            source: options.source,
            run_id: options.run_id,
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Running,
            metadata: options.metadata,
        };
        self.sessions.write().insert(id.clone(), descriptor);
        debug!(session_id = %id, "Began bus session");
        SessionHandle {
            bus: Arc::clone(self),
            id,
        }
    }

    /// Finalize a session.
    pub fn end_session(&self, id: &str, status: SessionStatus, extra_metadata: Option<Value>) {
        let mut sessions = self.sessions.write();
        if let Some(descriptor) = sessions.get_mut(id) {
            descriptor.status = status;
            descriptor.ended_at = Some(Utc::now());
            if let Some(extra) = extra_metadata {
                merge_metadata(&mut descriptor.metadata, extra);
            }
            debug!(session_id = %id, status = ?status, "Ended bus session");
        }
    }

    /// Descriptors of all known sessions.
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionDescriptor> {
        let mut sessions: Vec<SessionDescriptor> =
            self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }
}

/// A registered subscriber. Events arrive in publication order; when the
/// subscriber falls more than the queue capacity behind, the oldest
/// pending events are dropped and a `SubscriberLagged` notice is
/// published.
pub struct BusSubscriber {
    bus: Arc<LogBus>,
    rx: broadcast::Receiver<LogEvent>,
    filter: EventFilter,
}

impl BusSubscriber {
    /// Receive the next matching event. `None` when the bus is gone.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.bus.publish(
                        LogLevel::Warn,
                        format!("SubscriberLagged: dropped {missed} pending events"),
                        self.filter.run_id.as_deref(),
                        None,
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive used by drain loops.
    pub fn try_recv(&mut self) -> Option<LogEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

/// Depth-capped copy of a metadata value; branches deeper than the cap
/// collapse to `"[Circular]"`.
fn sanitize_value(value: &Value, depth: usize) -> Value {
    if depth >= MAX_SANITIZE_DEPTH {
        return Value::String("[Circular]".to_string());
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(item, depth + 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_value(v, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn merge_metadata(base: &mut Value, extra: Value) {
    match (base, extra) {
        (Value::Object(base_map), Value::Object(extra_map)) => {
            for (k, v) in extra_map {
                base_map.insert(k, v);
            }
        }
        (base_slot, extra) => *base_slot = extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_events_in_fifo_order() {
        let bus = Arc::new(LogBus::new());
        let mut sub = bus.subscribe(EventFilter::default());
        bus.publish(LogLevel::Info, "first", Some("run-1"), None);
        bus.publish(LogLevel::Error, "second", Some("run-1"), None);

        assert_eq!(sub.recv().await.unwrap().message, "first");
        assert_eq!(sub.recv().await.unwrap().message, "second");
    }

    #[tokio::test]
    async fn run_and_level_filters_apply() {
        let bus = Arc::new(LogBus::new());
        let mut sub = bus.subscribe(EventFilter {
            run_id: Some("run-x".to_string()),
            levels: Some(vec![LogLevel::Error]),
        });
        bus.publish(LogLevel::Error, "other run", Some("run-y"), None);
        bus.publish(LogLevel::Info, "wrong level", Some("run-x"), None);
        bus.publish(LogLevel::Error, "match", Some("run-x"), None);

        assert_eq!(sub.recv().await.unwrap().message, "match");
    }

    #[test]
    fn ring_buffer_retains_recent_history() {
        let bus = LogBus::with_capacity(3);
        for i in 0..5 {
            bus.publish(LogLevel::Info, format!("event-{i}"), None, None);
        }
        let events = bus.buffered_events(&EventFilter::default(), 10);
        let messages: Vec<&str> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["event-2", "event-3", "event-4"]);
    }

    #[test]
    fn buffered_events_honors_limit_keeping_newest() {
        let bus = LogBus::new();
        for i in 0..10 {
            bus.publish(LogLevel::Info, format!("event-{i}"), None, None);
        }
        let events = bus.buffered_events(&EventFilter::default(), 2);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].message, "event-9");
    }

    #[test]
    fn session_lifecycle_is_tracked() {
        let bus = Arc::new(LogBus::new());
        let handle = bus.begin_session(SessionOptions {
            run_id: "run-1".to_string(),
            label: "nightly".to_string(),
            source: "cli".to_string(),
            metadata: json!({"env": "ci"}),
        });
        let id = handle.id().to_string();
        assert_eq!(bus.list_sessions()[0].status, SessionStatus::Running);

        handle.end(SessionStatus::Success, Some(json!({"suites": 3})));
        let sessions = bus.list_sessions();
        assert_eq!(sessions[0].id, id);
        assert_eq!(sessions[0].status, SessionStatus::Success);
        assert!(sessions[0].ended_at.is_some());
        assert_eq!(sessions[0].metadata["env"], json!("ci"));
        assert_eq!(sessions[0].metadata["suites"], json!(3));
    }

    #[test]
    fn event_ids_are_monotonic() {
        let bus = LogBus::new();
        let first = bus.publish(LogLevel::Info, "a", None, None);
        let second = bus.publish(LogLevel::Info, "b", None, None);
        assert_eq!(first.id, "evt-1");
        assert_eq!(second.id, "evt-2");
    }

    #[test]
    fn error_sanitization_keeps_message_and_kind() {
        let err = Error::CaptureFailed {
            name: "token".to_string(),
            source: Box::new(Error::JsValidation("forbidden token: require".to_string())),
        };
        let sanitized = SanitizedError::from(&err);
        assert_eq!(sanitized.name, "capture_failed");
        assert!(sanitized.message.contains("token"));
        assert!(sanitized.stack.unwrap().contains("forbidden token"));
    }

    #[test]
    fn oversized_metadata_is_depth_capped() {
        let mut value = json!("leaf");
        for _ in 0..80 {
            value = json!({ "next": value });
        }
        let bus = LogBus::new();
        let event = bus.publish(
            LogLevel::Info,
            "deep",
            None,
            Some(EventContext::default().with_metadata(value)),
        );
        let rendered = serde_json::to_string(&event).unwrap();
        assert!(rendered.contains("[Circular]"));
    }
}
