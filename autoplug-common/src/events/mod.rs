//! Event types for the autoplug notification system
//!
//! Provides the front-end notification enum and the EventBus that carries it.

mod stream_types;

pub use stream_types::{StreamClassification, StreamInfo};

use crate::caps::Caps;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Severity class of a reported failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No factory candidates at all for a required capability
    MissingElement,
    /// Group committed with no playable stream
    NoPlayableStream,
    /// Subtitle stream present with no video stream to render onto
    SubtitleWithoutVideo,
}

/// Autoplug notification events
///
/// Events are broadcast via EventBus and can be serialized for logging or
/// remote transmission. Every front-end callback of the engine maps to one
/// variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AutoplugEvent {
    /// A terminal elementary stream was added to the building group
    NewElementaryStream {
        group_id: Uuid,
        stream: StreamInfo,
        /// True on the last stream announced by one commit
        is_last_in_batch: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A previously exposed terminal stream went away
    StreamRemoved {
        group_id: Uuid,
        stream: StreamInfo,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// No element could handle a port's capability
    UnknownType {
        element: String,
        port: String,
        caps: Caps,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Buffering progress (0-100)
    BufferingPercent {
        percent: u8,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The building group moved to the queued list
    GroupCommitted {
        group_id: Uuid,
        stream_count: usize,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A group became the active (playing) group
    GroupSwitched {
        group_id: Uuid,
        streams: Vec<StreamInfo>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The active group finished and no successor will follow
    Drained {
        group_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Fatal group-level failure
    Error {
        kind: FailureKind,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl AutoplugEvent {
    /// Short variant name for log lines
    pub fn name(&self) -> &'static str {
        match self {
            AutoplugEvent::NewElementaryStream { .. } => "NewElementaryStream",
            AutoplugEvent::StreamRemoved { .. } => "StreamRemoved",
            AutoplugEvent::UnknownType { .. } => "UnknownType",
            AutoplugEvent::BufferingPercent { .. } => "BufferingPercent",
            AutoplugEvent::GroupCommitted { .. } => "GroupCommitted",
            AutoplugEvent::GroupSwitched { .. } => "GroupSwitched",
            AutoplugEvent::Drained { .. } => "Drained",
            AutoplugEvent::Error { .. } => "Error",
        }
    }
}

/// Central event distribution bus
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// Emitting never blocks, so it is safe from streaming threads.
///
/// # Examples
///
/// ```
/// use autoplug_common::events::{AutoplugEvent, EventBus};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(AutoplugEvent::BufferingPercent {
///     percent: 42,
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(AutoplugEvent::BufferingPercent { percent: 42, .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AutoplugEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<AutoplugEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: AutoplugEvent,
    ) -> Result<usize, broadcast::error::SendError<AutoplugEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: AutoplugEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
