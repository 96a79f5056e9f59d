//! Event types for the vcstream event system
//!
//! Provides shared event definitions and the EventBus used to fan pipeline,
//! registry and conversion-mode progress out to SSE clients and logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// vcstream event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VcsEvent {
    /// A conversion run was accepted and is about to submit its first job
    PipelineStarted {
        run_id: Uuid,
        singer: String,
        track: String,
        timestamp: DateTime<Utc>,
    },

    /// One pipeline stage was enqueued on the batch scheduler
    StageSubmitted {
        run_id: Uuid,
        /// Stage name ("separate", "infer", "combine", "cleanup")
        stage: String,
        job_id: u64,
        /// Job this stage waits on, if any
        depends_on: Option<u64>,
        timestamp: DateTime<Utc>,
    },

    /// Combined artifact downloaded locally
    PipelineCompleted {
        run_id: Uuid,
        local_path: String,
        timestamp: DateTime<Utc>,
    },

    /// Run aborted
    PipelineFailed {
        run_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Conversion mode switched on or off
    ConversionModeChanged {
        active: bool,
        singer: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A singer finished training (weights and index present)
    SingerReady {
        name: String,
        timestamp: DateTime<Utc>,
    },
}

impl VcsEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &str {
        match self {
            VcsEvent::PipelineStarted { .. } => "PipelineStarted",
            VcsEvent::StageSubmitted { .. } => "StageSubmitted",
            VcsEvent::PipelineCompleted { .. } => "PipelineCompleted",
            VcsEvent::PipelineFailed { .. } => "PipelineFailed",
            VcsEvent::ConversionModeChanged { .. } => "ConversionModeChanged",
            VcsEvent::SingerReady { .. } => "SingerReady",
        }
    }
}

/// Central event distribution bus
///
/// Wraps `tokio::sync::broadcast`: publishing never blocks, slow subscribers
/// observe `Lagged`, and dropped receivers are cleaned up automatically.
///
/// # Examples
///
/// ```
/// use vcs_common::events::{EventBus, VcsEvent};
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(VcsEvent::SingerReady {
///     name: "iu".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(rx.try_recv().is_ok());
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VcsEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<VcsEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: VcsEvent) -> Result<usize, broadcast::error::SendError<VcsEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring the case where nobody is listening
    pub fn emit_lossy(&self, event: VcsEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("No subscribers for event {}", e.0.event_type());
        }
    }

    /// Current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
