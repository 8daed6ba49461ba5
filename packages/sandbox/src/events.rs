// ABOUTME: In-process status event bus for streaming executor stage transitions
// ABOUTME: Broadcast-based so any number of subscribers can follow a run without coupling to a transport

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Host-side stage names. Guest runner stages are forwarded verbatim.
pub mod stages {
    pub const PREPARING: &str = "preparing";
    pub const STARTING_CONTAINER: &str = "starting_container";
    pub const QUEUED: &str = "queued";
    pub const RUNNING: &str = "running";
    pub const COLLECTING_ARTIFACTS: &str = "collecting_artifacts";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const TIMEOUT: &str = "timeout";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub run_id: String,
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StatusEventBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl StatusEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, run_id: &str, stage: &str, message: impl Into<String>) {
        let event = StatusEvent {
            run_id: run_id.to_string(),
            stage: stage.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        };
        trace!(run_id = %event.run_id, stage = %event.stage, "{}", event.message);
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for StatusEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
