//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Delivery of outcome events to the telemetry queue."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use salt_updater_persistence::{EventQueue, PersistenceError};
use tracing::info;

use crate::outcome::OutcomeEvent;

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("event queue error: {0}")]
    Queue(#[from] PersistenceError),
    #[error("event queue task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Hands outcome events to the telemetry pipeline.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: &OutcomeEvent) -> Result<(), EmitError>;
}

/// Appends events to the on-device queue file read by the telemetry reporter.
pub struct EventQueueEmitter {
    queue: Arc<Mutex<EventQueue<OutcomeEvent>>>,
}

impl EventQueueEmitter {
    pub fn open(path: &Path) -> Result<Self, EmitError> {
        Ok(Self {
            queue: Arc::new(Mutex::new(EventQueue::open(path)?)),
        })
    }
}

#[async_trait]
impl EventEmitter for EventQueueEmitter {
    async fn emit(&self, event: &OutcomeEvent) -> Result<(), EmitError> {
        let queue = Arc::clone(&self.queue);
        let owned = event.clone();
        let sequence = tokio::task::spawn_blocking(move || queue.lock().push(&owned)).await??;
        info!(sequence, event_type = %event.event_type, "outcome event queued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::build_event;
    use salt_updater_persistence::{read_queued, UpdateState};

    #[tokio::test]
    async fn events_land_in_the_queue_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let emitter = EventQueueEmitter::open(&path).unwrap();

        let state = UpdateState {
            last_call_output: "Succeeded: 3 (changed=1)\nFailed: 0\n".into(),
            last_call_succeeded: true,
            last_call_node_group: "dev-pis".into(),
            ..UpdateState::default()
        };
        let event = build_event(&state, Some("pi-7")).unwrap();
        emitter.emit(&event).await.unwrap();
        emitter.emit(&event).await.unwrap();

        let queued = read_queued::<OutcomeEvent>(&path).unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[1].sequence, 2);
        assert_eq!(queued[0].event, event);
        assert_eq!(queued[0].event.details.succeeded, 3.0);
        assert_eq!(queued[0].event.details.minion_id.as_deref(), Some("pi-7"));
        assert!(queued[0].event.details.out.is_none());
    }

    #[tokio::test]
    async fn queued_events_keep_the_reporter_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let emitter = EventQueueEmitter::open(&path).unwrap();

        let state = UpdateState {
            last_call_output: "Succeeded: 1 (changed=0)\nFailed: 2\nTotal run time: 4.5 s\n".into(),
            last_call_succeeded: false,
            ..UpdateState::default()
        };
        emitter
            .emit(&build_event(&state, Some("pi-9")).unwrap())
            .await
            .unwrap();

        let raw = read_queued::<serde_json::Value>(&path).unwrap();
        let details = &raw[0].event["details"];
        assert_eq!(raw[0].event["type"], "salt-update");
        assert_eq!(details["minionID"], "pi-9");
        assert_eq!(details["runTime"], 4.5);
        assert!(details["out"].as_str().unwrap().contains("Failed: 2"));
    }
}
