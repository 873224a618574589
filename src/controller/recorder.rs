//! Event recorders
//!
//! [`KubeEventRecorder`] publishes through the Kubernetes events API;
//! [`MemoryEventRecorder`] keeps events in memory for assertions.

use crate::domain::ports::{DiagnosticEvent, EventRecorder, EventSeverity};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

/// Publishes events to the API server as `blockstore-manager/<node>`
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, controller_id: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: "blockstore-manager".into(),
                instance: Some(controller_id.to_string()),
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, target: &ObjectReference, event: DiagnosticEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), target.clone());
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let reason = event.reason.clone();
        let result = recorder
            .publish(Event {
                type_,
                reason: event.reason,
                note: Some(event.note),
                action: event.action,
                secondary: None,
            })
            .await;
        if let Err(e) = result {
            warn!(
                "Failed to publish event {} on {}/{}: {}",
                reason,
                target.kind.as_deref().unwrap_or(""),
                target.name.as_deref().unwrap_or(""),
                e
            );
        }
    }
}

/// An event captured by [`MemoryEventRecorder`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub kind: String,
    pub name: String,
    pub event: DiagnosticEvent,
}

/// Keeps published events in order
#[derive(Debug, Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events with the given reason
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event.reason == reason)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn publish(&self, target: &ObjectReference, event: DiagnosticEvent) {
        self.events.lock().push(RecordedEvent {
            kind: target.kind.clone().unwrap_or_default(),
            name: target.name.clone().unwrap_or_default(),
            event,
        });
    }
}
