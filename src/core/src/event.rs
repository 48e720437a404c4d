use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Event key type
pub type EventKey = String;

/// Relocation progress event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelocationEvent {
    /// Event key (e.g., "image.copied", "collocation.found")
    pub key: EventKey,

    /// Image URL the event is about
    pub url: String,

    /// Free-form detail (destination URL, error message, ...)
    pub detail: Option<String>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RelocationEvent {
    /// Create a new event
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            detail: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Create an event with a detail string
    pub fn with_detail(
        key: impl Into<String>,
        url: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(key, url)
        }
    }
}

/// Event emitter
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<RelocationEvent>>,
}

impl EventEmitter {
    /// Create a new event emitter
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Emit an event. Dropped silently when nobody listens.
    pub fn emit(&self, event: RelocationEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<RelocationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Event catalog - predefined event keys
pub mod events {
    pub const IMAGE_COPYING: &str = "image.copying";
    pub const IMAGE_COPIED: &str = "image.copied";
    pub const IMAGE_SKIPPED: &str = "image.skipped";
    pub const IMAGE_FAILED: &str = "image.failed";

    pub const COLLOCATION_FOUND: &str = "collocation.found";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let emitter = EventEmitter::new(8);
        let mut rx = emitter.subscribe();

        emitter.emit(RelocationEvent::with_detail(
            events::IMAGE_COPIED,
            "registry.io/app@sha256:aa",
            "dst.io/app@sha256:aa",
        ));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.key, events::IMAGE_COPIED);
        assert_eq!(event.url, "registry.io/app@sha256:aa");
        assert_eq!(event.detail.as_deref(), Some("dst.io/app@sha256:aa"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let emitter = EventEmitter::default();
        emitter.emit(RelocationEvent::new(events::IMAGE_SKIPPED, "a@sha256:00"));
    }

    #[test]
    fn test_event_serializes() {
        let event = RelocationEvent::new(events::IMAGE_FAILED, "a@sha256:00");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("image.failed"));
    }
}
