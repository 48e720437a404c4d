//! Progress output for relocation events.

use imgpkg_core::event::{events, EventEmitter, RelocationEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Render one event as a `copy | ...` line.
pub fn format_event(event: &RelocationEvent) -> String {
    let detail = event.detail.as_deref().unwrap_or_default();
    match event.key.as_str() {
        events::IMAGE_COPYING => format!("copy | copying {} -> {}", event.url, detail),
        events::IMAGE_COPIED => format!("copy | done copying {}", event.url),
        events::IMAGE_SKIPPED => format!("copy | skipping {}, already present as {}", event.url, detail),
        events::IMAGE_FAILED => format!("copy | failed {}: {}", event.url, detail),
        events::COLLOCATION_FOUND => format!("copy | found {} next to bundle as {}", event.url, detail),
        other => format!("copy | {} {}", other, event.url),
    }
}

/// Print events until every emitter is dropped.
pub fn spawn_event_printer(emitter: &EventEmitter) -> JoinHandle<()> {
    let mut rx = emitter.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => println!("{}", format_event(&event)),
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Progress output fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
