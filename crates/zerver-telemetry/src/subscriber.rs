//! Telemetry Subscribers
//!
//! A subscriber receives every event synchronously in the request task.
//! Handlers must not block; anything heavy belongs on a queue behind the
//! subscriber (the OTLP exporter does exactly that).

use std::sync::Mutex;

use crate::event::TelemetryEvent;

/// Synchronous event consumer. The subscriber list is fixed at server
/// start; no registration happens during request processing.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &TelemetryEvent);
}

/// In-memory subscriber collecting every event. Test and diagnostics use.
#[derive(Default)]
pub struct MemorySubscriber {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemorySubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TelemetryEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Subscriber for MemorySubscriber {
    fn on_event(&self, event: &TelemetryEvent) {
        self.lock().push(event.clone());
    }
}
