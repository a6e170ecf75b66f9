//! Domain event bus: trait for publishing segment and campaign lifecycle
//! events from any module.
//!
//! Modules accept an `Arc<dyn EventSink>`; the transport (queue, webhook,
//! analytics pipeline) lives behind the trait.

use crate::types::{DomainEvent, EventType};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// No-op sink for modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: DomainEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: DomainEvent) {
        self.events.lock().push(event);
    }
}

/// Builder for a `DomainEvent` with no entity references attached yet.
pub fn make_event(event_type: EventType) -> DomainEvent {
    DomainEvent {
        event_id: Uuid::new_v4(),
        event_type,
        segment_id: None,
        campaign_id: None,
        customer_id: None,
        detail: None,
        node_id: "local".into(),
        timestamp: Utc::now(),
    }
}

impl DomainEvent {
    pub fn with_segment(mut self, id: Uuid) -> Self {
        self.segment_id = Some(id);
        self
    }

    pub fn with_campaign(mut self, id: Uuid) -> Self {
        self.campaign_id = Some(id);
        self
    }

    pub fn with_customer(mut self, id: Uuid) -> Self {
        self.customer_id = Some(id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
