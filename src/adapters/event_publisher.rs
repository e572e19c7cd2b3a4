//! Event Publisher Adapter
//!
//! Implements the `EventPublisher` port with various backends.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, ObjectId};
use crate::error::Result;

/// Logging-based event publisher.
///
/// Publishes domain events to the tracing/logging system as JSON.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventPublisher {
    /// Create a new logging event publisher (debug level).
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a publisher that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(event_type = %event_type, event = %json, "Domain event");
        } else {
            debug!(event_type = %event_type, event = %json, "Domain event");
        }

        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// In-memory event collector for testing.
///
/// Collects events in memory for later inspection during tests.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    /// Create a new in-memory event collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().clone()
    }

    /// Get the count of collected events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Check if there are no events.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clear all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Event type names concerning one object, in publication order.
    pub fn history(&self, object_id: ObjectId) -> Vec<&'static str> {
        self.events
            .read()
            .iter()
            .filter(|e| e.object_id() == Some(object_id))
            .map(|e| e.event_type())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}
