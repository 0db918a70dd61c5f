//! Event Publisher Adapters
//!
//! Sinks for [`EngineEvent`]s: the tracing log, an in-memory collector for
//! tests, and a fan-out over several sinks.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::events::EngineEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Publishes engine events to the tracing system.
///
/// Per-call events are chatty, so the default level is `debug`.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher {
    info_level: bool,
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log every event at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Log every event at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        let event_type = event.event_type();
        let method = event.method().unwrap_or("-");
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        if self.info_level {
            info!(event_type = %event_type, method = %method, event = %json, "Engine event");
        } else {
            debug!(event_type = %event_type, method = %method, event = %json, "Engine event");
        }

        Ok(())
    }
}

/// Collects events in memory for later inspection.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<EngineEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events, oldest first.
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events whose [`EngineEvent::event_type`] equals `event_type`.
    pub fn events_of_type(&self, event_type: &str) -> Vec<EngineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Number of events of one type.
    pub fn count_of(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<EngineEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Publishes every event to each inner publisher in order.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<std::sync::Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher(mut self, publisher: std::sync::Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("publisher_count", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: EngineEvent) -> Result<()> {
        for publisher in &self.publishers {
            publisher.publish(event.clone()).await?;
        }
        Ok(())
    }
}
