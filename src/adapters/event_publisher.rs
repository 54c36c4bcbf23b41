//! Event Publisher Adapters
//!
//! [`LoggingEventPublisher`] turns domain events into structured log
//! records and is what the controller uses unless told otherwise.
//! [`InMemoryEventCollector`] keeps every event so tests can assert on
//! controller outcomes.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// How loudly an event is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Debug,
    Info,
    Warn,
}

fn severity(event: &DomainEvent) -> Severity {
    match event {
        DomainEvent::ProvisioningFailed { .. }
        | DomainEvent::VolumePersistAbandoned { .. }
        | DomainEvent::VolumeDeleteFailed { .. }
        | DomainEvent::LeadershipLost { .. } => Severity::Warn,
        DomainEvent::VolumePersistFailed { .. } | DomainEvent::VolumePersisted { .. } => {
            Severity::Debug
        }
        _ => Severity::Info,
    }
}

/// Publishes domain events as log records.
///
/// Failures and lost leadership are logged at warn, persistence retries at
/// debug and everything else at info. The full event is attached as JSON.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher;

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let claim = event.claim().unwrap_or_default();
        let volume = event.volume().unwrap_or_default();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        match severity(&event) {
            Severity::Warn => warn!(event_type, claim, volume, event = %json, "Domain event"),
            Severity::Info => info!(event_type, claim, volume, event = %json, "Domain event"),
            Severity::Debug => debug!(event_type, claim, volume, event = %json, "Domain event"),
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

/// Keeps published events for inspection in tests.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events whose [`DomainEvent::event_type`] is `event_type`
    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    pub fn count_of_type(&self, event_type: &str) -> usize {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .count()
    }

    /// Events about one volume, oldest first
    pub fn events_for_volume(&self, volume: &str) -> Vec<DomainEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.volume() == Some(volume))
            .cloned()
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_log_at_warn() {
        let failed = DomainEvent::provisioning_failed("default/claim-1", "class-1", "boom", true);
        assert_eq!(severity(&failed), Severity::Warn);
        let abandoned = DomainEvent::volume_persist_abandoned("pvc-uid-1", 3);
        assert_eq!(severity(&abandoned), Severity::Warn);

        let retry = DomainEvent::volume_persist_failed("pvc-uid-1", 1, "fake error");
        assert_eq!(severity(&retry), Severity::Debug);
        let acquired = DomainEvent::leadership_acquired("replica-a", "default/foo.bar-baz");
        assert_eq!(severity(&acquired), Severity::Info);
    }

    #[tokio::test]
    async fn test_logging_publisher_accepts_every_event() {
        let publisher = LoggingEventPublisher::new();
        publisher
            .publish_all(vec![
                DomainEvent::volume_persisted("pvc-uid-1", 1),
                DomainEvent::volume_deleted("pvc-uid-1", "class-1"),
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collector_filters() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector
            .publish_all(vec![
                DomainEvent::volume_persist_failed("pvc-uid-1", 1, "fake error"),
                DomainEvent::volume_persisted("pvc-uid-1", 2),
            ])
            .await
            .unwrap();
        collector
            .publish(DomainEvent::provisioning_succeeded(
                "default/claim-2",
                "pvc-uid-2",
                "class-1",
            ))
            .await
            .unwrap();

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.count_of_type("VolumePersisted"), 1);
        assert_eq!(collector.events_of_type("ProvisioningSucceeded").len(), 1);

        let types: Vec<_> = collector
            .events_for_volume("pvc-uid-1")
            .iter()
            .map(DomainEvent::event_type)
            .collect();
        assert_eq!(types, vec!["VolumePersistFailed", "VolumePersisted"]);
    }
}
