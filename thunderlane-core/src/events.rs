//! Event bus injected into every component.
//!
//! Every state transition is published as a named [`LaneEvent`] carrying the
//! entity id and the changed fields. Publishing never fails an operation:
//! components call [`publish_or_log`], which logs and swallows bus errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Event names published by the control plane.
pub mod names {
    /// A lane coordinator became active.
    pub const LANE_ACTIVATED: &str = "lane.activated";
    /// A lane coordinator paused its process.
    pub const LANE_PAUSED: &str = "lane.paused";
    /// A lane coordinator resumed its process.
    pub const LANE_RESUMED: &str = "lane.resumed";
    /// A lane entered maintenance.
    pub const LANE_MAINTENANCE: &str = "lane.maintenance";
    /// A lane coordinator shut down permanently.
    pub const LANE_SHUTDOWN: &str = "lane.shutdown";
    /// A lane coordinator failed.
    pub const LANE_ERROR: &str = "lane.error";
    /// A lane hot-swapped its rules.
    pub const LANE_RULES_APPLIED: &str = "lane.rules_applied";
    /// Periodic lane status ingestion.
    pub const LANE_SYNCED: &str = "lane.synced";
    /// Lane liveness ping.
    pub const LANE_HEARTBEAT: &str = "lane.heartbeat";
    /// A coupling was activated.
    pub const COUPLING_ACTIVATED: &str = "coupling.activated";
    /// A coupling was deactivated.
    pub const COUPLING_DEACTIVATED: &str = "coupling.deactivated";
    /// A coupling alpha gain was committed.
    pub const COUPLING_TUNED: &str = "coupling.tuned";
    /// A coupling performance sample was recorded.
    pub const COUPLING_MEASURED: &str = "coupling.measured";
    /// A coupling recorded an error.
    pub const COUPLING_ERROR: &str = "coupling.error";
    /// A ruleset was created or updated.
    pub const RULESET_VERSIONED: &str = "ruleset.versioned";
    /// A ruleset was activated and deployed.
    pub const RULESET_DEPLOYED: &str = "ruleset.deployed";
    /// A ruleset coupling matrix was hot-patched.
    pub const RULESET_ALPHA_TUNED: &str = "ruleset.alpha_tuned";
    /// A ruleset was deprecated or archived.
    pub const RULESET_RETIRED: &str = "ruleset.retired";
    /// A ruleset optimization score was recorded.
    pub const RULESET_OPTIMIZED: &str = "ruleset.optimized";
    /// A consensus burst finished (converged or not).
    pub const CONSENSUS_COMPLETED: &str = "consensus.completed";
    /// A topology was partitioned.
    pub const TOPOLOGY_PARTITIONED: &str = "topology.partitioned";
    /// Partitions were assigned to compute nodes.
    pub const TOPOLOGY_DISTRIBUTED: &str = "topology.distributed";
    /// Partitions were reassigned.
    pub const TOPOLOGY_REBALANCED: &str = "topology.rebalanced";
    /// A topology entered the error state.
    pub const TOPOLOGY_ERROR: &str = "topology.error";
    /// A rule oracle changed lifecycle state.
    pub const ORACLE_STATE: &str = "oracle.state";
    /// A rule oracle published new rule parameters.
    pub const ORACLE_RULES_UPDATED: &str = "oracle.rules_updated";
    /// The metrics collector raised an alert.
    pub const METRICS_ALERT: &str = "metrics.alert";
}

/// A named state-transition notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneEvent {
    /// Event name, see [`names`].
    pub name: String,
    /// Identifier of the entity that changed.
    pub entity_id: String,
    /// Changed fields.
    pub fields: Map<String, Value>,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

impl LaneEvent {
    /// Create an event with no changed fields.
    pub fn new(name: &str, entity_id: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            entity_id: entity_id.to_string(),
            fields: Map::new(),
            at: Utc::now(),
        }
    }

    /// Attach a changed field. Values that fail to serialize are skipped.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        if let Ok(value) = serde_json::to_value(value) {
            self.fields.insert(key.to_string(), value);
        }
        self
    }

    /// Read back a numeric field.
    #[must_use]
    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }
}

/// Errors surfaced by event bus implementations.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// No subscriber is listening.
    #[error("event bus has no subscribers for '{0}'")]
    NoSubscribers(String),
    /// The bus has been closed.
    #[error("event bus closed")]
    Closed,
}

/// Publish/subscribe notification sink.
pub trait EventBus: Send + Sync {
    /// Publish one event.
    fn publish(&self, event: &LaneEvent) -> Result<(), EventBusError>;
}

/// Publish an event, logging and swallowing any failure.
pub fn publish_or_log(bus: &dyn EventBus, event: LaneEvent) {
    if let Err(err) = bus.publish(&event) {
        warn!(event = %event.name, entity = %event.entity_id, "event publish failed: {err}");
    }
}

/// Tokio broadcast-backed bus; every subscriber sees every event.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<LaneEvent>,
}

impl BroadcastEventBus {
    /// Create a bus that buffers up to `capacity` events per lagging subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to subsequent events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LaneEvent> {
        self.tx.subscribe()
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: &LaneEvent) -> Result<(), EventBusError> {
        self.tx
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| EventBusError::NoSubscribers(event.name.clone()))
    }
}

/// Bus that records every event for later inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingEventBus {
    events: Arc<Mutex<Vec<LaneEvent>>>,
}

impl RecordingEventBus {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    #[must_use]
    pub fn events(&self) -> Vec<LaneEvent> {
        self.events.lock().clone()
    }

    /// Events with the given name.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<LaneEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.name == name)
            .cloned()
            .collect()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventBus for RecordingEventBus {
    fn publish(&self, event: &LaneEvent) -> Result<(), EventBusError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Bus that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn publish(&self, _event: &LaneEvent) -> Result<(), EventBusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    struct FailingBus;

    impl EventBus for FailingBus {
        fn publish(&self, _event: &LaneEvent) -> Result<(), EventBusError> {
            Err(EventBusError::Closed)
        }
    }

    #[test]
    fn recording_bus_captures_fields() {
        let bus = RecordingEventBus::new();
        publish_or_log(
            &bus,
            LaneEvent::new(names::COUPLING_TUNED, "c-1").with("alpha_gain", 0.25),
        );
        let events = bus.named(names::COUPLING_TUNED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].f64_field("alpha_gain"), Some(0.25));
    }

    #[test]
    fn failing_bus_is_swallowed() {
        publish_or_log(&FailingBus, LaneEvent::new(names::LANE_PAUSED, "lane-1"));
    }

    #[tokio::test]
    async fn broadcast_bus_delivers_to_subscribers() {
        let bus = BroadcastEventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(&LaneEvent::new(names::LANE_ACTIVATED, "lane-1"))
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, names::LANE_ACTIVATED);
    }

    #[test]
    fn broadcast_without_subscribers_reports_error() {
        let bus = BroadcastEventBus::new(8);
        let result = bus.publish(&LaneEvent::new(names::LANE_ACTIVATED, "lane-1"));
        assert!(matches!(result, Err(EventBusError::NoSubscribers(_))));
    }
}
