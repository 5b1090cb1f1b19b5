//! Observability for the control plane.
//!
//! The collector rides the event bus: it never reads coordinator state
//! directly except through published snapshots handed to
//! [`MetricsCollector::health_report`].

/// Event-driven counters, heartbeats and alerts.
pub mod collector;
/// Alert and health report types.
pub mod health;
/// Lock-free counters and gauges.
pub mod lockfree;
/// Sliding-window trend classifier.
pub mod trend;

pub use collector::{
    ALERTS_TOTAL, CONSENSUS_EFFICIENCY, CONSENSUS_FAILED_TOTAL, CONSENSUS_SUCCEEDED_TOTAL,
    COUPLING_HEALTH, COUPLING_TUNES_TOTAL, ERROR_EVENTS_TOTAL, EVENTS_TOTAL, MetricsCollector,
};
pub use health::{Alert, AlertSeverity, HealthReport, HealthStatus, LaneHealth};
pub use lockfree::{LockFreeCounter, LockFreeGauge};
pub use trend::{TREND_THRESHOLD, TrendWindow, classify_series};
