//! Alerts and the aggregate health report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lane::LaneStatus;
use crate::types::{Dimension, LaneId};

/// Alert severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Worth knowing.
    Info,
    /// Degraded but working.
    Warning,
    /// Needs an operator.
    Critical,
}

impl AlertSeverity {
    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

/// One raised alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// How bad it is.
    pub severity: AlertSeverity,
    /// Entity or series that raised it.
    pub source: String,
    /// Human readable description.
    pub message: String,
    /// When it was raised.
    pub at: DateTime<Utc>,
}

/// Health status levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Score at or above 0.8 and every lane reporting.
    Healthy,
    /// Score at or above 0.5, or a lane stopped reporting.
    Degraded,
    /// Anything worse.
    Unhealthy,
}

/// Per-lane line of a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneHealth {
    /// Lane id.
    pub lane: LaneId,
    /// Axis.
    pub dimension: Dimension,
    /// Lifecycle status.
    pub status: LaneStatus,
    /// Snapshot health score.
    pub score: f64,
    /// Whether the heartbeat is overdue.
    pub stale: bool,
}

/// Point-in-time view of the whole control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall status.
    pub status: HealthStatus,
    /// Overall score in [0, 1].
    pub score: f64,
    /// Lane lines in registry order.
    pub lanes: Vec<LaneHealth>,
    /// Mean coupling health, when any coupling has been measured.
    pub coupling_health: Option<f64>,
    /// Share of observed events that were errors.
    pub error_rate: f64,
    /// Retained alerts per severity: info, warning, critical.
    pub alert_counts: [usize; 3],
    /// When the report was built.
    pub at: DateTime<Utc>,
}

impl HealthReport {
    pub(crate) fn status_for(score: f64, any_stale: bool) -> HealthStatus {
        if score >= 0.8 && !any_stale {
            HealthStatus::Healthy
        } else if score >= 0.5 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_lanes_cap_status_at_degraded() {
        assert_eq!(HealthReport::status_for(0.95, false), HealthStatus::Healthy);
        assert_eq!(HealthReport::status_for(0.95, true), HealthStatus::Degraded);
        assert_eq!(HealthReport::status_for(0.5, false), HealthStatus::Degraded);
        assert_eq!(HealthReport::status_for(0.49, false), HealthStatus::Unhealthy);
        assert_eq!(HealthReport::status_for(0.2, true), HealthStatus::Unhealthy);
    }

    #[test]
    fn severities_order_by_urgency() {
        assert!(AlertSeverity::Info < AlertSeverity::Critical);
        assert_eq!(AlertSeverity::Warning as usize, 1);
        assert_eq!(AlertSeverity::Critical.label(), "critical");
    }
}
