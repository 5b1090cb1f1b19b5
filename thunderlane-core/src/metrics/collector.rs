use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::health::{Alert, AlertSeverity, HealthReport, LaneHealth};
use super::lockfree::{LockFreeCounter, LockFreeGauge};
use super::trend::TrendWindow;
use crate::config::MetricsConfig;
use crate::coupling::PerformanceTrend;
use crate::events::{EventBus, LaneEvent, names, publish_or_log};
use crate::lane::LaneSnapshot;

/// Events observed by the collector.
pub const EVENTS_TOTAL: &str = "thunderlane_events_total";
/// Observed events whose name ends in `.error`.
pub const ERROR_EVENTS_TOTAL: &str = "thunderlane_error_events_total";
/// Consensus bursts that converged.
pub const CONSENSUS_SUCCEEDED_TOTAL: &str = "thunderlane_consensus_succeeded_total";
/// Consensus bursts that exhausted their budget.
pub const CONSENSUS_FAILED_TOTAL: &str = "thunderlane_consensus_failed_total";
/// Couplings retuned.
pub const COUPLING_TUNES_TOTAL: &str = "thunderlane_coupling_tunes_total";
/// Alerts raised.
pub const ALERTS_TOTAL: &str = "thunderlane_alerts_total";
/// Efficiency of the last consensus burst.
pub const CONSENSUS_EFFICIENCY: &str = "thunderlane_consensus_efficiency";
/// Health of the last measured coupling.
pub const COUPLING_HEALTH: &str = "thunderlane_coupling_health";

/// Error rate is not judged before this many events.
const ERROR_RATE_MIN_EVENTS: u64 = 20;

/// Collects counters, trends, heartbeats and alerts from the event stream.
pub struct MetricsCollector {
    config: MetricsConfig,
    heartbeat_timeout: Duration,
    counters: DashMap<&'static str, Arc<LockFreeCounter>>,
    gauges: DashMap<&'static str, Arc<LockFreeGauge>>,
    heartbeats: DashMap<String, DateTime<Utc>>,
    stale: Mutex<HashSet<String>>,
    series: Mutex<HashMap<String, TrendWindow>>,
    alerts: Mutex<VecDeque<Alert>>,
    error_rate_alerted: Mutex<bool>,
    bus: Arc<dyn EventBus>,
}

impl MetricsCollector {
    /// Create a collector; `heartbeat_timeout` bounds lane liveness.
    pub fn new(config: MetricsConfig, heartbeat_timeout: Duration, bus: Arc<dyn EventBus>) -> Self {
        Self {
            config,
            heartbeat_timeout,
            counters: DashMap::new(),
            gauges: DashMap::new(),
            heartbeats: DashMap::new(),
            stale: Mutex::new(HashSet::new()),
            series: Mutex::new(HashMap::new()),
            alerts: Mutex::new(VecDeque::new()),
            error_rate_alerted: Mutex::new(false),
            bus,
        }
    }

    /// Add to a named counter.
    pub fn increment_counter(&self, name: &'static str, delta: u64) {
        self.counters
            .entry(name)
            .or_insert_with(|| Arc::new(LockFreeCounter::new()))
            .increment(delta);
    }

    /// Overwrite a named gauge.
    pub fn record_gauge(&self, name: &'static str, value: f64) {
        self.gauges
            .entry(name)
            .or_insert_with(|| Arc::new(LockFreeGauge::new()))
            .set(value);
    }

    /// Counter value; zero when never incremented.
    #[must_use]
    pub fn counter_value(&self, name: &'static str) -> u64 {
        self.counters.get(name).map_or(0, |counter| counter.get())
    }

    /// Latest gauge reading if available.
    #[must_use]
    pub fn gauge_value(&self, name: &'static str) -> Option<f64> {
        self.gauges.get(name).map(|gauge| gauge.get())
    }

    /// Append to a named series and classify it.
    ///
    /// A series turning to `degrading` raises a warning.
    pub fn observe(&self, series: &str, value: f64) -> PerformanceTrend {
        let (before, after) = {
            let mut all = self.series.lock();
            let window = all
                .entry(series.to_owned())
                .or_insert_with(|| TrendWindow::new(self.config.trend_window));
            let before = window.trend();
            window.push(value);
            (before, window.trend())
        };
        if after == PerformanceTrend::Degrading && before != PerformanceTrend::Degrading {
            self.raise(
                AlertSeverity::Warning,
                series,
                format!("{series} is degrading (latest {value:.3})"),
            );
        }
        after
    }

    /// Current classification of a series.
    #[must_use]
    pub fn trend(&self, series: &str) -> PerformanceTrend {
        self.series
            .lock()
            .get(series)
            .map_or(PerformanceTrend::Unknown, TrendWindow::trend)
    }

    /// Record a liveness ping from `source`.
    pub fn record_heartbeat(&self, source: &str, at: DateTime<Utc>) {
        self.heartbeats.insert(source.to_owned(), at);
        if self.stale.lock().remove(source) {
            info!(lane = source, "heartbeat recovered");
        }
    }

    /// Stop tracking liveness for `source`.
    pub fn forget_heartbeat(&self, source: &str) {
        self.heartbeats.remove(source);
        self.stale.lock().remove(source);
    }

    /// Sources whose last heartbeat is older than the timeout at `now`.
    ///
    /// Each source raises one critical alert per outage.
    pub fn check_heartbeats(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let mut overdue: Vec<(String, DateTime<Utc>)> = self
            .heartbeats
            .iter()
            .filter(|entry| now.signed_duration_since(*entry.value()) > timeout)
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        overdue.sort();
        for (source, last) in &overdue {
            let newly_stale = self.stale.lock().insert(source.clone());
            if newly_stale {
                self.raise(
                    AlertSeverity::Critical,
                    source,
                    format!("no heartbeat since {}", last.to_rfc3339()),
                );
            }
        }
        overdue.into_iter().map(|(source, _)| source).collect()
    }

    /// Record an alert, publish it and keep it in the bounded history.
    pub fn raise(&self, severity: AlertSeverity, source: &str, message: String) {
        match severity {
            AlertSeverity::Info => info!(source, severity = severity.label(), "{message}"),
            AlertSeverity::Warning | AlertSeverity::Critical => {
                warn!(source, severity = severity.label(), "{message}");
            }
        }
        let alert = Alert {
            severity,
            source: source.to_owned(),
            message,
            at: Utc::now(),
        };
        publish_or_log(
            self.bus.as_ref(),
            LaneEvent::new(names::METRICS_ALERT, source)
                .with("severity", severity.label())
                .with("message", &alert.message),
        );
        self.increment_counter(ALERTS_TOTAL, 1);
        let mut alerts = self.alerts.lock();
        if alerts.len() >= self.config.alert_history.max(1) {
            alerts.pop_front();
        }
        alerts.push_back(alert);
    }

    /// Retained alerts, oldest first.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    /// Share of observed events that were errors.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.counter_value(EVENTS_TOTAL);
        if total == 0 {
            return 0.0;
        }
        self.counter_value(ERROR_EVENTS_TOTAL) as f64 / total as f64
    }

    /// Fold one bus event into counters, series and heartbeats.
    pub fn ingest(&self, event: &LaneEvent) {
        self.increment_counter(EVENTS_TOTAL, 1);
        let name = event.name.as_str();
        match name {
            names::LANE_ACTIVATED | names::LANE_HEARTBEAT => {
                self.record_heartbeat(&event.entity_id, event.at);
            }
            names::LANE_SYNCED => {
                self.record_heartbeat(&event.entity_id, event.at);
                self.check_queue(event);
                if let Some(health) = event.f64_field("health") {
                    self.observe(&format!("lane.{}.health", event.entity_id), health);
                }
            }
            names::LANE_SHUTDOWN => {
                self.forget_heartbeat(&event.entity_id);
                self.series.lock().remove(&format!("lane.{}.health", event.entity_id));
            }
            names::COUPLING_TUNED => self.increment_counter(COUPLING_TUNES_TOTAL, 1),
            names::COUPLING_MEASURED => {
                if let Some(health) = event.f64_field("health") {
                    self.record_gauge(COUPLING_HEALTH, health);
                    self.observe(&format!("coupling.{}.health", event.entity_id), health);
                }
            }
            names::CONSENSUS_COMPLETED => {
                let success = event.fields.get("success").and_then(serde_json::Value::as_bool);
                if success == Some(true) {
                    self.increment_counter(CONSENSUS_SUCCEEDED_TOTAL, 1);
                } else {
                    self.increment_counter(CONSENSUS_FAILED_TOTAL, 1);
                    self.raise(
                        AlertSeverity::Info,
                        &event.entity_id,
                        "consensus burst exhausted its step budget".to_owned(),
                    );
                }
                if let Some(efficiency) = event.f64_field("efficiency_score") {
                    self.record_gauge(CONSENSUS_EFFICIENCY, efficiency);
                }
            }
            _ => {}
        }
        if name.ends_with(".error") {
            self.increment_counter(ERROR_EVENTS_TOTAL, 1);
            self.raise(
                AlertSeverity::Warning,
                &event.entity_id,
                format!("{name}: {}", describe(event)),
            );
        }
        self.check_error_rate();
    }

    fn check_queue(&self, event: &LaneEvent) {
        let (Some(depth), Some(max)) = (event.f64_field("queue_depth"), event.f64_field("max_queue"))
        else {
            return;
        };
        if max > 0.0 && depth / max >= self.config.queue_depth_alert_ratio {
            self.raise(
                AlertSeverity::Warning,
                &event.entity_id,
                format!("queue at {depth:.0} of {max:.0}"),
            );
        }
    }

    fn check_error_rate(&self) {
        if self.counter_value(EVENTS_TOTAL) < ERROR_RATE_MIN_EVENTS {
            return;
        }
        let rate = self.error_rate();
        let above = rate > self.config.error_rate_alert;
        let crossed = {
            let mut alerted = self.error_rate_alerted.lock();
            let crossed = above && !*alerted;
            *alerted = above;
            crossed
        };
        if crossed {
            self.raise(
                AlertSeverity::Warning,
                "events",
                format!("error rate {:.1}% above threshold", rate * 100.0),
            );
        }
    }

    /// Aggregate report over the given lanes.
    ///
    /// The score is the mean of lane health and, when present, coupling health.
    /// A live lane with an overdue heartbeat caps the status at degraded.
    #[must_use]
    pub fn health_report(&self, lanes: &[LaneSnapshot], coupling_health: Option<f64>) -> HealthReport {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let lines: Vec<LaneHealth> = lanes
            .iter()
            .map(|lane| LaneHealth {
                lane: lane.id,
                dimension: lane.dimension,
                status: lane.status,
                score: lane.health_score(),
                stale: lane.status.is_live()
                    && lane
                        .last_heartbeat_at
                        .is_none_or(|at| now.signed_duration_since(at) > timeout),
            })
            .collect();

        let mut parts: Vec<f64> = lines.iter().map(|line| line.score).collect();
        parts.extend(coupling_health);
        let score = if parts.is_empty() {
            0.0
        } else {
            (parts.iter().sum::<f64>() / parts.len() as f64).clamp(0.0, 1.0)
        };
        let any_stale = lines.iter().any(|line| line.stale);

        let mut alert_counts = [0usize; 3];
        for alert in self.alerts.lock().iter() {
            alert_counts[alert.severity as usize] += 1;
        }
        let report = HealthReport {
            status: HealthReport::status_for(score, any_stale),
            score,
            lanes: lines,
            coupling_health,
            error_rate: self.error_rate(),
            alert_counts,
            at: now,
        };
        debug!(status = ?report.status, score, "health report built");
        report
    }

    /// Consume `events` until `shutdown` changes, checking heartbeats every
    /// half timeout.
    pub fn spawn(
        self: Arc<Self>,
        mut events: broadcast::Receiver<LaneEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("metrics collector starting");
            let mut ticker = tokio::time::interval((self.heartbeat_timeout / 2).max(Duration::from_millis(10)));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        self.check_heartbeats(Utc::now());
                    }
                    received = events.recv() => match received {
                        Ok(event) => self.ingest(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "metrics collector lagged behind the event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            info!("metrics collector stopped");
        })
    }
}

fn describe(event: &LaneEvent) -> String {
    ["reason", "message"]
        .iter()
        .find_map(|key| event.fields.get(*key).and_then(serde_json::Value::as_str))
        .unwrap_or("no detail")
        .to_owned()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::events::RecordingEventBus;
    use crate::metrics::HealthStatus;
    use crate::types::LaneId;

    fn collector() -> (MetricsCollector, RecordingEventBus) {
        let bus = RecordingEventBus::new();
        let collector = MetricsCollector::new(
            MetricsConfig {
                alert_history: 4,
                ..MetricsConfig::default()
            },
            Duration::from_secs(10),
            Arc::new(bus.clone()),
        );
        (collector, bus)
    }

    #[test]
    fn counters_and_gauges() {
        let (collector, _) = collector();
        collector.increment_counter(EVENTS_TOTAL, 2);
        collector.increment_counter(EVENTS_TOTAL, 3);
        collector.record_gauge(COUPLING_HEALTH, 0.4);
        assert_eq!(collector.counter_value(EVENTS_TOTAL), 5);
        assert_eq!(collector.counter_value(ALERTS_TOTAL), 0);
        assert_eq!(collector.gauge_value(COUPLING_HEALTH), Some(0.4));
        assert_eq!(collector.gauge_value(CONSENSUS_EFFICIENCY), None);
    }

    #[test]
    fn stale_heartbeat_alerts_once_per_outage() {
        let (collector, bus) = collector();
        let lane = LaneId::new().to_string();
        let start = Utc::now();
        collector.record_heartbeat(&lane, start);
        assert!(collector.check_heartbeats(start + chrono::Duration::seconds(5)).is_empty());

        let late = start + chrono::Duration::seconds(11);
        assert_eq!(collector.check_heartbeats(late), vec![lane.clone()]);
        assert_eq!(collector.check_heartbeats(late), vec![lane.clone()]);
        assert_eq!(bus.named(names::METRICS_ALERT).len(), 1);
        assert_eq!(collector.alerts()[0].severity, AlertSeverity::Critical);

        collector.record_heartbeat(&lane, late);
        assert!(collector.check_heartbeats(late).is_empty());
        collector.forget_heartbeat(&lane);
        assert!(collector.check_heartbeats(late + chrono::Duration::hours(1)).is_empty());
    }

    #[test]
    fn degrading_series_warns_on_entry() {
        let (collector, _) = collector();
        for value in [0.9, 0.8, 0.7, 0.6] {
            collector.observe("coupling.a.health", value);
        }
        assert_eq!(collector.trend("coupling.a.health"), PerformanceTrend::Degrading);
        assert_eq!(collector.trend("missing"), PerformanceTrend::Unknown);
        let warnings: Vec<_> = collector
            .alerts()
            .into_iter()
            .filter(|a| a.severity == AlertSeverity::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn alert_history_is_bounded() {
        let (collector, _) = collector();
        for i in 0..6 {
            collector.raise(AlertSeverity::Info, "test", format!("alert {i}"));
        }
        let alerts = collector.alerts();
        assert_eq!(alerts.len(), 4);
        assert_eq!(alerts[0].message, "alert 2");
        assert_eq!(collector.counter_value(ALERTS_TOTAL), 6);
    }

    #[test]
    fn ingest_tracks_errors_and_consensus() {
        let (collector, _) = collector();
        let lane = LaneId::new();
        collector.ingest(&LaneEvent::new(names::LANE_ACTIVATED, lane));
        collector.ingest(&LaneEvent::new(names::LANE_ERROR, lane).with("reason", "exited"));
        collector.ingest(
            &LaneEvent::new(names::CONSENSUS_COMPLETED, "run")
                .with("success", true)
                .with("efficiency_score", 0.5),
        );
        collector.ingest(
            &LaneEvent::new(names::LANE_SYNCED, lane)
                .with("queue_depth", 95)
                .with("max_queue", 100)
                .with("health", 0.7),
        );
        assert_eq!(collector.counter_value(EVENTS_TOTAL), 4);
        assert_eq!(collector.counter_value(ERROR_EVENTS_TOTAL), 1);
        assert_eq!(collector.counter_value(CONSENSUS_SUCCEEDED_TOTAL), 1);
        assert_eq!(collector.gauge_value(CONSENSUS_EFFICIENCY), Some(0.5));
        assert!((collector.error_rate() - 0.25).abs() < 1e-12);
        let messages: Vec<String> = collector.alerts().into_iter().map(|a| a.message).collect();
        assert!(messages.iter().any(|m| m.contains("exited")));
        assert!(messages.iter().any(|m| m.contains("queue at 95 of 100")));
    }

    #[test]
    fn shutdown_drops_lane_series() {
        let (collector, _) = collector();
        let lane = LaneId::new();
        let series = format!("lane.{lane}.health");
        for health in [0.9, 0.8, 0.7, 0.6] {
            collector.ingest(&LaneEvent::new(names::LANE_SYNCED, lane).with("health", health));
        }
        assert_eq!(collector.trend(&series), PerformanceTrend::Degrading);

        collector.ingest(&LaneEvent::new(names::LANE_SHUTDOWN, lane));
        assert_eq!(collector.trend(&series), PerformanceTrend::Unknown);
        assert!(collector.series.lock().is_empty());
    }

    #[test]
    fn empty_report_is_unhealthy() {
        let (collector, _) = collector();
        let report = collector.health_report(&[], None);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        let report = collector.health_report(&[], Some(0.9));
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.alert_counts, [0, 0, 0]);
    }

    #[tokio::test]
    async fn subscriber_loop_ingests_until_shutdown() {
        let bus = Arc::new(crate::events::BroadcastEventBus::new(16));
        let collector = Arc::new(MetricsCollector::new(
            MetricsConfig::default(),
            Duration::from_secs(10),
            bus.clone(),
        ));
        let (stop, shutdown) = watch::channel(false);
        let handle = Arc::clone(&collector).spawn(bus.subscribe(), shutdown);
        bus.publish(&LaneEvent::new(names::COUPLING_TUNED, "c")).unwrap();
        for _ in 0..50 {
            if collector.counter_value(COUPLING_TUNES_TOTAL) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(collector.counter_value(COUPLING_TUNES_TOTAL), 1);
        stop.send(true).unwrap();
        handle.await.unwrap();
    }
}
