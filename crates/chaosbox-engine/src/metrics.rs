//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use anyhow::Result;
use chaosbox_metrics::SharedRegistry;
use prometheus::{self, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts};

use crate::scenario::ScenarioKind;
use crate::telemetry::{LifecycleEvent, TelemetrySink};

/// Prometheus-backed [`TelemetrySink`].
#[derive(Clone)]
pub struct ChaosMetrics {
    registry: SharedRegistry,
    events_total: IntCounterVec,
    event_duration_seconds: HistogramVec,
    impact_queries: IntGaugeVec,
    impact_connections: IntGaugeVec,
    recovery_time_seconds: HistogramVec,
    lifecycle_transitions_total: IntCounterVec,
    target_up: IntGaugeVec,
    replication_lag_seconds: GaugeVec,
    connections_current: IntGaugeVec,
}

impl ChaosMetrics {
    /// Register the chaos metric families against the provided registry.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let events_total = IntCounterVec::new(
            Opts::new("chaos_event_total", "Total number of chaos events executed"),
            &["target", "scenario", "result"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let event_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chaos_event_duration_seconds",
                "Duration of chaos events from start to the end of cleanup",
            )
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 12)?),
            &["target", "scenario"],
        )?;
        registry.register(Box::new(event_duration_seconds.clone()))?;

        let impact_queries = IntGaugeVec::new(
            Opts::new(
                "chaos_impact_queries_affected",
                "Number of queries affected by the current chaos event",
            ),
            &["target"],
        )?;
        registry.register(Box::new(impact_queries.clone()))?;

        let impact_connections = IntGaugeVec::new(
            Opts::new(
                "chaos_impact_connections_affected",
                "Number of connections affected by the current chaos event",
            ),
            &["target"],
        )?;
        registry.register(Box::new(impact_connections.clone()))?;

        let recovery_time_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chaos_recovery_time_seconds",
                "Time for the target to answer again after a chaos event",
            )
            .buckets(prometheus::exponential_buckets(0.1, 2.0, 12)?),
            &["target", "scenario"],
        )?;
        registry.register(Box::new(recovery_time_seconds.clone()))?;

        let lifecycle_transitions_total = IntCounterVec::new(
            Opts::new(
                "chaos_lifecycle_transitions_total",
                "Chaos session state transitions, by entered state",
            ),
            &["target", "scenario", "state"],
        )?;
        registry.register(Box::new(lifecycle_transitions_total.clone()))?;

        let target_up = IntGaugeVec::new(
            Opts::new("mysql_up", "Whether the MySQL instance answered its last probe"),
            &["instance"],
        )?;
        registry.register(Box::new(target_up.clone()))?;

        let replication_lag_seconds = GaugeVec::new(
            Opts::new(
                "mysql_replication_lag_seconds",
                "Replication lag induced or observed on the instance",
            ),
            &["instance"],
        )?;
        registry.register(Box::new(replication_lag_seconds.clone()))?;

        let connections_current = IntGaugeVec::new(
            Opts::new(
                "mysql_connections_current",
                "Connections the chaos session holds open against the instance",
            ),
            &["instance"],
        )?;
        registry.register(Box::new(connections_current.clone()))?;

        Ok(Self {
            registry,
            events_total,
            event_duration_seconds,
            impact_queries,
            impact_connections,
            recovery_time_seconds,
            lifecycle_transitions_total,
            target_up,
            replication_lag_seconds,
            connections_current,
        })
    }

    /// Expose the underlying shared registry for convenience.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }
}

impl TelemetrySink for ChaosMetrics {
    fn record_event(&self, target: &str, kind: ScenarioKind, result: &str, duration_seconds: f64) {
        self.events_total
            .with_label_values(&[target, kind.as_str(), result])
            .inc();
        self.event_duration_seconds
            .with_label_values(&[target, kind.as_str()])
            .observe(duration_seconds);
    }

    fn record_impact(&self, target: &str, queries: u64, connections: u64) {
        self.impact_queries
            .with_label_values(&[target])
            .set(i64::try_from(queries).unwrap_or(i64::MAX));
        self.impact_connections
            .with_label_values(&[target])
            .set(i64::try_from(connections).unwrap_or(i64::MAX));
    }

    fn record_recovery(&self, target: &str, kind: ScenarioKind, seconds: f64) {
        self.recovery_time_seconds
            .with_label_values(&[target, kind.as_str()])
            .observe(seconds);
    }

    fn record_lifecycle(&self, event: &LifecycleEvent) {
        self.lifecycle_transitions_total
            .with_label_values(&[event.target.as_str(), event.scenario.as_str(), event.to.as_str()])
            .inc();
    }

    fn record_replication_lag(&self, target: &str, seconds: f64) {
        self.replication_lag_seconds
            .with_label_values(&[target])
            .set(seconds);
    }

    fn record_target_up(&self, target: &str, up: bool) {
        self.target_up.with_label_values(&[target]).set(i64::from(up));
    }

    fn record_connections(&self, target: &str, connections: u64) {
        self.connections_current
            .with_label_values(&[target])
            .set(i64::try_from(connections).unwrap_or(i64::MAX));
    }
}

impl std::fmt::Debug for ChaosMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaosbox_metrics::new_registry;
    use chrono::Utc;
    use prometheus::proto::MetricFamily;

    use crate::session::SessionState;

    fn family<'a>(families: &'a [MetricFamily], name: &str) -> &'a MetricFamily {
        families
            .iter()
            .find(|family| family.get_name() == name)
            .unwrap_or_else(|| panic!("missing metric family {name}"))
    }

    #[test]
    fn records_event_impact_and_recovery() {
        let metrics = ChaosMetrics::new(new_registry()).unwrap();
        metrics.record_event("db1", ScenarioKind::SlowQueryStorm, "success", 2.5);
        metrics.record_impact("db1", 5, 0);
        metrics.record_recovery("db1", ScenarioKind::SlowQueryStorm, 0.4);
        metrics.record_target_up("db1", true);
        metrics.record_replication_lag("db1", 30.0);

        let families = metrics.registry().gather();
        let events = family(&families, "chaos_event_total");
        assert_eq!(events.get_metric()[0].get_counter().get_value() as u64, 1);
        let labels: Vec<_> = events.get_metric()[0]
            .get_label()
            .iter()
            .map(|label| (label.get_name(), label.get_value()))
            .collect();
        assert!(labels.contains(&("scenario", "slow_query_storm")));
        assert!(labels.contains(&("result", "success")));

        let queries = family(&families, "chaos_impact_queries_affected");
        assert_eq!(queries.get_metric()[0].get_gauge().get_value() as u64, 5);
        let recovery = family(&families, "chaos_recovery_time_seconds");
        assert_eq!(recovery.get_metric()[0].get_histogram().get_sample_count(), 1);
        let up = family(&families, "mysql_up");
        assert_eq!(up.get_metric()[0].get_gauge().get_value() as i64, 1);
        let lag = family(&families, "mysql_replication_lag_seconds");
        assert_eq!(lag.get_metric()[0].get_gauge().get_value(), 30.0);
    }

    #[test]
    fn connections_gauge_follows_the_latest_count() {
        let metrics = ChaosMetrics::new(new_registry()).unwrap();
        metrics.record_connections("db1", 12);

        let families = metrics.registry().gather();
        let current = family(&families, "mysql_connections_current");
        assert_eq!(current.get_metric()[0].get_gauge().get_value() as i64, 12);
        assert_eq!(current.get_metric()[0].get_label()[0].get_name(), "instance");

        metrics.record_connections("db1", 0);
        let families = metrics.registry().gather();
        let current = family(&families, "mysql_connections_current");
        assert_eq!(current.get_metric()[0].get_gauge().get_value() as i64, 0);
    }

    #[test]
    fn lifecycle_counter_is_labelled_by_entered_state() {
        let metrics = ChaosMetrics::new(new_registry()).unwrap();
        for (from, to) in [
            (SessionState::Idle, SessionState::Preparing),
            (SessionState::Preparing, SessionState::Failed),
        ] {
            metrics.record_lifecycle(&LifecycleEvent {
                target: "db1".into(),
                scenario: ScenarioKind::DiskFill,
                from,
                to,
                at: Utc::now(),
            });
        }

        let families = metrics.registry().gather();
        let transitions = family(&families, "chaos_lifecycle_transitions_total");
        assert_eq!(transitions.get_metric().len(), 2);
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = new_registry();
        ChaosMetrics::new(registry.clone()).unwrap();
        assert!(ChaosMetrics::new(registry).is_err());
    }
}
