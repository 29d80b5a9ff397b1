//! ---
//! cbx_section: "15-testing-qa-runbook"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Scripted collaborator fakes for chaos session tests."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use chaosbox_engine::{LifecycleEvent, ScenarioKind, SessionState, TelemetrySink};
use parking_lot::Mutex;

/// One call received by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkRecord {
    Event {
        target: String,
        kind: ScenarioKind,
        result: String,
        duration_seconds: f64,
    },
    Impact {
        target: String,
        queries: u64,
        connections: u64,
    },
    Recovery {
        target: String,
        kind: ScenarioKind,
        seconds: f64,
    },
    Lifecycle(LifecycleEvent),
    ReplicationLag {
        target: String,
        seconds: f64,
    },
    TargetUp {
        target: String,
        up: bool,
    },
    Connections {
        target: String,
        connections: u64,
    },
}

/// Telemetry sink that keeps every call in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<SinkRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().clone()
    }

    /// `(result, duration_seconds)` of every recorded event.
    pub fn events(&self) -> Vec<(String, f64)> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::Event {
                    result,
                    duration_seconds,
                    ..
                } => Some((result.clone(), *duration_seconds)),
                _ => None,
            })
            .collect()
    }

    /// `(target, queries, connections)` of every impact observation.
    pub fn impacts(&self) -> Vec<(String, u64, u64)> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::Impact {
                    target,
                    queries,
                    connections,
                } => Some((target.clone(), *queries, *connections)),
                _ => None,
            })
            .collect()
    }

    pub fn recoveries(&self) -> Vec<f64> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::Recovery { seconds, .. } => Some(*seconds),
                _ => None,
            })
            .collect()
    }

    pub fn lifecycle(&self) -> Vec<LifecycleEvent> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::Lifecycle(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// States entered, in order.
    pub fn states(&self) -> Vec<SessionState> {
        self.lifecycle().into_iter().map(|event| event.to).collect()
    }

    pub fn target_up(&self) -> Vec<bool> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::TargetUp { up, .. } => Some(*up),
                _ => None,
            })
            .collect()
    }

    pub fn replication_lag(&self) -> Vec<f64> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::ReplicationLag { seconds, .. } => Some(*seconds),
                _ => None,
            })
            .collect()
    }

    /// Held-connection counts, in the order they were reported.
    pub fn connections(&self) -> Vec<u64> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                SinkRecord::Connections { connections, .. } => Some(*connections),
                _ => None,
            })
            .collect()
    }

    fn push(&self, record: SinkRecord) {
        self.records.lock().push(record);
    }
}

impl TelemetrySink for RecordingSink {
    fn record_event(&self, target: &str, kind: ScenarioKind, result: &str, duration_seconds: f64) {
        self.push(SinkRecord::Event {
            target: target.to_owned(),
            kind,
            result: result.to_owned(),
            duration_seconds,
        });
    }

    fn record_impact(&self, target: &str, queries: u64, connections: u64) {
        self.push(SinkRecord::Impact {
            target: target.to_owned(),
            queries,
            connections,
        });
    }

    fn record_recovery(&self, target: &str, kind: ScenarioKind, seconds: f64) {
        self.push(SinkRecord::Recovery {
            target: target.to_owned(),
            kind,
            seconds,
        });
    }

    fn record_lifecycle(&self, event: &LifecycleEvent) {
        self.push(SinkRecord::Lifecycle(event.clone()));
    }

    fn record_replication_lag(&self, target: &str, seconds: f64) {
        self.push(SinkRecord::ReplicationLag {
            target: target.to_owned(),
            seconds,
        });
    }

    fn record_target_up(&self, target: &str, up: bool) {
        self.push(SinkRecord::TargetUp {
            target: target.to_owned(),
            up,
        });
    }

    fn record_connections(&self, target: &str, connections: u64) {
        self.push(SinkRecord::Connections {
            target: target.to_owned(),
            connections,
        });
    }
}
