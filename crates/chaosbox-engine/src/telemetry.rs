//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scenario::ScenarioKind;
use crate::session::SessionState;

/// One state-machine transition of a chaos session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub target: String,
    pub scenario: ScenarioKind,
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
}

/// Receiver for the observations a chaos session produces.
///
/// Implementations must be cheap and non-blocking; they are called inline from the
/// session's control flow.
pub trait TelemetrySink: Send + Sync {
    /// A session reached a terminal state (or was rejected during preparation).
    fn record_event(&self, target: &str, kind: ScenarioKind, result: &str, duration_seconds: f64);

    /// Blast radius observed when the disruptive condition starts being held.
    fn record_impact(&self, target: &str, queries: u64, connections: u64);

    /// Seconds between the end of cleanup and the target answering again.
    fn record_recovery(&self, target: &str, kind: ScenarioKind, seconds: f64);

    fn record_lifecycle(&self, _event: &LifecycleEvent) {}

    fn record_replication_lag(&self, _target: &str, _seconds: f64) {}

    fn record_target_up(&self, _target: &str, _up: bool) {}

    /// Connections currently held open against the target by the session.
    fn record_connections(&self, _target: &str, _connections: u64) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record_event(&self, _: &str, _: ScenarioKind, _: &str, _: f64) {}

    fn record_impact(&self, _: &str, _: u64, _: u64) {}

    fn record_recovery(&self, _: &str, _: ScenarioKind, _: f64) {}
}
