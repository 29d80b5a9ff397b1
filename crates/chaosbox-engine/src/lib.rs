//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
//! Fault-injection execution engine: validated scenarios, guaranteed cleanup, worker
//! pools with broadcast cancellation, and the chaos session lifecycle.

use std::sync::Arc;

pub mod catalog;
pub mod cleanup;
pub mod error;
pub mod metrics;
pub mod scenario;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod workers;

pub use catalog::Impact;
pub use cleanup::CleanupRegistry;
pub use error::{ChaosError, CleanupFailure, InjectionError, TransportError, ValidationError};
pub use metrics::ChaosMetrics;
pub use scenario::{
    ReplicationThread, Scenario, ScenarioDefinition, ScenarioKind, ScenarioParams, Signal,
};
pub use session::{ChaosSession, Collaborators, Outcome, SessionConfig, SessionState, SessionSummary};
pub use telemetry::{LifecycleEvent, NoopSink, TelemetrySink};
pub use transport::{DatabaseHandle, HeldConnection, RemoteExecutor};
pub use workers::{OnWorkerError, PoolReport, WorkerPool, WorkerPoolConfig, WorkerStep};

/// Convenience re-exports for embedding the engine.
pub mod prelude {
    pub use crate::{
        ChaosError, ChaosMetrics, ChaosSession, Collaborators, DatabaseHandle, HeldConnection,
        Outcome, RemoteExecutor, Scenario, ScenarioKind, ScenarioParams, SessionConfig,
        TelemetrySink, TransportError,
    };
}

/// Run one scenario with the default session configuration.
pub async fn run(
    scenario: Scenario,
    executor: Arc<dyn RemoteExecutor>,
    database: Arc<dyn DatabaseHandle>,
    sink: Arc<dyn TelemetrySink>,
) -> Result<Outcome, ChaosError> {
    let collaborators = Collaborators::new(executor, database, sink);
    ChaosSession::new(scenario, collaborators, SessionConfig::default())
        .run()
        .await
}
