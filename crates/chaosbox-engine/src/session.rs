//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
//! Chaos session lifecycle: prepare, inject, sustain, clean up, report.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use chaosbox_common::config::SessionSettings;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout_at, Instant};
use tracing::{debug, error, info, warn};

use crate::catalog::{self, Impact, InjectionContext};
use crate::cleanup::CleanupRegistry;
use crate::error::{ChaosError, CleanupFailure, InjectionError, ValidationError};
use crate::scenario::Scenario;
use crate::telemetry::{LifecycleEvent, TelemetrySink};
use crate::transport::{DatabaseHandle, RemoteExecutor};
use crate::workers::{PoolReport, DEFAULT_WORKER_GRACE};

/// Result label reported when preconditions reject a session.
pub const REJECTED: &str = "rejected";

type CleanupTask = JoinHandle<(CleanupRegistry, Vec<CleanupFailure>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Preparing,
    Injecting,
    Sustaining,
    CleaningUp,
    Completed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Preparing => "preparing",
            SessionState::Injecting => "injecting",
            SessionState::Sustaining => "sustaining",
            SessionState::CleaningUp => "cleaning_up",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// How a session that reached injection ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    /// Injection and every cleanup action succeeded.
    Success,
    /// Injection failed (or cleanup could not run); the target was restored otherwise.
    Failed(String),
    /// At least one cleanup action failed; the target may still be degraded.
    PartiallyCleaned(String),
}

impl Outcome {
    /// Label used for the `result` metric dimension.
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed(_) => "failed",
            Outcome::PartiallyCleaned(_) => "partially_cleaned",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::Failed(reason) | Outcome::PartiallyCleaned(reason) => Some(reason),
        }
    }
}

/// Timing knobs for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// How long pool workers get to stop before being aborted.
    pub worker_grace: Duration,
    /// How long a connection flood waits for its workers to open connections.
    pub ready_timeout: Duration,
    /// Re-record impact at this cadence while sustaining; once at hold start when unset.
    pub impact_interval: Option<Duration>,
    pub probe_recovery: bool,
    pub recovery_timeout: Duration,
    pub recovery_poll: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            worker_grace: DEFAULT_WORKER_GRACE,
            ready_timeout: Duration::from_secs(10),
            impact_interval: None,
            probe_recovery: true,
            recovery_timeout: Duration::from_secs(60),
            recovery_poll: Duration::from_millis(500),
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            worker_grace: settings.worker_grace,
            ready_timeout: settings.ready_timeout,
            impact_interval: settings.impact_interval,
            probe_recovery: settings.probe_recovery,
            recovery_timeout: settings.recovery_timeout,
            recovery_poll: settings.recovery_poll,
        }
    }
}

/// Capabilities a session drives.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn RemoteExecutor>,
    pub database: Arc<dyn DatabaseHandle>,
    pub sink: Arc<dyn TelemetrySink>,
}

impl Collaborators {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        database: Arc<dyn DatabaseHandle>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            executor,
            database,
            sink,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Serializable record of a finished (or rejected) session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub target: String,
    pub host: String,
    pub scenario: crate::scenario::ScenarioKind,
    pub parameters: serde_json::Value,
    pub duration_seconds: f64,
    pub state: SessionState,
    pub outcome: Option<Outcome>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub impact: Impact,
    pub injection_error: Option<String>,
    pub cleanup_actions: usize,
    pub cleanup_failures: Vec<CleanupFailure>,
    pub worker_pools: Vec<PoolReport>,
    pub recovery_seconds: Option<f64>,
}

/// Drives one scenario against one target. Single use.
///
/// Dropping a session that still holds registered cleanup actions (for example when
/// [`ChaosSession::run`] is cancelled mid-hold) spawns those actions on the current
/// runtime. A cleanup already in flight when `run` is cancelled is kept on the session
/// and awaited by [`ChaosSession::finish_interrupted`].
pub struct ChaosSession {
    scenario: Scenario,
    collaborators: Collaborators,
    config: SessionConfig,
    state: SessionState,
    cleanup: CleanupRegistry,
    cleanup_task: Option<CleanupTask>,
    worker_reports: Arc<Mutex<Vec<PoolReport>>>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    outcome: Option<Outcome>,
    impact: Impact,
    injection_error: Option<InjectionError>,
    cleanup_executed: usize,
    cleanup_failures: Vec<CleanupFailure>,
    recovery_seconds: Option<f64>,
}

impl ChaosSession {
    pub fn new(scenario: Scenario, collaborators: Collaborators, config: SessionConfig) -> Self {
        Self {
            scenario,
            collaborators,
            config,
            state: SessionState::Idle,
            cleanup: CleanupRegistry::new(),
            cleanup_task: None,
            worker_reports: Arc::default(),
            started_at: None,
            ended_at: None,
            outcome: None,
            impact: Impact::None,
            injection_error: None,
            cleanup_executed: 0,
            cleanup_failures: Vec::new(),
            recovery_seconds: None,
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Set only once every registered cleanup action has been attempted.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn impact(&self) -> Impact {
        self.impact
    }

    pub fn injection_error(&self) -> Option<&InjectionError> {
        self.injection_error.as_ref()
    }

    /// Cleanup actions invoked during the cleanup phase.
    pub fn cleanup_executed(&self) -> usize {
        self.cleanup_executed
    }

    pub fn cleanup_failures(&self) -> &[CleanupFailure] {
        &self.cleanup_failures
    }

    pub fn worker_reports(&self) -> Vec<PoolReport> {
        self.worker_reports.lock().clone()
    }

    pub fn recovery_seconds(&self) -> Option<f64> {
        self.recovery_seconds
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            target: self.scenario.target().to_owned(),
            host: self.scenario.host().to_owned(),
            scenario: self.scenario.kind(),
            parameters: self.scenario.parameters_json(),
            duration_seconds: self.scenario.duration().as_secs_f64(),
            state: self.state,
            outcome: self.outcome.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at,
            impact: self.impact,
            injection_error: self.injection_error.as_ref().map(ToString::to_string),
            cleanup_actions: self.cleanup_executed,
            cleanup_failures: self.cleanup_failures.clone(),
            worker_pools: self.worker_reports(),
            recovery_seconds: self.recovery_seconds,
        }
    }

    /// Run the scenario to completion.
    ///
    /// Returns `Err` only when the session was rejected before touching the target or has
    /// already run. Every run that reached injection yields an [`Outcome`].
    pub async fn run(&mut self) -> Result<Outcome, ChaosError> {
        if self.state != SessionState::Idle {
            return Err(ChaosError::AlreadyRun);
        }
        let started_at = Utc::now();
        self.started_at = Some(started_at);
        info!(
            instance = %self.scenario.target(),
            scenario = %self.scenario.kind(),
            host = %self.scenario.host(),
            parameters = %self.scenario.parameters_json(),
            duration = ?self.scenario.duration(),
            "chaos session starting"
        );

        self.transition(SessionState::Preparing);
        if let Err(err) = self.check_preconditions().await {
            warn!(instance = %self.scenario.target(), scenario = %self.scenario.kind(), error = %err, "preconditions not met; target left untouched");
            self.transition(SessionState::Failed);
            let ended_at = Utc::now();
            self.ended_at = Some(ended_at);
            self.collaborators.sink.record_event(
                self.scenario.target(),
                self.scenario.kind(),
                REJECTED,
                seconds_between(started_at, ended_at),
            );
            return Err(err.into());
        }

        self.transition(SessionState::Injecting);
        let injected = {
            let mut ctx = InjectionContext {
                scenario: &self.scenario,
                executor: &self.collaborators.executor,
                database: &self.collaborators.database,
                sink: &self.collaborators.sink,
                cleanup: &mut self.cleanup,
                worker_reports: &self.worker_reports,
                worker_grace: self.config.worker_grace,
                ready_timeout: self.config.ready_timeout,
            };
            catalog::inject(&mut ctx).await
        };

        self.transition(SessionState::Sustaining);
        match injected {
            Ok(impact) => {
                self.impact = impact;
                self.sustain(impact).await;
            }
            Err(err) => {
                error!(instance = %self.scenario.target(), scenario = %self.scenario.kind(), error = %err, "injection failed; skipping hold");
                self.injection_error = Some(err);
            }
        }

        self.transition(SessionState::CleaningUp);
        let cleaned = self.run_cleanup().await;
        let ended_at = Utc::now();
        let cleanup_done = Instant::now();
        self.ended_at = Some(ended_at);

        let (terminal, outcome) = match cleaned {
            Ok(()) => (SessionState::Completed, self.resolve_outcome()),
            Err(reason) => (SessionState::Failed, Outcome::Failed(reason)),
        };
        self.transition(terminal);
        self.collaborators.sink.record_event(
            self.scenario.target(),
            self.scenario.kind(),
            outcome.as_str(),
            seconds_between(started_at, ended_at),
        );
        match &outcome {
            Outcome::Success => {
                info!(instance = %self.scenario.target(), scenario = %self.scenario.kind(), "chaos session succeeded")
            }
            other => {
                warn!(instance = %self.scenario.target(), scenario = %self.scenario.kind(), result = other.as_str(), reason = other.reason().unwrap_or_default(), "chaos session finished with problems")
            }
        }
        self.outcome = Some(outcome.clone());

        if self.config.probe_recovery {
            self.probe_recovery(cleanup_done).await;
        }
        Ok(outcome)
    }

    fn transition(&mut self, to: SessionState) {
        let from = mem::replace(&mut self.state, to);
        let event = LifecycleEvent {
            target: self.scenario.target().to_owned(),
            scenario: self.scenario.kind(),
            from,
            to,
            at: Utc::now(),
        };
        self.collaborators.sink.record_lifecycle(&event);
        info!(
            instance = %event.target,
            scenario = %event.scenario,
            from = from.as_str(),
            to = to.as_str(),
            "chaos session transition"
        );
    }

    async fn check_preconditions(&self) -> Result<(), ValidationError> {
        let result = if self.scenario.kind().uses_database() {
            self.collaborators.database.ping().await
        } else {
            self.collaborators
                .executor
                .execute(self.scenario.host(), "true")
                .await
        };
        result.map_err(|err| ValidationError::Precondition {
            target: self.scenario.target().to_owned(),
            reason: err.to_string(),
        })
    }

    async fn sustain(&self, impact: Impact) {
        let duration = self.scenario.duration();
        debug!(instance = %self.scenario.target(), hold = ?duration, "holding disruptive condition");
        self.record_impact(impact);

        let hold = sleep(duration);
        tokio::pin!(hold);
        let Some(every) = self.config.impact_interval.filter(|every| !every.is_zero()) else {
            hold.await;
            return;
        };
        let mut ticker = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = &mut hold => break,
                _ = ticker.tick() => self.record_impact(impact),
            }
        }
    }

    fn record_impact(&self, impact: Impact) {
        let target = self.scenario.target();
        match impact {
            Impact::None => {}
            Impact::Load {
                queries,
                connections,
            } => self
                .collaborators
                .sink
                .record_impact(target, queries, connections),
            Impact::ReplicationLag { seconds } => self
                .collaborators
                .sink
                .record_replication_lag(target, seconds as f64),
        }
    }

    /// Run every registered action on its own task so a panic escaping the per-action
    /// guard surfaces as a join error instead of unwinding through the session.
    ///
    /// The task handle stays on the session until joined; a second call awaits the
    /// task in flight instead of starting another.
    async fn run_cleanup(&mut self) -> Result<(), String> {
        if self.cleanup_task.is_none() {
            let mut registry = mem::take(&mut self.cleanup);
            info!(instance = %self.scenario.target(), actions = registry.pending(), "running cleanup actions");
            self.cleanup_task = Some(tokio::spawn(async move {
                let failures = registry.run_all().await;
                (registry, failures)
            }));
        } else {
            info!(instance = %self.scenario.target(), "awaiting cleanup already in progress");
        }
        let Some(task) = self.cleanup_task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.cleanup_task = None;
        match joined {
            Ok((registry, failures)) => {
                self.cleanup_executed = registry.executed();
                self.cleanup_failures.extend(failures);
                self.cleanup = registry;
                Ok(())
            }
            Err(err) => {
                error!(instance = %self.scenario.target(), error = %err, "cleanup task did not complete");
                Err(format!("cleanup could not run to completion: {err}"))
            }
        }
    }

    fn resolve_outcome(&self) -> Outcome {
        let injection = self.injection_error.as_ref().map(ToString::to_string);
        match (injection, self.cleanup_failure_reason()) {
            (None, None) => Outcome::Success,
            (Some(err), None) => Outcome::Failed(err),
            (None, Some(cleanup)) => Outcome::PartiallyCleaned(cleanup),
            (Some(err), Some(cleanup)) => {
                Outcome::PartiallyCleaned(format!("injection failed: {err}; {cleanup}"))
            }
        }
    }

    fn cleanup_failure_reason(&self) -> Option<String> {
        if self.cleanup_failures.is_empty() {
            return None;
        }
        let failures = self
            .cleanup_failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Some(format!(
            "{} cleanup action(s) failed: {failures}",
            self.cleanup_failures.len()
        ))
    }

    /// Finish a session whose [`ChaosSession::run`] future was dropped before completing,
    /// for example on operator interrupt.
    ///
    /// Waits for a cleanup already in flight, runs every action still registered and
    /// ends in [`SessionState::Failed`].
    pub async fn finish_interrupted(&mut self, reason: &str) -> Outcome {
        match self.state {
            SessionState::Idle => return Outcome::Failed(format!("interrupted: {reason}")),
            state if state.is_terminal() => {
                return self
                    .outcome
                    .clone()
                    .unwrap_or_else(|| Outcome::Failed(format!("interrupted: {reason}")));
            }
            SessionState::CleaningUp => {}
            _ => self.transition(SessionState::CleaningUp),
        }
        warn!(instance = %self.scenario.target(), scenario = %self.scenario.kind(), %reason, "session interrupted; running remaining cleanup");

        let cleaned = self.run_cleanup().await;
        let ended_at = Utc::now();
        self.ended_at = Some(ended_at);
        let outcome = match cleaned {
            Ok(()) => match self.cleanup_failure_reason() {
                None => Outcome::Failed(format!("interrupted: {reason}")),
                Some(cleanup) => Outcome::PartiallyCleaned(format!("interrupted: {reason}; {cleanup}")),
            },
            Err(err) => Outcome::Failed(err),
        };
        self.transition(SessionState::Failed);
        if let Some(started_at) = self.started_at {
            self.collaborators.sink.record_event(
                self.scenario.target(),
                self.scenario.kind(),
                outcome.as_str(),
                seconds_between(started_at, ended_at),
            );
        }
        self.outcome = Some(outcome.clone());
        outcome
    }

    async fn probe_recovery(&mut self, since: Instant) {
        let target = self.scenario.target();
        let deadline = since + self.config.recovery_timeout;
        loop {
            match timeout_at(deadline, self.collaborators.database.ping()).await {
                Ok(Ok(())) => {
                    let seconds = since.elapsed().as_secs_f64();
                    self.collaborators
                        .sink
                        .record_recovery(target, self.scenario.kind(), seconds);
                    self.collaborators.sink.record_target_up(target, true);
                    info!(instance = %target, recovery_seconds = seconds, "target answering again");
                    self.recovery_seconds = Some(seconds);
                    return;
                }
                Ok(Err(err)) => {
                    debug!(instance = %target, error = %err, "target not answering yet");
                }
                Err(_) => {}
            }
            if Instant::now() + self.config.recovery_poll >= deadline {
                warn!(instance = %target, timeout = ?self.config.recovery_timeout, "target did not recover before the probe timed out");
                self.collaborators.sink.record_target_up(target, false);
                return;
            }
            sleep(self.config.recovery_poll).await;
        }
    }
}

impl Drop for ChaosSession {
    fn drop(&mut self) {
        if self.cleanup_task.take().is_some() {
            warn!(instance = %self.scenario.target(), "session dropped while cleanup was running; cleanup continues in background");
        }
        let pending = self.cleanup.pending();
        if pending == 0 {
            return;
        }
        let mut registry = mem::take(&mut self.cleanup);
        let target = self.scenario.target().to_owned();
        match Handle::try_current() {
            Ok(handle) => {
                warn!(instance = %target, pending, "session dropped before cleanup; running cleanup in background");
                handle.spawn(async move {
                    for failure in registry.run_all().await {
                        error!(instance = %target, action = %failure.action, reason = %failure.reason, "background cleanup action failed");
                    }
                });
            }
            Err(_) => {
                error!(instance = %target, pending, "session dropped outside a runtime; cleanup actions abandoned");
            }
        }
    }
}

impl std::fmt::Debug for ChaosSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosSession")
            .field("scenario", &self.scenario)
            .field("state", &self.state)
            .field("outcome", &self.outcome)
            .field("cleanup", &self.cleanup)
            .finish_non_exhaustive()
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start)
        .to_std()
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or_default()
}
