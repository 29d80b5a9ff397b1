//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
//! Disruptive actions for every scenario kind and the reversal each one registers.
//!
//! Every reversal is registered before its disruptive action is awaited, so an error
//! or cancellation at any later point still leaves the reversal queued.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cleanup::CleanupRegistry;
use crate::error::InjectionError;
use crate::scenario::{Scenario, ScenarioParams};
use crate::telemetry::TelemetrySink;
use crate::transport::{DatabaseHandle, HeldConnection, RemoteExecutor};
use crate::workers::{OnWorkerError, PoolReport, WorkerPool, WorkerPoolConfig, WorkerStep};

/// Pause applied to a storm worker after a failed query.
pub const STORM_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const FILL_FILE: &str = "chaos-fill.tmp";

/// Blast radius reported once the disruptive condition is in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Impact {
    #[default]
    None,
    Load { queries: u64, connections: u64 },
    ReplicationLag { seconds: u64 },
}

type HeldConnections = Arc<Mutex<Vec<Box<dyn HeldConnection>>>>;

/// Everything an injection needs from the owning session.
pub struct InjectionContext<'a> {
    pub scenario: &'a Scenario,
    pub executor: &'a Arc<dyn RemoteExecutor>,
    pub database: &'a Arc<dyn DatabaseHandle>,
    pub sink: &'a Arc<dyn TelemetrySink>,
    pub cleanup: &'a mut CleanupRegistry,
    /// Reports of pools stopped by cleanup actions are appended here.
    pub worker_reports: &'a Arc<Mutex<Vec<PoolReport>>>,
    pub worker_grace: Duration,
    pub ready_timeout: Duration,
}

impl InjectionContext<'_> {
    fn host(&self) -> &str {
        self.scenario.host()
    }

    fn register_remote(&mut self, label: String, command: String) {
        let executor = self.executor.clone();
        let host = self.scenario.host().to_owned();
        self.cleanup.register(label, move || async move {
            executor.execute(&host, &command).await?;
            Ok(())
        });
    }

    fn register_statement(&mut self, label: String, statement: String) {
        let database = self.database.clone();
        self.cleanup.register(label, move || async move {
            database.exec(&statement).await?;
            Ok(())
        });
    }

    fn register_pool_shutdown(&mut self, label: String, pool: WorkerPool) {
        let ledger = self.worker_reports.clone();
        self.cleanup.register(label, move || async move {
            let report = pool.shutdown().await;
            ledger.lock().push(report.clone());
            report.into_result()
        });
    }

    fn pool_config(&self, label: &str, workers: usize, on_error: OnWorkerError) -> WorkerPoolConfig {
        WorkerPoolConfig::new(format!("{} {label}", self.scenario.target()), workers)
            .with_grace(self.worker_grace)
            .with_on_error(on_error)
    }

    async fn remote(&self, step: &str, command: &str) -> Result<(), InjectionError> {
        self.executor
            .execute(self.host(), command)
            .await
            .map_err(InjectionError::step(step))
    }

    async fn statement(&self, step: &str, statement: &str) -> Result<(), InjectionError> {
        self.database
            .exec(statement)
            .await
            .map_err(InjectionError::step(step))
    }
}

/// Apply the scenario's disruptive action, registering its reversals as it goes.
pub async fn inject(ctx: &mut InjectionContext<'_>) -> Result<Impact, InjectionError> {
    let scenario = ctx.scenario;
    let target = scenario.target();
    let kind = scenario.kind();

    match scenario.params() {
        ScenarioParams::ProcessKill { signal, process } => {
            warn!(instance = %target, scenario = %kind, %signal, %process, "sending signal to database process");
            ctx.remote(
                &format!("send SIG{signal} to {process}"),
                &format!("sudo pkill -{signal} {process}"),
            )
            .await?;
            Ok(Impact::None)
        }

        ScenarioParams::SlowQueryStorm { connections, query } => {
            let database = ctx.database.clone();
            let query: Arc<str> = Arc::from(query.as_str());
            let config = ctx.pool_config(
                "slow query storm",
                *connections,
                OnWorkerError::Continue {
                    backoff: STORM_ERROR_BACKOFF,
                },
            );
            let pool = WorkerPool::start(config, move |_| {
                let database = database.clone();
                let query = query.clone();
                async move {
                    database.exec(&query).await?;
                    Ok(WorkerStep::Continue)
                }
            });
            ctx.register_pool_shutdown("stop slow query storm".to_owned(), pool);
            warn!(instance = %target, scenario = %kind, workers = connections, "slow query storm started");
            Ok(Impact::Load {
                queries: *connections as u64,
                connections: 0,
            })
        }

        ScenarioParams::ConnectionFlood { connections } => {
            let held: HeldConnections = Arc::default();
            ctx.cleanup.register(
                "close flood connections",
                close_all(held.clone(), ctx.sink.clone(), target.to_owned()),
            );

            let database = ctx.database.clone();
            let opened = held.clone();
            let config = ctx.pool_config("connection flood", *connections, OnWorkerError::Retire);
            let pool = WorkerPool::start(config, move |_| {
                let database = database.clone();
                let opened = opened.clone();
                async move {
                    let connection = database.connect().await?;
                    opened.lock().push(connection);
                    Ok(WorkerStep::Hold)
                }
            });
            let readiness = pool.readiness();
            ctx.register_pool_shutdown("stop connection flood".to_owned(), pool);

            let ready = readiness.wait(ctx.ready_timeout).await;
            let established = held.lock().len();
            if established == 0 {
                return Err(InjectionError::NothingEstablished {
                    what: "connections",
                    attempted: *connections,
                });
            }
            if established < *connections {
                warn!(instance = %target, scenario = %kind, established, requested = connections, ready, "connection flood partially established");
            } else {
                warn!(instance = %target, scenario = %kind, established, "connection flood established");
            }
            ctx.sink.record_connections(target, established as u64);
            Ok(Impact::Load {
                queries: 0,
                connections: established as u64,
            })
        }

        ScenarioParams::DiskFill { path, fill_percent } => {
            let dir = path.trim_end_matches('/');
            let fill_file = format!("{dir}/{FILL_FILE}");
            ctx.register_remote(
                format!("remove fill file {fill_file}"),
                format!("sudo rm -f {fill_file}"),
            );
            warn!(instance = %target, scenario = %kind, %path, fill_percent, "filling disk");
            ctx.remote(
                "allocate fill file",
                &format!(
                    "sudo fallocate -l $(($(df {path} | tail -1 | awk '{{print $4}}') * {fill_percent} / 100))K {fill_file}"
                ),
            )
            .await?;
            Ok(Impact::None)
        }

        ScenarioParams::ReplicationDelay { delay_secs } => {
            ctx.register_statement("restart replication".to_owned(), "START SLAVE".to_owned());
            ctx.statement("stop replication", "STOP SLAVE").await?;
            warn!(instance = %target, scenario = %kind, delay_secs, "replication stopped");
            sleep(Duration::from_secs(*delay_secs)).await;
            ctx.statement("restart replication", "START SLAVE").await?;
            info!(instance = %target, scenario = %kind, "replication restarted after delay");
            Ok(Impact::ReplicationLag {
                seconds: *delay_secs,
            })
        }

        ScenarioParams::ReplicationBreak { thread } => {
            for name in thread.threads() {
                ctx.register_statement(
                    format!("start replication {name} thread"),
                    format!("START SLAVE {name}_THREAD"),
                );
                ctx.statement(
                    &format!("stop replication {name} thread"),
                    &format!("STOP SLAVE {name}_THREAD"),
                )
                .await?;
                warn!(instance = %target, scenario = %kind, thread = %name, "replication thread stopped");
            }
            Ok(Impact::None)
        }

        ScenarioParams::CpuStress {
            cores,
            load_percent,
        } => {
            let timeout_secs = scenario.duration().as_secs_f64().ceil() as u64;
            warn!(instance = %target, scenario = %kind, cores, load_percent, timeout_secs, "starting cpu stress");
            ctx.remote(
                "start cpu stress",
                &format!(
                    "nohup stress-ng --cpu {cores} --cpu-load {load_percent} --timeout {timeout_secs}s >/dev/null 2>&1 &"
                ),
            )
            .await?;
            Ok(Impact::None)
        }

        ScenarioParams::IoDelay { device, delay_ms } => {
            add_netem(ctx, device, &format!("delay {delay_ms}ms")).await
        }

        ScenarioParams::NetworkLatency {
            device,
            latency_ms,
            jitter_ms,
        } => {
            add_netem(
                ctx,
                device,
                &format!("delay {latency_ms}ms {jitter_ms}ms distribution normal"),
            )
            .await
        }

        ScenarioParams::PacketLoss {
            device,
            loss_percent,
        } => add_netem(ctx, device, &format!("loss {loss_percent}%")).await,
    }
}

async fn add_netem(
    ctx: &mut InjectionContext<'_>,
    device: &str,
    rule: &str,
) -> Result<Impact, InjectionError> {
    ctx.register_remote(
        format!("remove netem qdisc on {device}"),
        netem_remove_command(device),
    );
    warn!(instance = %ctx.scenario.target(), scenario = %ctx.scenario.kind(), %device, %rule, "adding netem qdisc");
    ctx.remote(
        &format!("add netem qdisc on {device}"),
        &format!("sudo tc qdisc add dev {device} root netem {rule}"),
    )
    .await?;
    Ok(Impact::None)
}

/// Deletes the root qdisc only while a netem qdisc is installed, so repeated runs are no-ops.
pub fn netem_remove_command(device: &str) -> String {
    format!(
        "if sudo tc qdisc show dev {device} | grep -q netem; then sudo tc qdisc del dev {device} root; fi"
    )
}

fn close_all(
    held: HeldConnections,
    sink: Arc<dyn TelemetrySink>,
    target: String,
) -> impl FnOnce() -> futures::future::BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
    move || {
        Box::pin(async move {
            let opened = mem::take(&mut *held.lock());
            let total = opened.len();
            let mut failed = 0usize;
            for mut connection in opened {
                if let Err(err) = connection.close().await {
                    failed += 1;
                    warn!(error = %err, "failed to close flood connection");
                }
            }
            info!(instance = %target, closed = total - failed, failed, "flood connections closed");
            sink.record_connections(&target, failed as u64);
            if failed > 0 {
                bail!("{failed} of {total} flood connections failed to close");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netem_removal_is_guarded() {
        assert_eq!(
            netem_remove_command("eth1"),
            "if sudo tc qdisc show dev eth1 | grep -q netem; then sudo tc qdisc del dev eth1 root; fi"
        );
    }

    #[test]
    fn impact_serializes_with_type_tag() {
        let value = serde_json::to_value(Impact::Load {
            queries: 5,
            connections: 0,
        })
        .unwrap();
        assert_eq!(value["type"], "load");
        assert_eq!(value["queries"], 5);
        assert_eq!(serde_json::to_value(Impact::None).unwrap()["type"], "none");
    }
}
