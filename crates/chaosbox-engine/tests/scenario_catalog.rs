//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use std::time::Duration;

use chaosbox_engine::{
    ChaosSession, Impact, Outcome, ReplicationThread, Scenario, ScenarioParams, SessionConfig,
    SessionState, Signal,
};
use chaosbox_testharness::Harness;

const TARGET: &str = "mysql-replica";
const HOST: &str = "db2.internal";

fn session(harness: &Harness, params: ScenarioParams, duration: Duration) -> ChaosSession {
    let scenario = Scenario::new(TARGET, HOST, params, duration).unwrap();
    ChaosSession::new(
        scenario,
        harness.collaborators(),
        SessionConfig {
            worker_grace: Duration::from_millis(500),
            ready_timeout: Duration::from_secs(2),
            probe_recovery: false,
            ..SessionConfig::default()
        },
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_query_storm_stops_every_worker_and_reports_impact_once() {
    let harness = Harness::new();
    harness.database.with_exec_delay(Duration::from_millis(20));
    let mut session = session(
        &harness,
        ScenarioParams::slow_query_storm(5),
        Duration::from_secs(2),
    );

    let outcome = session.run().await.unwrap();

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(harness.sink.impacts(), vec![(TARGET.to_owned(), 5, 0)]);
    let reports = session.worker_reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].workers, 5);
    assert_eq!(reports[0].stopped, 5);
    assert!(reports[0].is_clean());
    assert_eq!(harness.database.in_flight(), 0);
    assert!(harness.database.max_in_flight() <= 5);
    assert!(harness
        .database
        .statements()
        .iter()
        .all(|statement| statement.starts_with("SELECT SLEEP(10)")));
    assert_eq!(session.cleanup_executed(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn storm_query_errors_do_not_fail_the_run() {
    let harness = Harness::new();
    harness
        .database
        .with_exec_delay(Duration::from_millis(5))
        .fail_statement("SLEEP", "Lock wait timeout exceeded");
    let mut session = session(
        &harness,
        ScenarioParams::slow_query_storm(3),
        Duration::from_millis(300),
    );

    assert_eq!(session.run().await.unwrap(), Outcome::Success);
    let report = &session.worker_reports()[0];
    assert!(report.failures >= 3);
    assert_eq!(report.stopped, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_flood_counts_only_established_connections() {
    let harness = Harness::new();
    harness.database.fail_connects(3);
    let mut session = session(
        &harness,
        ScenarioParams::ConnectionFlood { connections: 10 },
        Duration::from_millis(200),
    );

    let outcome = session.run().await.unwrap();

    assert_eq!(outcome, Outcome::Success);
    assert_eq!(session.impact(), Impact::Load { queries: 0, connections: 7 });
    assert_eq!(harness.sink.impacts(), vec![(TARGET.to_owned(), 0, 7)]);
    assert_eq!(harness.sink.connections(), vec![7, 0]);
    assert_eq!(harness.database.connect_attempts(), 10);
    assert_eq!(harness.database.closed(), 7);
    assert_eq!(harness.database.open_connections(), 0);

    let report = &session.worker_reports()[0];
    assert_eq!(report.retired, 3);
    assert_eq!(report.stopped, 7);
    assert_eq!(session.cleanup_executed(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_flood_without_any_connection_fails_but_cleans_up() {
    let harness = Harness::new();
    harness.database.fail_connects(4);
    let mut session = session(
        &harness,
        ScenarioParams::ConnectionFlood { connections: 4 },
        Duration::from_secs(30),
    );

    let outcome = session.run().await.unwrap();

    match outcome {
        Outcome::Failed(reason) => assert!(reason.contains("no connections could be established")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(harness.sink.impacts().is_empty());
    assert_eq!(harness.sink.connections(), vec![0]);
    assert_eq!(session.cleanup_executed(), 2);
    assert_eq!(session.state(), SessionState::Completed);
    assert!(harness.sink.states().contains(&SessionState::Sustaining));
}

#[tokio::test]
async fn replication_break_restarts_threads_after_forced_error() {
    let harness = Harness::new();
    harness
        .database
        .fail_statement("STOP SLAVE IO_THREAD", "Access denied; you need SUPER");
    let mut session = session(
        &harness,
        ScenarioParams::ReplicationBreak {
            thread: ReplicationThread::All,
        },
        Duration::from_secs(30),
    );

    let outcome = session.run().await.unwrap();

    match &outcome {
        Outcome::Failed(reason) => assert!(reason.contains("stop replication IO thread failed")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        harness.database.statements(),
        vec![
            "STOP SLAVE SQL_THREAD",
            "STOP SLAVE IO_THREAD",
            "START SLAVE IO_THREAD",
            "START SLAVE SQL_THREAD",
        ]
    );
    assert!(session.cleanup_failures().is_empty());
    assert_eq!(session.state(), SessionState::Completed);
}

#[tokio::test]
async fn replication_restart_failure_is_partially_cleaned() {
    let harness = Harness::new();
    harness
        .database
        .fail_statement("STOP SLAVE IO_THREAD", "Access denied")
        .fail_statement("START SLAVE SQL_THREAD", "Lost connection to MySQL server");
    let mut session = session(
        &harness,
        ScenarioParams::ReplicationBreak {
            thread: ReplicationThread::All,
        },
        Duration::from_secs(30),
    );

    let outcome = session.run().await.unwrap();

    match &outcome {
        Outcome::PartiallyCleaned(reason) => {
            assert!(reason.starts_with("injection failed"));
            assert!(reason.contains("start replication SQL thread"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(session.cleanup_failures().len(), 1);
    assert_eq!(session.cleanup_executed(), 2);
    assert_eq!(harness.sink.events()[0].0, "partially_cleaned");
}

#[tokio::test]
async fn replication_delay_restarts_and_reports_lag() {
    let harness = Harness::new();
    let mut session = session(
        &harness,
        ScenarioParams::ReplicationDelay { delay_secs: 1 },
        Duration::from_millis(50),
    );

    assert_eq!(session.run().await.unwrap(), Outcome::Success);
    assert_eq!(
        harness.database.statements(),
        vec!["STOP SLAVE", "START SLAVE", "START SLAVE"]
    );
    assert_eq!(harness.sink.replication_lag(), vec![1.0]);
    assert_eq!(session.impact(), Impact::ReplicationLag { seconds: 1 });
}

#[tokio::test]
async fn cleanup_count_matches_disruptive_actions() {
    let cases = [
        (
            ScenarioParams::IoDelay {
                device: "nvme0".into(),
                delay_ms: 25,
            },
            1,
        ),
        (
            ScenarioParams::PacketLoss {
                device: "eth0".into(),
                loss_percent: 10,
            },
            1,
        ),
        (
            ScenarioParams::DiskFill {
                path: "/data".into(),
                fill_percent: 80,
            },
            1,
        ),
        (
            ScenarioParams::ReplicationBreak {
                thread: ReplicationThread::Sql,
            },
            1,
        ),
        (
            ScenarioParams::ProcessKill {
                signal: Signal::Kill,
                process: "mysqld".into(),
            },
            0,
        ),
        (
            ScenarioParams::CpuStress {
                cores: 4,
                load_percent: 90,
            },
            0,
        ),
    ];

    for (params, expected_cleanups) in cases {
        let harness = Harness::new();
        let kind = params.kind();
        let mut session = session(&harness, params, Duration::from_millis(20));
        assert_eq!(session.run().await.unwrap(), Outcome::Success, "{kind}");
        assert_eq!(session.cleanup_executed(), expected_cleanups, "{kind}");
        assert_eq!(
            harness.calls_excluding_probes(),
            1 + expected_cleanups,
            "{kind}"
        );
    }
}

#[tokio::test]
async fn guarded_netem_cleanup_is_idempotent() {
    let harness = Harness::new();
    harness
        .executor
        .fail_times("tc qdisc add", 1, "RTNETLINK answers: Operation not permitted");

    let mut failed = session(
        &harness,
        ScenarioParams::PacketLoss {
            device: "eth0".into(),
            loss_percent: 30,
        },
        Duration::from_secs(30),
    );
    match failed.run().await.unwrap() {
        Outcome::Failed(reason) => assert!(reason.contains("add netem qdisc on eth0 failed")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(failed.cleanup_failures().is_empty());

    let mut retried = session(
        &harness,
        ScenarioParams::PacketLoss {
            device: "eth0".into(),
            loss_percent: 30,
        },
        Duration::from_millis(20),
    );
    assert_eq!(retried.run().await.unwrap(), Outcome::Success);
    assert_eq!(harness.executor.count_matching("grep -q netem"), 2);
    assert!(harness.executor.netem_devices().is_empty());
}

#[tokio::test]
async fn host_commands_match_the_catalog() {
    let cases = [
        (
            ScenarioParams::ProcessKill {
                signal: Signal::Term,
                process: "mysqld".into(),
            },
            Duration::from_millis(10),
            "sudo pkill -TERM mysqld",
        ),
        (
            ScenarioParams::CpuStress {
                cores: 2,
                load_percent: 80,
            },
            Duration::from_millis(1500),
            "nohup stress-ng --cpu 2 --cpu-load 80 --timeout 2s >/dev/null 2>&1 &",
        ),
        (
            ScenarioParams::IoDelay {
                device: "sdb".into(),
                delay_ms: 40,
            },
            Duration::from_millis(10),
            "sudo tc qdisc add dev sdb root netem delay 40ms",
        ),
        (
            ScenarioParams::PacketLoss {
                device: "eth0".into(),
                loss_percent: 5,
            },
            Duration::from_millis(10),
            "sudo tc qdisc add dev eth0 root netem loss 5%",
        ),
        (
            ScenarioParams::DiskFill {
                path: "/var/lib/mysql".into(),
                fill_percent: 50,
            },
            Duration::from_millis(10),
            "sudo fallocate -l $(($(df /var/lib/mysql | tail -1 | awk '{print $4}') * 50 / 100))K /var/lib/mysql/chaos-fill.tmp",
        ),
    ];

    for (params, duration, expected) in cases {
        let harness = Harness::new();
        let mut session = session(&harness, params, duration);
        session.run().await.unwrap();
        assert_eq!(harness.executor.commands()[1], expected);
    }
}
