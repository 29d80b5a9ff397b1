//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

use crate::error::ValidationError;

/// Upper bound on how long a disruptive condition may be sustained.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
/// Upper bound on concurrent workers for storm and flood scenarios.
pub const MAX_WORKERS: usize = 10_000;

const DEFAULT_STORM_QUERY: &str = "SELECT SLEEP(10) FROM information_schema.tables LIMIT 1";

fn default_process() -> String {
    "mysqld".to_owned()
}

fn default_storm_query() -> String {
    DEFAULT_STORM_QUERY.to_owned()
}

fn default_device() -> String {
    "eth0".to_owned()
}

/// Fault-injection techniques understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    ProcessKill,
    SlowQueryStorm,
    ConnectionFlood,
    DiskFill,
    ReplicationDelay,
    ReplicationBreak,
    CpuStress,
    IoDelay,
    NetworkLatency,
    PacketLoss,
}

impl ScenarioKind {
    /// Stable label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioKind::ProcessKill => "process_kill",
            ScenarioKind::SlowQueryStorm => "slow_query_storm",
            ScenarioKind::ConnectionFlood => "connection_flood",
            ScenarioKind::DiskFill => "disk_fill",
            ScenarioKind::ReplicationDelay => "replication_delay",
            ScenarioKind::ReplicationBreak => "replication_break",
            ScenarioKind::CpuStress => "cpu_stress",
            ScenarioKind::IoDelay => "io_delay",
            ScenarioKind::NetworkLatency => "network_latency",
            ScenarioKind::PacketLoss => "packet_loss",
        }
    }

    /// Whether the technique talks to the database rather than the host shell.
    pub fn uses_database(&self) -> bool {
        matches!(
            self,
            ScenarioKind::SlowQueryStorm
                | ScenarioKind::ConnectionFlood
                | ScenarioKind::ReplicationDelay
                | ScenarioKind::ReplicationBreak
        )
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals accepted by process-kill scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    #[default]
    Kill,
    Term,
    Stop,
    Cont,
    Hup,
    Int,
    Quit,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Kill => "KILL",
            Signal::Term => "TERM",
            Signal::Stop => "STOP",
            Signal::Cont => "CONT",
            Signal::Hup => "HUP",
            Signal::Int => "INT",
            Signal::Quit => "QUIT",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signal {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let upper = value.trim().to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "KILL" | "9" => Ok(Signal::Kill),
            "TERM" | "15" => Ok(Signal::Term),
            "STOP" | "19" => Ok(Signal::Stop),
            "CONT" | "18" => Ok(Signal::Cont),
            "HUP" | "1" => Ok(Signal::Hup),
            "INT" | "2" => Ok(Signal::Int),
            "QUIT" | "3" => Ok(Signal::Quit),
            _ => Err(ValidationError::Invalid {
                field: "signal",
                reason: format!("unsupported signal {value:?}"),
            }),
        }
    }
}

/// Replication threads that can be stopped by a replication-break scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicationThread {
    Sql,
    Io,
    #[default]
    All,
}

impl ReplicationThread {
    /// Individual threads covered by this selector, in stop order.
    pub fn threads(&self) -> &'static [&'static str] {
        match self {
            ReplicationThread::Sql => &["SQL"],
            ReplicationThread::Io => &["IO"],
            ReplicationThread::All => &["SQL", "IO"],
        }
    }
}

impl FromStr for ReplicationThread {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SQL" => Ok(ReplicationThread::Sql),
            "IO" => Ok(ReplicationThread::Io),
            "ALL" => Ok(ReplicationThread::All),
            _ => Err(ValidationError::Invalid {
                field: "thread",
                reason: format!("expected SQL, IO or ALL, got {value:?}"),
            }),
        }
    }
}

/// Kind-specific parameters. The `type` tag selects the technique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioParams {
    ProcessKill {
        #[serde(default)]
        signal: Signal,
        #[serde(default = "default_process")]
        process: String,
    },
    SlowQueryStorm {
        connections: usize,
        #[serde(default = "default_storm_query")]
        query: String,
    },
    ConnectionFlood {
        connections: usize,
    },
    DiskFill {
        path: String,
        fill_percent: u8,
    },
    ReplicationDelay {
        delay_secs: u64,
    },
    ReplicationBreak {
        #[serde(default)]
        thread: ReplicationThread,
    },
    CpuStress {
        cores: u32,
        load_percent: u8,
    },
    IoDelay {
        device: String,
        delay_ms: u32,
    },
    NetworkLatency {
        #[serde(default = "default_device")]
        device: String,
        latency_ms: u32,
        #[serde(default)]
        jitter_ms: u32,
    },
    PacketLoss {
        #[serde(default = "default_device")]
        device: String,
        loss_percent: u8,
    },
}

impl ScenarioParams {
    /// Storm with the stock blocking query.
    pub fn slow_query_storm(connections: usize) -> Self {
        ScenarioParams::SlowQueryStorm {
            connections,
            query: default_storm_query(),
        }
    }

    pub fn kind(&self) -> ScenarioKind {
        match self {
            ScenarioParams::ProcessKill { .. } => ScenarioKind::ProcessKill,
            ScenarioParams::SlowQueryStorm { .. } => ScenarioKind::SlowQueryStorm,
            ScenarioParams::ConnectionFlood { .. } => ScenarioKind::ConnectionFlood,
            ScenarioParams::DiskFill { .. } => ScenarioKind::DiskFill,
            ScenarioParams::ReplicationDelay { .. } => ScenarioKind::ReplicationDelay,
            ScenarioParams::ReplicationBreak { .. } => ScenarioKind::ReplicationBreak,
            ScenarioParams::CpuStress { .. } => ScenarioKind::CpuStress,
            ScenarioParams::IoDelay { .. } => ScenarioKind::IoDelay,
            ScenarioParams::NetworkLatency { .. } => ScenarioKind::NetworkLatency,
            ScenarioParams::PacketLoss { .. } => ScenarioKind::PacketLoss,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            ScenarioParams::ProcessKill { process, .. } => shell_safe("process", process),
            ScenarioParams::SlowQueryStorm { connections, query } => {
                in_range("connections", *connections as u64, 1, MAX_WORKERS as u64)?;
                not_empty("query", query)
            }
            ScenarioParams::ConnectionFlood { connections } => {
                in_range("connections", *connections as u64, 1, MAX_WORKERS as u64)
            }
            ScenarioParams::DiskFill { path, fill_percent } => {
                shell_safe("path", path)?;
                if !path.starts_with('/') {
                    return Err(ValidationError::Invalid {
                        field: "path",
                        reason: format!("{path:?} must be absolute"),
                    });
                }
                in_range("fill_percent", u64::from(*fill_percent), 1, 99)
            }
            ScenarioParams::ReplicationDelay { delay_secs } => {
                in_range("delay_secs", *delay_secs, 1, MAX_DURATION.as_secs())
            }
            ScenarioParams::ReplicationBreak { .. } => Ok(()),
            ScenarioParams::CpuStress {
                cores,
                load_percent,
            } => {
                in_range("cores", u64::from(*cores), 1, 1024)?;
                in_range("load_percent", u64::from(*load_percent), 1, 100)
            }
            ScenarioParams::IoDelay { device, delay_ms } => {
                shell_safe("device", device)?;
                in_range("delay_ms", u64::from(*delay_ms), 1, 60_000)
            }
            ScenarioParams::NetworkLatency {
                device,
                latency_ms,
                jitter_ms,
            } => {
                shell_safe("device", device)?;
                in_range("latency_ms", u64::from(*latency_ms), 1, 60_000)?;
                in_range("jitter_ms", u64::from(*jitter_ms), 0, u64::from(*latency_ms))
            }
            ScenarioParams::PacketLoss {
                device,
                loss_percent,
            } => {
                shell_safe("device", device)?;
                in_range("loss_percent", u64::from(*loss_percent), 1, 100)
            }
        }
    }
}

/// One validated fault-injection run description. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    target: String,
    host: String,
    params: ScenarioParams,
    #[serde(with = "duration_secs_f64")]
    duration: Duration,
}

impl Scenario {
    /// Validate and build a scenario. Every parameter check happens here, never at run time.
    pub fn new(
        target: impl Into<String>,
        host: impl Into<String>,
        params: ScenarioParams,
        duration: Duration,
    ) -> Result<Self, ValidationError> {
        let target = target.into();
        let host = host.into();
        shell_safe("target", &target)?;
        shell_safe("host", &host)?;
        if duration.is_zero() || duration > MAX_DURATION {
            return Err(ValidationError::DurationOutOfRange {
                actual: duration,
                max: MAX_DURATION,
            });
        }
        params.validate()?;
        Ok(Self {
            target,
            host,
            params,
            duration,
        })
    }

    pub fn kind(&self) -> ScenarioKind {
        self.params.kind()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn params(&self) -> &ScenarioParams {
        &self.params
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Parameters rendered for structured logs.
    pub fn parameters_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.params).unwrap_or(serde_json::Value::Null)
    }
}

/// Scenario as written in a TOML file, before validation.
///
/// ```toml
/// target = "mysql-primary"
/// duration_secs = 60
/// type = "network_latency"
/// latency_ms = 200
/// jitter_ms = 50
/// ```
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioDefinition {
    pub target: String,
    /// Falls back to the daemon's configured target host when omitted.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(rename = "duration_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub duration: Duration,
    #[serde(flatten)]
    pub params: ScenarioParams,
}

impl ScenarioDefinition {
    /// Load a definition from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("unable to read scenario {}", path.as_ref().display()))?;
        contents
            .parse::<Self>()
            .with_context(|| format!("invalid scenario file {}", path.as_ref().display()))
    }

    /// Validate into a runnable [`Scenario`].
    pub fn into_scenario(self, default_host: &str) -> Result<Scenario, ValidationError> {
        let host = self.host.unwrap_or_else(|| default_host.to_owned());
        Scenario::new(self.target, host, self.params, self.duration)
    }
}

impl FromStr for ScenarioDefinition {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        toml::from_str::<Self>(input).map_err(anyhow::Error::new)
    }
}

fn not_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    Ok(())
}

fn shell_safe(field: &'static str, value: &str) -> Result<(), ValidationError> {
    not_empty(field, value)?;
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '@' | '-'));
    if !safe || value.starts_with('-') {
        return Err(ValidationError::UnsafeValue {
            field,
            value: value.to_owned(),
        });
    }
    Ok(())
}

fn in_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

mod duration_secs_f64 {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn builds_valid_latency_scenario() {
        let scenario = Scenario::new(
            "mysql-primary",
            "db1.internal",
            ScenarioParams::NetworkLatency {
                device: "eth0".into(),
                latency_ms: 200,
                jitter_ms: 50,
            },
            secs(30),
        )
        .unwrap();
        assert_eq!(scenario.kind(), ScenarioKind::NetworkLatency);
        assert_eq!(scenario.parameters_json()["latency_ms"], 200);
    }

    #[test]
    fn rejects_zero_and_oversized_connection_counts() {
        for connections in [0, MAX_WORKERS + 1] {
            let err = Scenario::new(
                "t",
                "h",
                ScenarioParams::ConnectionFlood { connections },
                secs(1),
            )
            .unwrap_err();
            assert!(matches!(
                err,
                ValidationError::OutOfRange {
                    field: "connections",
                    ..
                }
            ));
        }
    }

    #[test]
    fn rejects_shell_metacharacters() {
        let err = Scenario::new(
            "t",
            "h",
            ScenarioParams::IoDelay {
                device: "eth0; rm -rf /".into(),
                delay_ms: 10,
            },
            secs(1),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UnsafeValue { field: "device", .. }
        ));

        let err = Scenario::new(
            "t",
            "-oProxyCommand=x",
            ScenarioParams::CpuStress {
                cores: 1,
                load_percent: 50,
            },
            secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::UnsafeValue { field: "host", .. }));
    }

    #[test]
    fn rejects_zero_duration() {
        let err = Scenario::new(
            "t",
            "h",
            ScenarioParams::ReplicationBreak {
                thread: ReplicationThread::All,
            },
            Duration::ZERO,
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::DurationOutOfRange { .. }));
    }

    #[test]
    fn jitter_cannot_exceed_latency() {
        let err = Scenario::new(
            "t",
            "h",
            ScenarioParams::NetworkLatency {
                device: "eth0".into(),
                latency_ms: 10,
                jitter_ms: 20,
            },
            secs(1),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::OutOfRange {
                field: "jitter_ms",
                ..
            }
        ));
    }

    #[test]
    fn disk_fill_requires_absolute_path() {
        let err = Scenario::new(
            "t",
            "h",
            ScenarioParams::DiskFill {
                path: "var/lib/mysql".into(),
                fill_percent: 50,
            },
            secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::Invalid { field: "path", .. }));
    }

    #[test]
    fn signal_parsing_accepts_common_spellings() {
        assert_eq!("SIGKILL".parse::<Signal>().unwrap(), Signal::Kill);
        assert_eq!("term".parse::<Signal>().unwrap(), Signal::Term);
        assert_eq!("9".parse::<Signal>().unwrap(), Signal::Kill);
        assert!("SIGSEGV".parse::<Signal>().is_err());
    }

    #[test]
    fn definition_parses_flattened_toml() {
        let definition: ScenarioDefinition = r#"
            target = "mysql-replica"
            duration_secs = 5
            type = "replication_break"
            thread = "IO"
        "#
        .parse()
        .unwrap();
        let scenario = definition.into_scenario("db2.internal").unwrap();
        assert_eq!(scenario.host(), "db2.internal");
        assert_eq!(
            scenario.params(),
            &ScenarioParams::ReplicationBreak {
                thread: ReplicationThread::Io
            }
        );
        assert_eq!(scenario.duration(), secs(5));
    }

    #[test]
    fn definition_applies_defaults() {
        let definition: ScenarioDefinition = r#"
            target = "mysql-primary"
            host = "db1"
            duration_secs = 2
            type = "slow_query_storm"
            connections = 5
        "#
        .parse()
        .unwrap();
        let scenario = definition.into_scenario("unused").unwrap();
        assert_eq!(scenario.host(), "db1");
        assert_eq!(scenario.params(), &ScenarioParams::slow_query_storm(5));
    }

    #[test]
    fn definition_with_unknown_type_fails_to_parse() {
        let result = r#"
            target = "t"
            duration_secs = 2
            type = "meteor_strike"
        "#
        .parse::<ScenarioDefinition>();
        assert!(result.is_err());
    }
}
