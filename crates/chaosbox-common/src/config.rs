//! ---
//! cbx_section: "01-core-functionality"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Shared configuration and logging primitives."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

fn default_target_name() -> String {
    "mysql-primary".to_owned()
}

fn default_target_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_target_port() -> u16 {
    3306
}

fn default_target_user() -> String {
    "root".to_owned()
}

fn default_password_env() -> String {
    "CHAOSBOX_MYSQL_PASSWORD".to_owned()
}

fn default_mysql_binary() -> String {
    "mysql".to_owned()
}

fn default_ssh_binary() -> String {
    "ssh".to_owned()
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_worker_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_recovery() -> bool {
    true
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_recovery_poll() -> Duration {
    Duration::from_millis(500)
}

/// Primary configuration object for the chaosbox daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub session: SessionSettings,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "CHAOSBOX_CONFIG";

    /// Load configuration from disk, respecting the `CHAOSBOX_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.target.validate()?;
        self.session.validate()?;
        if self.executor.ssh_binary.trim().is_empty() {
            return Err(anyhow!("executor.ssh_binary must not be empty"));
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Settings for the Prometheus exporter started by the daemon.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
    /// How long the exporter stays up after the scenario so a final scrape can land.
    #[serde(default, rename = "linger_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub linger: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
            linger: Duration::ZERO,
        }
    }
}

/// Database instance targeted by chaos scenarios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Logical instance name used for metric labels.
    #[serde(default = "default_target_name")]
    pub name: String,
    #[serde(default = "default_target_host")]
    pub host: String,
    #[serde(default = "default_target_port")]
    pub port: u16,
    #[serde(default = "default_target_user")]
    pub user: String,
    /// Environment variable holding the database password. Never stored in the file.
    #[serde(default = "default_password_env")]
    pub password_env: String,
    #[serde(default = "default_mysql_binary")]
    pub mysql_binary: String,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: default_target_name(),
            host: default_target_host(),
            port: default_target_port(),
            user: default_target_user(),
            password_env: default_password_env(),
            mysql_binary: default_mysql_binary(),
        }
    }
}

impl TargetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("target.name must not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("target.host must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("target.port must be non-zero"));
        }
        Ok(())
    }

    /// Resolve the password from the configured environment variable, if set.
    pub fn password(&self) -> Option<String> {
        std::env::var(&self.password_env).ok()
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    /// Extra arguments placed before the host, e.g. `["-o", "BatchMode=yes"]`.
    #[serde(default)]
    pub ssh_options: Vec<String>,
    #[serde(default = "default_command_timeout", rename = "command_timeout_secs")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub command_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            ssh_options: Vec::new(),
            command_timeout: default_command_timeout(),
        }
    }
}

/// Timing knobs applied to every chaos session.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_worker_grace", rename = "worker_grace_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub worker_grace: Duration,
    #[serde(default = "default_ready_timeout", rename = "ready_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ready_timeout: Duration,
    #[serde(default, rename = "impact_interval_ms")]
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub impact_interval: Option<Duration>,
    #[serde(default = "default_probe_recovery")]
    pub probe_recovery: bool,
    #[serde(default = "default_recovery_timeout", rename = "recovery_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recovery_timeout: Duration,
    #[serde(default = "default_recovery_poll", rename = "recovery_poll_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recovery_poll: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            worker_grace: default_worker_grace(),
            ready_timeout: default_ready_timeout(),
            impact_interval: None,
            probe_recovery: default_probe_recovery(),
            recovery_timeout: default_recovery_timeout(),
            recovery_poll: default_recovery_poll(),
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.worker_grace.is_zero() {
            return Err(anyhow!("session.worker_grace_ms must be greater than zero"));
        }
        if self.recovery_poll.is_zero() {
            return Err(anyhow!("session.recovery_poll_ms must be greater than zero"));
        }
        if matches!(self.impact_interval, Some(interval) if interval.is_zero()) {
            return Err(anyhow!("session.impact_interval_ms must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config: AppConfig = "".parse().unwrap();
        assert_eq!(config.target.name, "mysql-primary");
        assert_eq!(config.target.port, 3306);
        assert_eq!(config.session.worker_grace, Duration::from_secs(5));
        assert!(config.session.impact_interval.is_none());
        assert!(config.metrics.enabled);
    }

    #[test]
    fn parses_durations_and_overrides() {
        let config: AppConfig = r#"
            [target]
            name = "replica-2"
            host = "db2.internal"

            [session]
            worker_grace_ms = 250
            impact_interval_ms = 1000
            probe_recovery = false

            [metrics]
            listen = "127.0.0.1:9100"
            linger_secs = 15
        "#
        .parse()
        .unwrap();
        assert_eq!(config.target.name, "replica-2");
        assert_eq!(config.session.worker_grace, Duration::from_millis(250));
        assert_eq!(config.session.impact_interval, Some(Duration::from_secs(1)));
        assert!(!config.session.probe_recovery);
        assert_eq!(config.metrics.linger, Duration::from_secs(15));
    }

    #[test]
    fn rejects_zero_grace() {
        let err = "[session]\nworker_grace_ms = 0\n"
            .parse::<AppConfig>()
            .unwrap_err();
        assert!(err.to_string().contains("worker_grace_ms"));
    }

    #[test]
    fn loads_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chaosbox.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[target]\nname = \"from-disk\"").unwrap();

        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.target.name, "from-disk");
    }
}
