//! ---
//! cbx_section: "04-daemon"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Process-backed transports for the chaosbox daemon."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
//! Concrete collaborators: `ssh` for host commands, the `mysql` client for statements,
//! and logging stand-ins used by `--dry-run`.

use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chaosbox_common::config::{ExecutorConfig, TargetConfig};
use chaosbox_engine::{DatabaseHandle, HeldConnection, RemoteExecutor, TransportError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Exit status ssh reserves for its own failures (auth, DNS, refused).
const SSH_CONNECT_FAILURE: i32 = 255;

/// mysql client error codes that mean the server was never reached.
const MYSQL_CONNECT_ERRORS: [&str; 3] = ["ERROR 2002", "ERROR 2003", "ERROR 2005"];

/// Runs host commands through the `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    binary: String,
    options: Vec<String>,
    timeout: Duration,
}

impl SshExecutor {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            binary: config.ssh_binary.clone(),
            options: config.ssh_options.clone(),
            timeout: config.command_timeout,
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, host: &str, command: &str) -> Result<(), TransportError> {
        debug!(%host, %command, "running remote command");
        let mut process = Command::new(&self.binary);
        process
            .args(&self.options)
            .arg(host)
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, process.output()).await {
            Err(_) => return Err(TransportError::Timeout(self.timeout)),
            Ok(Err(err)) => {
                return Err(TransportError::Unreachable(format!(
                    "{host} ({} could not start: {err})",
                    self.binary
                )))
            }
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            return Ok(());
        }
        let message = failure_message(&output);
        if output.status.code() == Some(SSH_CONNECT_FAILURE) {
            return Err(TransportError::Unreachable(format!("{host} ({message})")));
        }
        Err(TransportError::Command {
            host: host.to_owned(),
            message,
        })
    }
}

/// Database access through the `mysql` command-line client, one process per call.
#[derive(Clone)]
pub struct MysqlCliHandle {
    binary: String,
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    timeout: Duration,
}

impl MysqlCliHandle {
    pub fn from_config(target: &TargetConfig, executor: &ExecutorConfig) -> Self {
        Self {
            binary: target.mysql_binary.clone(),
            host: target.host.clone(),
            port: target.port,
            user: target.user.clone(),
            password: target.password(),
            timeout: executor.command_timeout,
        }
    }

    fn connection_args(&self) -> Vec<String> {
        vec![
            format!("--host={}", self.host),
            format!("--port={}", self.port),
            format!("--user={}", self.user),
            "--batch".to_owned(),
            "--skip-column-names".to_owned(),
        ]
    }

    fn command(&self) -> Command {
        let mut process = Command::new(&self.binary);
        process.args(self.connection_args()).kill_on_drop(true);
        if let Some(password) = &self.password {
            process.env("MYSQL_PWD", password);
        }
        process
    }

    fn unreachable(&self, detail: impl std::fmt::Display) -> TransportError {
        TransportError::Unreachable(format!("{}:{} ({detail})", self.host, self.port))
    }
}

impl std::fmt::Debug for MysqlCliHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlCliHandle")
            .field("binary", &self.binary)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DatabaseHandle for MysqlCliHandle {
    async fn exec(&self, statement: &str) -> Result<(), TransportError> {
        debug!(host = %self.host, %statement, "executing statement");
        let mut process = self.command();
        process
            .arg(format!("--execute={statement}"))
            .stdin(Stdio::null());

        let output = match timeout(self.timeout, process.output()).await {
            Err(_) => return Err(TransportError::Timeout(self.timeout)),
            Ok(Err(err)) => {
                return Err(self.unreachable(format!("{} could not start: {err}", self.binary)))
            }
            Ok(Ok(output)) => output,
        };
        if output.status.success() {
            return Ok(());
        }
        let message = failure_message(&output);
        if MYSQL_CONNECT_ERRORS
            .iter()
            .any(|code| message.starts_with(code))
        {
            return Err(self.unreachable(message));
        }
        Err(TransportError::Database(message))
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.exec("SELECT 1").await
    }

    async fn connect(&self) -> Result<Box<dyn HeldConnection>, TransportError> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| self.unreachable(format!("{} could not start: {err}", self.binary)))?;

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Database(
                "mysql client started without piped stdio".to_owned(),
            ));
        };

        // The client only answers once the server accepted the session.
        let handshake = async {
            stdin.write_all(b"SELECT 1;\n").await?;
            stdin.flush().await?;
            let mut line = String::new();
            BufReader::new(stdout).read_line(&mut line).await?;
            Ok::<_, std::io::Error>(line)
        };
        let answered = timeout(self.timeout, handshake).await;
        match answered {
            Ok(Ok(line)) if line.trim() == "1" => Ok(Box::new(MysqlHeldConnection {
                child: Some(child),
                stdin: Some(stdin),
                timeout: self.timeout,
            })),
            Ok(Ok(_)) => Err(self.unreachable("session closed before answering")),
            Ok(Err(err)) => Err(self.unreachable(err)),
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        }
    }
}

/// A `mysql` client process kept alive with an idle session.
#[derive(Debug)]
pub struct MysqlHeldConnection {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    timeout: Duration,
}

#[async_trait]
impl HeldConnection for MysqlHeldConnection {
    async fn close(&mut self) -> Result<(), TransportError> {
        // EOF on stdin ends the client session.
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        match timeout(self.timeout, child.wait()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) => Err(TransportError::Database(err.to_string())),
            Err(_) => {
                warn!("mysql client ignored EOF; killing it");
                child
                    .kill()
                    .await
                    .map_err(|err| TransportError::Database(err.to_string()))
            }
        }
    }
}

/// Logs host commands instead of running them.
#[derive(Debug, Default, Clone)]
pub struct LoggingExecutor;

#[async_trait]
impl RemoteExecutor for LoggingExecutor {
    async fn execute(&self, host: &str, command: &str) -> Result<(), TransportError> {
        info!(%host, %command, "dry run: remote command skipped");
        Ok(())
    }
}

/// Logs statements instead of sending them; held connections are free.
#[derive(Debug, Clone)]
pub struct LoggingDatabase {
    instance: String,
}

impl LoggingDatabase {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }
}

#[async_trait]
impl DatabaseHandle for LoggingDatabase {
    async fn exec(&self, statement: &str) -> Result<(), TransportError> {
        info!(instance = %self.instance, %statement, "dry run: statement skipped");
        Ok(())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn HeldConnection>, TransportError> {
        debug!(instance = %self.instance, "dry run: connection simulated");
        Ok(Box::new(DryRunConnection))
    }
}

#[derive(Debug)]
struct DryRunConnection;

#[async_trait]
impl HeldConnection for DryRunConnection {
    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr.to_owned()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn executor(binary: &str, options: &[&str], timeout: Duration) -> SshExecutor {
        SshExecutor {
            binary: binary.to_owned(),
            options: options.iter().map(|option| (*option).to_owned()).collect(),
            timeout,
        }
    }

    fn mysql(binary: &str) -> MysqlCliHandle {
        MysqlCliHandle {
            binary: binary.to_owned(),
            host: "db1.internal".to_owned(),
            port: 3306,
            user: "chaos".to_owned(),
            password: Some("secret".to_owned()),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn ssh_success_and_command_failure() {
        let ok = executor("sh", &["-c", "exit 0", "sh"], Duration::from_secs(5));
        ok.execute("db1", "true").await.unwrap();

        let failing = executor(
            "sh",
            &["-c", "echo 'tc: permission denied' >&2; exit 2", "sh"],
            Duration::from_secs(5),
        );
        let err = failing.execute("db1", "sudo tc").await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Command {
                host: "db1".into(),
                message: "tc: permission denied".into(),
            }
        );
    }

    #[tokio::test]
    async fn ssh_connection_failures_are_unreachable() {
        let refused = executor("sh", &["-c", "exit 255", "sh"], Duration::from_secs(5));
        assert!(matches!(
            refused.execute("db1", "true").await,
            Err(TransportError::Unreachable(_))
        ));

        let missing = executor("/nonexistent/chaosbox-ssh", &[], Duration::from_secs(5));
        assert!(matches!(
            missing.execute("db1", "true").await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn ssh_commands_time_out() {
        let slow = executor("sh", &["-c", "sleep 5", "sh"], Duration::from_millis(100));
        assert_eq!(
            slow.execute("db1", "true").await,
            Err(TransportError::Timeout(Duration::from_millis(100)))
        );
    }

    #[test]
    fn mysql_arguments_never_carry_the_password() {
        let args = mysql("mysql").connection_args();
        assert_eq!(
            args,
            vec![
                "--host=db1.internal",
                "--port=3306",
                "--user=chaos",
                "--batch",
                "--skip-column-names",
            ]
        );
        assert!(!format!("{:?}", mysql("mysql")).contains("secret"));
    }

    #[tokio::test]
    async fn mysql_exit_status_maps_to_transport_errors() {
        mysql("true").exec("STOP SLAVE").await.unwrap();
        assert!(matches!(
            mysql("false").exec("STOP SLAVE").await,
            Err(TransportError::Database(_))
        ));
        assert!(matches!(
            mysql("/nonexistent/chaosbox-mysql").ping().await,
            Err(TransportError::Unreachable(_))
        ));
        assert!(matches!(
            mysql("/nonexistent/chaosbox-mysql").connect().await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn dry_run_transports_accept_everything() {
        LoggingExecutor.execute("db1", "sudo pkill -KILL mysqld").await.unwrap();
        let database = LoggingDatabase::new("mysql-primary");
        database.exec("STOP SLAVE").await.unwrap();
        database.ping().await.unwrap();
        let mut connection = database.connect().await.unwrap();
        connection.close().await.unwrap();
        connection.close().await.unwrap();
    }
}
