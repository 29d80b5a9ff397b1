//! ---
//! cbx_section: "15-testing-qa-runbook"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Scripted collaborator fakes for chaos session tests."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chaosbox_engine::{RemoteExecutor, TransportError};
use parking_lot::Mutex;
use tracing::debug;

use crate::FailureRule;

/// One command observed by [`FakeExecutor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    pub host: String,
    pub command: String,
}

/// Remote executor that records commands and models netem qdisc state per device.
///
/// `tc qdisc add ... netem` fails when a netem qdisc already exists, an unguarded
/// `tc qdisc del` fails when none exists, and the guarded removal always succeeds.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    calls: Mutex<Vec<ExecutedCommand>>,
    rules: Mutex<Vec<FailureRule>>,
    netem: Mutex<BTreeSet<String>>,
    delays: Mutex<Vec<(String, Duration)>>,
    unreachable: bool,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor whose hosts never answer.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    /// Every command containing `pattern` fails.
    pub fn fail_when(&self, pattern: impl Into<String>, message: impl Into<String>) -> &Self {
        self.rules.lock().push(FailureRule::always(pattern, message));
        self
    }

    /// The next `times` commands containing `pattern` fail.
    pub fn fail_times(
        &self,
        pattern: impl Into<String>,
        times: usize,
        message: impl Into<String>,
    ) -> &Self {
        self.rules
            .lock()
            .push(FailureRule::times(pattern, times, message));
        self
    }

    /// Commands containing `pattern` take `delay` before they apply.
    pub fn delay_when(&self, pattern: impl Into<String>, delay: Duration) -> &Self {
        self.delays.lock().push((pattern.into(), delay));
        self
    }

    /// Pretend a netem qdisc is already installed on `device`.
    pub fn with_netem(&self, device: impl Into<String>) -> &Self {
        self.netem.lock().insert(device.into());
        self
    }

    pub fn calls(&self) -> Vec<ExecutedCommand> {
        self.calls.lock().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|call| call.command.clone())
            .collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.command.contains(pattern))
            .count()
    }

    pub fn netem_devices(&self) -> Vec<String> {
        self.netem.lock().iter().cloned().collect()
    }

    fn apply_netem(&self, host: &str, command: &str) -> Result<(), TransportError> {
        let Some(device) = device_after_dev(command) else {
            return Ok(());
        };
        let mut netem = self.netem.lock();
        if command.starts_with("if ") {
            netem.remove(&device);
            return Ok(());
        }
        if command.contains("tc qdisc add") {
            if !netem.insert(device) {
                return Err(command_failed(host, "RTNETLINK answers: File exists"));
            }
        } else if command.contains("tc qdisc del") && !netem.remove(&device) {
            return Err(command_failed(
                host,
                "RTNETLINK answers: No such file or directory",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn execute(&self, host: &str, command: &str) -> Result<(), TransportError> {
        self.calls.lock().push(ExecutedCommand {
            host: host.to_owned(),
            command: command.to_owned(),
        });
        debug!(%host, %command, "fake executor call");
        let delay = self
            .delays
            .lock()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, delay)| *delay);
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        if self.unreachable {
            return Err(TransportError::Unreachable(host.to_owned()));
        }
        if let Some(message) = FailureRule::check(&self.rules, command) {
            return Err(command_failed(host, &message));
        }
        if command.contains("tc qdisc") {
            self.apply_netem(host, command)?;
        }
        Ok(())
    }
}

fn command_failed(host: &str, message: &str) -> TransportError {
    TransportError::Command {
        host: host.to_owned(),
        message: message.to_owned(),
    }
}

fn device_after_dev(command: &str) -> Option<String> {
    let mut words = command.split_whitespace();
    words.find(|word| *word == "dev")?;
    words.next().map(str::to_owned)
}
