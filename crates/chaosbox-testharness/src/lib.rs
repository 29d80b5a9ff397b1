//! ---
//! cbx_section: "15-testing-qa-runbook"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Scripted collaborator fakes for chaos session tests."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
//! Scripted collaborators for driving chaos sessions without real hosts or databases.

use std::sync::Arc;

use chaosbox_engine::Collaborators;
use parking_lot::Mutex;

mod database;
mod executor;
mod sink;

pub use database::{FakeConnection, FakeDatabase};
pub use executor::{ExecutedCommand, FakeExecutor};
pub use sink::{RecordingSink, SinkRecord};

/// Fails calls whose text contains `pattern`, either forever or a fixed number of times.
#[derive(Debug, Clone)]
pub(crate) struct FailureRule {
    pattern: String,
    remaining: Option<usize>,
    message: String,
}

impl FailureRule {
    pub(crate) fn always(pattern: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            remaining: None,
            message: message.into(),
        }
    }

    pub(crate) fn times(
        pattern: impl Into<String>,
        times: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            remaining: Some(times),
            message: message.into(),
        }
    }

    /// Message of the first live rule matching `text`, consuming one use of it.
    pub(crate) fn check(rules: &Mutex<Vec<FailureRule>>, text: &str) -> Option<String> {
        let mut rules = rules.lock();
        let rule = rules
            .iter_mut()
            .find(|rule| text.contains(&rule.pattern) && rule.remaining != Some(0))?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.message.clone())
    }
}

/// A fake executor, database, and recording sink wired together.
#[derive(Debug, Default, Clone)]
pub struct Harness {
    pub executor: Arc<FakeExecutor>,
    pub database: Arc<FakeDatabase>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor(mut self, executor: FakeExecutor) -> Self {
        self.executor = Arc::new(executor);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            self.executor.clone(),
            self.database.clone(),
            self.sink.clone(),
        )
    }

    /// Executor commands plus database statements, excluding liveness probes.
    pub fn calls_excluding_probes(&self) -> usize {
        self.executor.commands().iter().filter(|c| *c != "true").count()
            + self.database.statements().len()
    }
}
