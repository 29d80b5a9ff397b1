//! ---
//! cbx_section: "15-testing-qa-runbook"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Scripted collaborator fakes for chaos session tests."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chaosbox_engine::{DatabaseHandle, HeldConnection, TransportError};
use parking_lot::Mutex;
use tokio::time::sleep;

use crate::FailureRule;

#[derive(Debug, Default)]
struct Counters {
    pings: AtomicUsize,
    connects: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Database handle that records statements and counts connections.
#[derive(Debug, Default)]
pub struct FakeDatabase {
    statements: Mutex<Vec<String>>,
    rules: Mutex<Vec<FailureRule>>,
    counters: Arc<Counters>,
    failing_connects: AtomicUsize,
    failing_pings: AtomicUsize,
    down: AtomicBool,
    exec_delay: Mutex<Option<Duration>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement containing `pattern` fails.
    pub fn fail_statement(&self, pattern: impl Into<String>, message: impl Into<String>) -> &Self {
        self.rules.lock().push(FailureRule::always(pattern, message));
        self
    }

    /// The first `count` connect attempts fail.
    pub fn fail_connects(&self, count: usize) -> &Self {
        self.failing_connects.store(count, Ordering::SeqCst);
        self
    }

    /// The next `count` pings fail before the database answers again.
    pub fn fail_pings(&self, count: usize) -> &Self {
        self.failing_pings.store(count, Ordering::SeqCst);
        self
    }

    /// Pings fail until [`FakeDatabase::set_down`] is called with `false`.
    pub fn set_down(&self, down: bool) -> &Self {
        self.down.store(down, Ordering::SeqCst);
        self
    }

    /// Each statement takes this long to complete.
    pub fn with_exec_delay(&self, delay: Duration) -> &Self {
        *self.exec_delay.lock() = Some(delay);
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.statements
            .lock()
            .iter()
            .filter(|statement| statement.contains(pattern))
            .count()
    }

    pub fn pings(&self) -> usize {
        self.counters.pings.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::SeqCst)
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.opened() - self.closed()
    }

    /// Statements currently executing.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseHandle for FakeDatabase {
    async fn exec(&self, statement: &str) -> Result<(), TransportError> {
        self.statements.lock().push(statement.to_owned());
        let _guard = InFlight::enter(&self.counters);
        let delay = *self.exec_delay.lock();
        match delay {
            Some(delay) => sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
        match FailureRule::check(&self.rules, statement) {
            Some(message) => Err(TransportError::Database(message)),
            None => Ok(()),
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.counters.pings.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) || take_one(&self.failing_pings) {
            return Err(TransportError::Unreachable("fake database".into()));
        }
        Ok(())
    }

    async fn connect(&self) -> Result<Box<dyn HeldConnection>, TransportError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if take_one(&self.failing_connects) {
            return Err(TransportError::Database("Too many connections".into()));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            counters: self.counters.clone(),
            closed: false,
        }))
    }
}

/// Connection handed out by [`FakeDatabase::connect`].
#[derive(Debug)]
pub struct FakeConnection {
    counters: Arc<Counters>,
    closed: bool,
}

#[async_trait]
impl HeldConnection for FakeConnection {
    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}
