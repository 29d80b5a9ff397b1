//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
//! Capability interfaces the engine drives. Concrete transports (ssh, database
//! drivers) live outside the engine and are injected per session.

use async_trait::async_trait;

use crate::error::TransportError;

/// Runs one shell command on a named host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync + 'static {
    /// Execute `command` on `host`, succeeding only when the command exits cleanly.
    async fn execute(&self, host: &str, command: &str) -> Result<(), TransportError>;
}

/// Administrative access to the target database.
#[async_trait]
pub trait DatabaseHandle: Send + Sync + 'static {
    /// Execute a single statement, discarding any rows.
    async fn exec(&self, statement: &str) -> Result<(), TransportError>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Open a dedicated connection that stays established until closed.
    async fn connect(&self) -> Result<Box<dyn HeldConnection>, TransportError>;
}

/// A database connection held open on purpose (connection floods).
#[async_trait]
pub trait HeldConnection: Send + Sync {
    /// Close the connection. Closing an already closed connection is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}
