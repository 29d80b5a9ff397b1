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
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Raised before any disruptive action; the target is never modified when this is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required text field was blank.
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    /// A value that ends up inside a remote shell command contains unsafe characters.
    #[error("{field} contains characters outside [A-Za-z0-9._:/@-]: {value:?}")]
    UnsafeValue { field: &'static str, value: String },
    /// A numeric parameter fell outside its accepted range.
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },
    /// Parameter combination rejected for a reason not covered above.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    /// Sustain duration outside the permitted window.
    #[error("duration must be greater than zero and at most {max:?}, got {actual:?}")]
    DurationOutOfRange { actual: Duration, max: Duration },
    /// Target-state precondition checked while preparing the session failed.
    #[error("precondition failed for {target}: {reason}")]
    Precondition { target: String, reason: String },
}

/// Failure reported by a collaborator (remote executor or database handle).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The remote command ran but did not succeed.
    #[error("command on {host} failed: {message}")]
    Command { host: String, message: String },
    /// The database rejected or failed a statement.
    #[error("database error: {0}")]
    Database(String),
    /// Host or database could not be reached at all.
    #[error("{0} is unreachable")]
    Unreachable(String),
    /// The collaborator did not answer within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// The disruptive action failed partially or fully. Cleanup always follows.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InjectionError {
    #[error("{step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: TransportError,
    },
    #[error("no {what} could be established ({attempted} attempted)")]
    NothingEstablished { what: &'static str, attempted: usize },
}

impl InjectionError {
    pub(crate) fn step(step: impl Into<String>) -> impl FnOnce(TransportError) -> Self {
        let step = step.into();
        move |source| InjectionError::Step { step, source }
    }
}

/// One reversal action that did not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    /// Label given to the action when it was registered.
    pub action: String,
    /// Rendered error or panic message.
    pub reason: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.action, self.reason)
    }
}

/// Errors returned by [`crate::ChaosSession::run`] instead of an outcome.
#[derive(Debug, Error)]
pub enum ChaosError {
    /// Scenario was rejected before anything touched the target.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Sessions are single-use.
    #[error("chaos session already ran; create a new session per run")]
    AlreadyRun,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_step_wraps_transport_error() {
        let err = InjectionError::step("stop replication")(TransportError::Database(
            "Access denied".into(),
        ));
        assert_eq!(
            err.to_string(),
            "stop replication failed: database error: Access denied"
        );
    }

    #[test]
    fn cleanup_failure_display() {
        let failure = CleanupFailure {
            action: "remove netem rule on eth0".into(),
            reason: "command on db1 failed: exit status 2".into(),
        };
        assert_eq!(
            failure.to_string(),
            "remove netem rule on eth0: command on db1 failed: exit status 2"
        );
    }
}
