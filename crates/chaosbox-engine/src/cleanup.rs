//! ---
//! cbx_section: "02-fault-injection"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Fault-injection execution engine."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::error::CleanupFailure;

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct CleanupEntry {
    label: String,
    action: CleanupFn,
}

/// Ordered reversal actions collected while a scenario injects its faults.
///
/// Actions run at most once, last registered first, one at a time. Failures and panics
/// are collected instead of short-circuiting so every registered reversal is attempted.
#[derive(Default)]
pub struct CleanupRegistry {
    pending: Vec<CleanupEntry>,
    executed: usize,
    drained: bool,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reversal action.
    pub fn register<F, Fut>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = label.into();
        debug!(action = %label, position = self.pending.len(), "cleanup action registered");
        self.pending.push(CleanupEntry {
            label,
            action: Box::new(move || action().boxed()),
        });
    }

    /// Number of actions waiting to run.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of actions invoked so far, successful or not.
    pub fn executed(&self) -> usize {
        self.executed
    }

    /// Labels of the pending actions in registration order.
    pub fn labels(&self) -> Vec<&str> {
        self.pending.iter().map(|entry| entry.label.as_str()).collect()
    }

    /// True once [`CleanupRegistry::run_all`] has been called.
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Invoke every pending action in reverse registration order and return the failures.
    ///
    /// Calling this again only runs actions registered since the previous call.
    pub async fn run_all(&mut self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        while let Some(CleanupEntry { label, action }) = self.pending.pop() {
            self.executed += 1;
            debug!(action = %label, "running cleanup action");
            match AssertUnwindSafe(action()).catch_unwind().await {
                Ok(Ok(())) => info!(action = %label, "cleanup action completed"),
                Ok(Err(err)) => {
                    warn!(action = %label, error = %format!("{err:#}"), "cleanup action failed");
                    failures.push(CleanupFailure {
                        action: label,
                        reason: format!("{err:#}"),
                    });
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    error!(action = %label, %reason, "cleanup action panicked");
                    failures.push(CleanupFailure {
                        action: label,
                        reason: format!("panicked: {reason}"),
                    });
                }
            }
        }
        self.drained = true;
        failures
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending", &self.labels())
            .field("executed", &self.executed)
            .field("drained", &self.drained)
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
