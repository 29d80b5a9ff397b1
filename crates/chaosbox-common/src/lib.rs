//! ---
//! cbx_section: "01-core-functionality"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Shared configuration and logging primitives."
//! cbx_version: "v0.0.0-prealpha"
//! cbx_owner: "tbd"
//! ---
//! Shared primitives for the chaosbox workspace: configuration loading and
//! tracing initialisation consumed by the engine and the daemon.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, ExecutorConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, SessionSettings,
    TargetConfig,
};
pub use logging::{init_tracing, LogFormat};
