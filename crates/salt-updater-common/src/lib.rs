//! ---
//! ems_section: "04-configuration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the updater runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the salt-updater workspace.
//! This crate exposes configuration loading, logging, and version metadata
//! utilities consumed by the daemon, the control CLI, and the library crates.

pub mod config;
pub mod logging;
pub mod version;

pub use config::{
    AppConfig, ConnectivityConfig, LoadedAppConfig, LoggingConfig, ManifestFormat,
    MetricsConfig, PathsConfig, RpcConfig, ScheduleConfig, ToolConfig, VersioningConfig,
};
pub use logging::{init_cli_tracing, init_tracing, LogFormat};
pub use version::VersionInfo;
