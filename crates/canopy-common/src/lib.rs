//! ---
//! canopy_section: "01-shared-runtime"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Shared primitives for the console runtime."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
//! Configuration loading and tracing setup consumed across the Canopy workspace.

pub mod config;
pub mod logging;

pub use config::{
    AutosaveConfig, BackendConfig, ConsoleConfig, EventsConfig, LoadedConsoleConfig,
    LoggingConfig, WatchdogConfig,
};
pub use logging::{init_tracing, LogFormat};
