//! Configuration management for nim-deploy
//!
//! Settings are layered: built-in defaults, an optional TOML file, then
//! `NIM_DEPLOY__*` environment variables. Command-line overrides are
//! applied by the caller on the resulting [`DeployConfig`].

pub mod loader;
pub mod settings;

// Re-export commonly used types
pub use loader::{ConfigLoader, ENV_PREFIX};
pub use settings::{
    ContainerSettings, DeployConfig, ProbeSettings, RegistrySettings, RetrySettings, CACHE_SUBDIR,
};
