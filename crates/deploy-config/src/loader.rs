//! Layered configuration loading.

use std::path::PathBuf;

use config::{Config, Environment, File};
use tracing::debug;

use common::error::{Error, Result};

use crate::settings::DeployConfig;

/// Default prefix for environment overrides, e.g. `NIM_DEPLOY__CONTAINER__PORT`
pub const ENV_PREFIX: &str = "NIM_DEPLOY";

/// Builds a [`DeployConfig`] from defaults, a TOML file and the environment
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Uses `path` instead of the per-user config file. Unlike the default
    /// file, an explicit file must exist.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Per-user config file, `<config dir>/nim-deploy/config.toml`
    pub fn default_file() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nim-deploy").join("config.toml"))
    }

    /// Loads and validates the configuration
    pub fn load(&self) -> Result<DeployConfig> {
        let defaults = Config::try_from(&DeployConfig::default()).map_err(config_error)?;
        let mut builder = Config::builder().add_source(defaults);

        match &self.file {
            Some(path) => {
                debug!("Loading configuration from {}", path.display());
                builder = builder.add_source(File::from(path.as_path()).required(true));
            }
            None => {
                if let Some(path) = Self::default_file() {
                    debug!("Loading optional configuration from {}", path.display());
                    builder = builder.add_source(File::from(path).required(false));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: DeployConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn config_error(err: config::ConfigError) -> Error {
    Error::Config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "workdir = \"/data/models\"\n\n[container]\nport = 9000\ntag = \"1.12.0\"\n\n[probe]\ntimeout_secs = 120"
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_file(&path)
            .with_env_prefix("NIM_DEPLOY_TEST_FILE")
            .load()
            .unwrap();

        assert_eq!(config.workdir, PathBuf::from("/data/models"));
        assert_eq!(config.container.port, 9000);
        assert_eq!(config.container.image_ref(), "nvcr.io/nim/nvidia/llm-nim:1.12.0");
        assert_eq!(config.probe.timeout_secs, 120);
        assert_eq!(config.probe.interval_secs, 5);
        assert_eq!(config.container.name, "GGUF-NIM");
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[registry]\nmax_concurrent_downloads = 2\n").unwrap();

        std::env::set_var("NIM_DEPLOY_TEST_ENV__REGISTRY__MAX_CONCURRENT_DOWNLOADS", "8");
        std::env::set_var("NIM_DEPLOY_TEST_ENV__CONTAINER__NAME", "Other-NIM");

        let config = ConfigLoader::new()
            .with_file(&path)
            .with_env_prefix("NIM_DEPLOY_TEST_ENV")
            .load()
            .unwrap();

        assert_eq!(config.registry.max_concurrent_downloads, 8);
        assert_eq!(config.container.name, "Other-NIM");
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::new()
            .with_file(dir.path().join("missing.toml"))
            .with_env_prefix("NIM_DEPLOY_TEST_MISSING")
            .load();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[probe]\ninterval_secs = 0\n").unwrap();

        let result = ConfigLoader::new()
            .with_file(&path)
            .with_env_prefix("NIM_DEPLOY_TEST_INVALID")
            .load();
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
