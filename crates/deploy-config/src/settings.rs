//! Typed settings and their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};

use common::error::{Error, Result};

/// Directory under the workdir shared by all deployments as the server cache
pub const CACHE_SUBDIR: &str = ".cache/nim";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Root of the on-disk model layout
    pub workdir: PathBuf,
    pub registry: RegistrySettings,
    pub container: ContainerSettings,
    pub probe: ProbeSettings,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("./workdir"),
            registry: RegistrySettings::default(),
            container: ContainerSettings::default(),
            probe: ProbeSettings::default(),
        }
    }
}

impl DeployConfig {
    /// Cache directory mounted into every container
    pub fn cache_dir(&self) -> PathBuf {
        self.workdir.join(CACHE_SUBDIR)
    }

    /// Makes `workdir` absolute relative to `base`
    pub fn resolve_workdir(&mut self, base: &Path) {
        if self.workdir.is_relative() {
            let relative = self.workdir.strip_prefix(".").unwrap_or(&self.workdir).to_path_buf();
            self.workdir = base.join(relative);
        }
    }

    /// Rejects settings the pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.workdir.as_os_str().is_empty() {
            return Err(Error::Config("workdir must not be empty".to_string()));
        }
        if self.registry.max_concurrent_downloads == 0 {
            return Err(Error::Config(
                "registry.max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        if self.registry.retry.max_attempts == 0 {
            return Err(Error::Config(
                "registry.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.container.port == 0 {
            return Err(Error::Config("container.port must not be 0".to_string()));
        }
        if self.container.name.trim().is_empty() {
            return Err(Error::Config("container.name must not be empty".to_string()));
        }
        if self.probe.interval_secs == 0 || self.probe.interval_secs > self.probe.timeout_secs {
            return Err(Error::Config(format!(
                "probe.interval_secs ({}) must be between 1 and probe.timeout_secs ({})",
                self.probe.interval_secs, self.probe.timeout_secs
            )));
        }
        if !self.probe.path.starts_with('/') {
            return Err(Error::Config(format!(
                "probe.path '{}' must start with '/'",
                self.probe.path
            )));
        }
        Ok(())
    }
}

/// Remote artifact registry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub endpoint: String,
    pub revision: String,
    pub max_concurrent_downloads: usize,
    pub request_timeout_secs: u64,
    pub retry: RetrySettings,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            revision: "main".to_string(),
            max_concurrent_downloads: 4,
            request_timeout_secs: 3600,
            retry: RetrySettings::default(),
        }
    }
}

impl RegistrySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Backoff for transient registry failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

/// Inference container settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Name of the single active deployment's container
    pub name: String,
    pub image: String,
    pub tag: String,
    pub port: u16,
    /// Container runtime executable
    pub runtime_bin: String,
    pub shm_size: String,
    /// Value of `--gpus`; empty disables GPU access
    pub gpus: String,
    pub grace_period_secs: u64,
    /// Log lines attached to crash reports
    pub crash_log_lines: usize,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            name: "GGUF-NIM".to_string(),
            image: "nvcr.io/nim/nvidia/llm-nim".to_string(),
            tag: "latest".to_string(),
            port: 8000,
            runtime_bin: "docker".to_string(),
            shm_size: "16GB".to_string(),
            gpus: "all".to_string(),
            grace_period_secs: 10,
            crash_log_lines: 50,
        }
    }
}

impl ContainerSettings {
    /// Full image reference, `image:tag`
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }

    /// Image repository as known to the image catalog, without registry host
    pub fn catalog_repo(&self) -> &str {
        match self.image.split_once('/') {
            Some((host, rest)) if host.contains('.') => rest,
            _ => &self.image,
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Readiness probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub path: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 600,
            path: "/v1/health/ready".to_string(),
        }
    }
}

impl ProbeSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// URL of the readiness endpoint for a server published on `port`
    pub fn url(&self, port: u16) -> String {
        format!("http://localhost:{}{}", port, self.path)
    }
}
