//! Lifecycle of the single inference container
//!
//! At most one deployment is active per host: deploying replaces whatever
//! container currently holds the configured name.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use common::credentials::Secret;
use common::deployment::DeploymentRecord;
use common::error::{Error, Result};
use deploy_config::ContainerSettings;

use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, LogStream, Mount, PortMapping};

/// Directory inside the container holding mounted models
pub const MODEL_MOUNT_ROOT: &str = "/opt/models";
/// Cache directory of the inference server inside the container
pub const CACHE_MOUNT: &str = "/opt/nim/.cache";
/// Port the inference server listens on inside the container
pub const SERVER_PORT: u16 = 8000;
/// Environment variable carrying the container registry API key
pub const API_KEY_ENV: &str = "NGC_API_KEY";

const GRACE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Starts, inspects and stops the inference container
pub struct ContainerOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    settings: ContainerSettings,
    grace_period: Duration,
    poll_interval: Duration,
}

impl ContainerOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: ContainerSettings) -> Self {
        let grace_period = settings.grace_period();
        Self {
            runtime,
            settings,
            grace_period,
            poll_interval: GRACE_POLL_INTERVAL,
        }
    }

    /// Overrides how long a fresh container is watched for an early exit
    pub fn with_grace_period(mut self, grace_period: Duration, poll_interval: Duration) -> Self {
        self.grace_period = grace_period;
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    /// Name every deployment's container runs under
    pub fn container_name(&self) -> &str {
        &self.settings.name
    }

    /// Container definition for `record`
    pub fn container_spec(&self, record: &DeploymentRecord, api_key: &Secret) -> ContainerSpec {
        let served_name = record.served_model_name();
        let model_path = format!("{}/{}", MODEL_MOUNT_ROOT, served_name);

        let mut env = BTreeMap::new();
        env.insert("NIM_MODEL_NAME".to_string(), model_path.clone());
        env.insert("NIM_SERVED_MODEL_NAME".to_string(), served_name);
        env.insert(
            "FINAL_MODEL_DIR".to_string(),
            record.host_directory.display().to_string(),
        );

        let mut secrets = BTreeMap::new();
        secrets.insert(API_KEY_ENV.to_string(), api_key.clone());

        let non_empty = |value: &str| (!value.is_empty()).then(|| value.to_string());

        ContainerSpec {
            image: self.settings.image_ref(),
            name: record.container_name.clone(),
            mounts: vec![
                Mount {
                    host_path: record.host_directory.clone(),
                    container_path: model_path,
                    read_only: true,
                },
                Mount {
                    host_path: record.cache_directory.clone(),
                    container_path: CACHE_MOUNT.to_string(),
                    read_only: false,
                },
            ],
            env,
            secrets,
            port: PortMapping {
                host_port: record.port,
                container_port: SERVER_PORT,
            },
            gpus: non_empty(&self.settings.gpus),
            shm_size: non_empty(&self.settings.shm_size),
        }
    }

    /// Pulls the configured image unless it is already available
    pub async fn ensure_image(&self) -> Result<()> {
        let image = self.settings.image_ref();
        if self.runtime.image_present(&image).await? {
            debug!("Using existing image {}", image);
            return Ok(());
        }
        self.runtime.pull(&image).await
    }

    /// Starts the container for `record`, replacing any container of the
    /// same name, and watches it for the grace period. A container that
    /// exits in that window is reported as crashed with its last log lines.
    pub async fn deploy(&self, record: &DeploymentRecord, api_key: &Secret) -> Result<()> {
        self.ensure_image().await?;

        let name = &record.container_name;
        if let Some(existing) = self.runtime.inspect(name).await? {
            info!(
                container = %name,
                running = existing.running,
                "Replacing existing container"
            );
            self.runtime.stop(name).await?;
        }

        let spec = self.container_spec(record, api_key);
        info!(
            container = %name,
            image = %spec.image,
            port = record.port,
            "Starting {}",
            record.served_model_name()
        );
        self.runtime.run(&spec).await?;

        self.watch_grace_period(name).await
    }

    async fn watch_grace_period(&self, name: &str) -> Result<()> {
        let deadline = Instant::now() + self.grace_period;

        loop {
            match self.runtime.inspect(name).await? {
                Some(ContainerStatus { running: true, .. }) => {}
                status => {
                    let exit_code = status.and_then(|s| s.exit_code);
                    let logs = self
                        .runtime
                        .tail_logs(name, self.settings.crash_log_lines)
                        .await
                        .unwrap_or_else(|e| {
                            warn!("Could not read logs of {}: {}", name, e);
                            Vec::new()
                        });
                    return Err(Error::ContainerCrash {
                        container: name.to_string(),
                        exit_code,
                        logs,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(container = name, "Survived grace period");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn status(&self, name: &str) -> Result<Option<ContainerStatus>> {
        self.runtime.inspect(name).await
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .runtime
            .inspect(name)
            .await?
            .map(|status| status.running)
            .unwrap_or(false))
    }

    /// Stops and removes the container; a missing container is not an error
    pub async fn stop(&self, name: &str) -> Result<()> {
        info!(container = name, "Stopping container");
        self.runtime.stop(name).await
    }

    /// Follows the container's output. Can be called again after the
    /// returned stream ends.
    pub async fn stream_logs(&self, name: &str) -> Result<LogStream> {
        self.runtime.logs(name).await
    }

    pub async fn tail_logs(&self, name: &str, lines: usize) -> Result<Vec<String>> {
        self.runtime.tail_logs(name, lines).await
    }
}
