//! Boundary to the container runtime.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::BoxStream;

use common::credentials::Secret;
use common::error::Result;

/// Lazily produced log lines of a container. Ends when the container
/// stops; dropping it detaches from the container.
pub type LogStream = BoxStream<'static, String>;

/// Bind mount of a host path into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

/// Publication of a container port on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything needed to start a container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub mounts: Vec<Mount>,
    /// Plain environment variables
    pub env: BTreeMap<String, String>,
    /// Environment variables whose values must not show up in process
    /// listings or logs
    pub secrets: BTreeMap<String, Secret>,
    pub port: PortMapping,
    /// GPU request, e.g. `all`; `None` runs without GPUs
    pub gpus: Option<String>,
    pub shm_size: Option<String>,
}

/// Observed state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    /// Exit code once the container has stopped
    pub exit_code: Option<i64>,
}

/// A process supervisor able to run images as named containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether `image` is available locally
    async fn image_present(&self, image: &str) -> Result<bool>;

    /// Fetches `image` from its registry
    async fn pull(&self, image: &str) -> Result<()>;

    /// Starts a detached container
    async fn run(&self, spec: &ContainerSpec) -> Result<()>;

    /// Stops and removes the container. Succeeds if there is none.
    async fn stop(&self, name: &str) -> Result<()>;

    /// State of the container, `None` if it does not exist
    async fn inspect(&self, name: &str) -> Result<Option<ContainerStatus>>;

    /// Follows the container's output from its start
    async fn logs(&self, name: &str) -> Result<LogStream>;

    /// Last `lines` lines of the container's output
    async fn tail_logs(&self, name: &str, lines: usize) -> Result<Vec<String>>;
}
