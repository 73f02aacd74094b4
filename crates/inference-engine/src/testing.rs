//! In-memory container runtime and readiness probe for tests of this crate
//! and the crates built on it

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;

use common::error::{Error, Result};

use crate::probe::{ProbeResult, ReadinessProbe};
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, LogStream};

/// Container runtime keeping containers and pulled images in memory
#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerStatus>>,
    images: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
    /// Exit code of containers that crash right after starting
    crash_with: Mutex<Option<i64>>,
    log_lines: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn with_logs<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let runtime = Self::default();
        *runtime.log_lines.lock() = lines.into_iter().map(|l| l.to_string()).collect();
        runtime
    }

    pub fn crash_on_start(&self, exit_code: i64) {
        *self.crash_with.lock() = Some(exit_code);
    }

    /// Registers a running container
    pub fn start(&self, name: &str) {
        self.containers.lock().insert(
            name.to_string(),
            ContainerStatus {
                running: true,
                exit_code: None,
            },
        );
    }

    /// Makes a running container exit
    pub fn kill(&self, name: &str, exit_code: i64) {
        if let Some(status) = self.containers.lock().get_mut(name) {
            status.running = false;
            status.exit_code = Some(exit_code);
        }
    }

    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .lock()
            .iter()
            .filter(|(_, status)| status.running)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Containers known to the runtime, running or exited
    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_present(&self, image: &str) -> Result<bool> {
        Ok(self.images.lock().iter().any(|i| i == image))
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.calls.lock().push(format!("pull {}", image));
        self.images.lock().push(image.to_string());
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<()> {
        self.calls.lock().push(format!("run {}", spec.name));
        let mut containers = self.containers.lock();
        if containers.contains_key(&spec.name) {
            return Err(Error::ExternalService(format!("name {} in use", spec.name)));
        }
        let status = match *self.crash_with.lock() {
            Some(code) => ContainerStatus {
                running: false,
                exit_code: Some(code),
            },
            None => ContainerStatus {
                running: true,
                exit_code: None,
            },
        };
        containers.insert(spec.name.clone(), status);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.calls.lock().push(format!("stop {}", name));
        self.containers.lock().remove(name);
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerStatus>> {
        Ok(self.containers.lock().get(name).copied())
    }

    async fn logs(&self, _name: &str) -> Result<LogStream> {
        Ok(futures::stream::iter(self.log_lines.lock().clone()).boxed())
    }

    async fn tail_logs(&self, _name: &str, lines: usize) -> Result<Vec<String>> {
        let log_lines = self.log_lines.lock();
        let skip = log_lines.len().saturating_sub(lines);
        Ok(log_lines[skip..].to_vec())
    }
}

/// Readiness probe answering from a script
pub struct FakeProbe {
    ready_after: Option<u32>,
    checks: AtomicU32,
    kill: Option<(Arc<FakeRuntime>, String, u32, i64)>,
}

impl FakeProbe {
    /// Ready from the `n`th check on
    pub fn ready_after(n: u32) -> Self {
        Self {
            ready_after: Some(n),
            checks: AtomicU32::new(0),
            kill: None,
        }
    }

    pub fn never() -> Self {
        Self {
            ready_after: None,
            checks: AtomicU32::new(0),
            kill: None,
        }
    }

    /// Kills `container` with `exit_code` during the `after`th check
    pub fn killing(mut self, runtime: Arc<FakeRuntime>, container: &str, after: u32, exit_code: i64) -> Self {
        self.kill = Some((runtime, container.to_string(), after, exit_code));
        self
    }

    pub fn checks(&self) -> u32 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn check(&self) -> ProbeResult {
        let count = self.checks.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((runtime, container, after, exit_code)) = &self.kill {
            if count == *after {
                runtime.kill(container, *exit_code);
            }
        }

        match self.ready_after {
            Some(n) if count >= n => ProbeResult::Ready,
            _ => ProbeResult::NotReady("connection refused".to_string()),
        }
    }

    fn target(&self) -> String {
        "http://localhost:8000/v1/health/ready".to_string()
    }
}
