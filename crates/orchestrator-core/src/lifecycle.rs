//! Readiness polling and container log following
//!
//! While a deployment is probed, the container's output is followed on a
//! separate task so that diagnostics are at hand when the container dies,
//! without ever blocking the probe loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use common::error::Result;
use common::utils::format_duration;
use inference_engine::{ContainerOrchestrator, LogStream, ProbeResult, ReadinessProbe};
use logging::CONTAINER_TARGET;

/// How a probe loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    /// The container stopped while being probed
    ContainerDied { exit_code: Option<i64> },
    TimedOut,
}

/// Polls `probe` every `interval` until it succeeds, the container stops
/// running or `timeout` elapses.
pub async fn wait_until_ready(
    probe: &dyn ReadinessProbe,
    orchestrator: &ContainerOrchestrator,
    container: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<ProbeOutcome> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempt: u32 = 0;

    info!(
        "Waiting up to {} for {} to become ready",
        format_duration(timeout),
        probe.target()
    );

    loop {
        attempt += 1;

        match probe.check().await {
            ProbeResult::Ready => {
                info!(
                    attempt,
                    "{} ready after {}",
                    container,
                    format_duration(started.elapsed())
                );
                return Ok(ProbeOutcome::Ready);
            }
            ProbeResult::NotReady(observed) => {
                debug!(attempt, "{} not ready yet: {}", container, observed);
            }
        }

        match orchestrator.status(container).await? {
            Some(status) if status.running => {}
            status => {
                return Ok(ProbeOutcome::ContainerDied {
                    exit_code: status.and_then(|s| s.exit_code),
                });
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(ProbeOutcome::TimedOut);
        }

        if attempt % 6 == 0 {
            info!(
                "Still waiting for {} ({} elapsed)",
                container,
                format_duration(started.elapsed())
            );
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

/// Logs a container's output under the `container` target and keeps the
/// most recent lines. The follower task is stopped on drop.
pub struct LogFollower {
    recent: Arc<Mutex<VecDeque<String>>>,
    handle: JoinHandle<()>,
}

impl LogFollower {
    pub fn spawn(mut stream: LogStream, container: impl Into<String>, capacity: usize) -> Self {
        let container = container.into();
        let recent = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));
        let buffer = recent.clone();

        let handle = tokio::spawn(async move {
            while let Some(line) = stream.next().await {
                info!(target: CONTAINER_TARGET, container = %container, "{}", line);

                let mut buffer = buffer.lock();
                if buffer.len() == capacity {
                    buffer.pop_front();
                }
                if capacity > 0 {
                    buffer.push_back(line);
                }
            }
            debug!("Log stream of {} ended", container);
        });

        Self { recent, handle }
    }

    /// Most recent lines, oldest first
    pub fn recent(&self) -> Vec<String> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for LogFollower {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference_engine::testing::{FakeProbe, FakeRuntime};
    use deploy_config::ContainerSettings;

    fn orchestrator(runtime: Arc<FakeRuntime>) -> ContainerOrchestrator {
        ContainerOrchestrator::new(runtime, ContainerSettings::default())
    }

    #[tokio::test]
    async fn test_ready_after_a_few_attempts() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.start("GGUF-NIM");
        let probe = FakeProbe::ready_after(3);

        let outcome = wait_until_ready(
            &probe,
            &orchestrator(runtime),
            "GGUF-NIM",
            Duration::from_millis(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(outcome, ProbeOutcome::Ready);
        assert_eq!(probe.checks(), 3);
    }

    #[tokio::test]
    async fn test_dead_container_ends_probing_early() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.start("GGUF-NIM");
        let probe = FakeProbe::never().killing(runtime.clone(), "GGUF-NIM", 2, 137);

        let started = std::time::Instant::now();
        let outcome = wait_until_ready(
            &probe,
            &orchestrator(runtime),
            "GGUF-NIM",
            Duration::from_millis(1),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert_eq!(outcome, ProbeOutcome::ContainerDied { exit_code: Some(137) });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_times_out() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.start("GGUF-NIM");
        let probe = FakeProbe::never();

        let outcome = wait_until_ready(
            &probe,
            &orchestrator(runtime),
            "GGUF-NIM",
            Duration::from_millis(5),
            Duration::from_millis(30),
        )
        .await
        .unwrap();

        assert_eq!(outcome, ProbeOutcome::TimedOut);
        assert!(probe.checks() >= 2);
    }

    #[tokio::test]
    async fn test_follower_keeps_recent_lines() {
        let lines: Vec<String> = (1..=10).map(|i| format!("line {}", i)).collect();
        let follower = LogFollower::spawn(futures::stream::iter(lines).boxed(), "GGUF-NIM", 3);

        while !follower.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(follower.recent(), vec!["line 8", "line 9", "line 10"]);
    }
}
