//! Deployment coordinator
//!
//! Drives one deployment through `Init -> Resolving -> [Assembling] ->
//! Starting -> Probing -> Ready`, ending in `Failed` or `Stopped` when
//! something goes wrong or the user cancels. Nothing is carried over
//! between runs: every run re-derives where it stands from the model layout
//! on disk and from the container runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use common::credentials::Secret;
use common::deployment::{DeploymentRecord, DeploymentState, FailureReason};
use common::error::{Error, Result};
use common::types::{ModelIdentity, RemoteRepo, RepoKind};
use deploy_config::DeployConfig;
use inference_engine::{ContainerOrchestrator, ReadinessProbe};
use model_manager::{LocalArtifactSet, LocalState, ModelResolver};

use crate::lifecycle::{wait_until_ready, LogFollower, ProbeOutcome};
use crate::state::StateTracker;

/// What to deploy
#[derive(Debug, Clone)]
pub enum DeploymentRequest {
    /// Assemble the model from two registry repositories, then deploy it
    Download {
        config_repo: RemoteRepo,
        weights_repo: RemoteRepo,
        tag: String,
        identity: ModelIdentity,
    },
    /// Deploy a model already in the layout. With a registry token an
    /// interrupted download recorded in the set's provenance is finished
    /// first.
    Existing {
        identity: ModelIdentity,
        registry_token: Option<Secret>,
    },
}

impl DeploymentRequest {
    /// Download request whose identity is derived from the repositories
    pub fn download(config_repo: RemoteRepo, weights_repo: RemoteRepo, tag: impl Into<String>) -> Result<Self> {
        let tag = tag.into();
        let identity = ModelIdentity::from_repos(&config_repo, &weights_repo, &tag)?;
        Ok(DeploymentRequest::Download {
            config_repo,
            weights_repo,
            tag,
            identity,
        })
    }

    pub fn existing(identity: ModelIdentity, registry_token: Option<Secret>) -> Self {
        DeploymentRequest::Existing {
            identity,
            registry_token,
        }
    }

    pub fn identity(&self) -> &ModelIdentity {
        match self {
            DeploymentRequest::Download { identity, .. } => identity,
            DeploymentRequest::Existing { identity, .. } => identity,
        }
    }
}

/// Run-scoped knobs of the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Host port the inference server is published on
    pub port: u16,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// Container log lines kept for failure reports
    pub log_buffer_lines: usize,
}

impl CoordinatorSettings {
    pub fn from_config(config: &DeployConfig) -> Self {
        Self {
            port: config.container.port,
            probe_interval: config.probe.interval(),
            probe_timeout: config.probe.timeout(),
            log_buffer_lines: config.container.crash_log_lines,
        }
    }
}

/// Outcome of one coordinator run
#[derive(Debug)]
pub struct DeploymentReport {
    /// The deployment, `state` holding the terminal state
    pub record: DeploymentRecord,
    /// Every state the run passed through, starting with `Init`
    pub transitions: Vec<DeploymentState>,
    /// Cause of a `Failed` or `Stopped` outcome
    pub error: Option<Error>,
}

impl DeploymentReport {
    pub fn state(&self) -> &DeploymentState {
        &self.record.state
    }

    pub fn is_ready(&self) -> bool {
        self.record.state == DeploymentState::Ready
    }

    /// Whether the run ever was in `state`
    pub fn visited(&self, state: &DeploymentState) -> bool {
        self.transitions.contains(state)
    }
}

/// Runs the deployment state machine against the model layout, the
/// container runtime and the inference server
pub struct DeploymentCoordinator {
    resolver: Arc<ModelResolver>,
    orchestrator: Arc<ContainerOrchestrator>,
    probe: Arc<dyn ReadinessProbe>,
    settings: CoordinatorSettings,
}

impl DeploymentCoordinator {
    pub fn new(
        resolver: Arc<ModelResolver>,
        orchestrator: Arc<ContainerOrchestrator>,
        probe: Arc<dyn ReadinessProbe>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            resolver,
            orchestrator,
            probe,
            settings,
        }
    }

    /// Runs `request` to a terminal state. Cancelling `cancel` moves the
    /// run to `Stopped` and stops any container it started.
    pub async fn run(
        &self,
        request: DeploymentRequest,
        api_key: &Secret,
        cancel: &CancellationToken,
    ) -> DeploymentReport {
        let identity = request.identity().clone();
        let layout = self.resolver.layout();
        let mut record = DeploymentRecord::new(
            identity.clone(),
            layout.path_for(&identity),
            self.orchestrator.container_name(),
            layout.cache_dir(),
            self.settings.port,
        );
        let tracker = StateTracker::new(identity.display_id());

        let result = self.drive(&request, &mut record, api_key, &tracker, cancel).await;

        let error = match result {
            Ok(()) => None,
            Err(err) if err.is_cancelled() => {
                warn!("Deployment of {} cancelled", identity);
                let had_container = tracker.current().has_container();
                record_transition(&tracker, DeploymentState::Stopped);
                if had_container {
                    if let Err(e) = self.orchestrator.stop(&record.container_name).await {
                        error!("Failed to stop {}: {}", record.container_name, e);
                    }
                }
                Some(err)
            }
            Err(err) => {
                let reason = failure_reason(&tracker.current(), &err);
                error!("Deployment of {} failed: {}", identity, err);
                record_transition(&tracker, DeploymentState::Failed(reason));
                Some(err)
            }
        };

        record.state = tracker.current();
        DeploymentReport {
            record,
            transitions: tracker.history(),
            error,
        }
    }

    async fn drive(
        &self,
        request: &DeploymentRequest,
        record: &mut DeploymentRecord,
        api_key: &Secret,
        tracker: &StateTracker,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tracker.transition(DeploymentState::Resolving)?;
        let set = self.resolve_local_set(request, tracker, cancel).await?;
        record.host_directory = set.path;
        record.cache_directory = self.resolver.layout().ensure_cache()?;

        tracker.transition(DeploymentState::Starting)?;
        cancellable(cancel, self.orchestrator.deploy(record, api_key)).await?;

        tracker.transition(DeploymentState::Probing)?;
        let container = record.container_name.clone();
        let follower = match cancellable(cancel, self.orchestrator.stream_logs(&container)).await {
            Ok(stream) => Some(LogFollower::spawn(
                stream,
                container.clone(),
                self.settings.log_buffer_lines,
            )),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!("Could not follow logs of {}: {}", container, e);
                None
            }
        };

        let outcome = cancellable(
            cancel,
            wait_until_ready(
                self.probe.as_ref(),
                &self.orchestrator,
                &container,
                self.settings.probe_interval,
                self.settings.probe_timeout,
            ),
        )
        .await?;

        match outcome {
            ProbeOutcome::Ready => {
                tracker.transition(DeploymentState::Ready)?;
                info!(
                    "{} is serving {} on port {}",
                    container,
                    record.served_model_name(),
                    record.port
                );
                Ok(())
            }
            ProbeOutcome::ContainerDied { exit_code } => {
                let mut logs = follower.map(|f| f.recent()).unwrap_or_default();
                if logs.is_empty() {
                    logs = self
                        .orchestrator
                        .tail_logs(&container, self.settings.log_buffer_lines)
                        .await
                        .unwrap_or_default();
                }
                Err(Error::ContainerDied {
                    container,
                    exit_code,
                    logs,
                })
            }
            ProbeOutcome::TimedOut => Err(Error::ProbeTimeout {
                url: self.probe.target(),
                container,
                timeout: self.settings.probe_timeout,
            }),
        }
    }

    /// Finds or assembles the complete local set for `request`
    async fn resolve_local_set(
        &self,
        request: &DeploymentRequest,
        tracker: &StateTracker,
        cancel: &CancellationToken,
    ) -> Result<LocalArtifactSet> {
        let identity = request.identity();
        let layout = self.resolver.layout();

        match (layout.inspect(identity)?, request) {
            (LocalState::Complete(set), _) => {
                info!("Using local model {} at {}", identity, set.path.display());
                Ok(set)
            }
            (
                _,
                DeploymentRequest::Download {
                    config_repo,
                    weights_repo,
                    tag,
                    identity,
                },
            ) => {
                tracker.transition(DeploymentState::Assembling)?;
                cancellable(
                    cancel,
                    self.resolver
                        .resolve(config_repo, weights_repo, tag, identity, cancel),
                )
                .await
            }
            (
                LocalState::Resumable(set),
                DeploymentRequest::Existing {
                    registry_token: Some(token),
                    ..
                },
            ) => {
                let provenance = set.provenance.ok_or_else(|| {
                    Error::NotFound(format!(
                        "{} is incomplete ({}) and records no source repositories",
                        set.path.display(),
                        set.reason
                    ))
                })?;
                info!(
                    "Finishing {} from {} and {} ({})",
                    identity, provenance.config_repo, provenance.weights_repo, set.reason
                );

                let config_repo = RemoteRepo::new(RepoKind::Config, provenance.config_repo, token.clone())?;
                let weights_repo = RemoteRepo::new(RepoKind::Weights, provenance.weights_repo, token.clone())?;

                tracker.transition(DeploymentState::Assembling)?;
                cancellable(
                    cancel,
                    self.resolver.resolve(
                        &config_repo,
                        &weights_repo,
                        &identity.quantization,
                        identity,
                        cancel,
                    ),
                )
                .await
            }
            (LocalState::Resumable(set), DeploymentRequest::Existing { .. }) => {
                Err(Error::NotFound(format!(
                    "{} is incomplete ({}); a registry token is needed to finish it",
                    set.path.display(),
                    set.reason
                )))
            }
            (LocalState::Absent, DeploymentRequest::Existing { .. }) => Err(Error::NotFound(format!(
                "No local model {} at {}",
                identity,
                layout.path_for(identity).display()
            ))),
        }
    }
}

/// Awaits `fut` unless `cancel` fires first
async fn cancellable<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled("deployment cancelled by user".to_string())),
        result = fut => result,
    }
}

/// Failures before a container was started are resolution failures
fn failure_reason(stage: &DeploymentState, err: &Error) -> FailureReason {
    match (stage, err) {
        (_, Error::ContainerCrash { .. }) => FailureReason::ContainerCrash,
        (_, Error::ContainerDied { .. }) => FailureReason::ContainerDied,
        (_, Error::ProbeTimeout { .. }) => FailureReason::ProbeTimeout,
        (DeploymentState::Resolving | DeploymentState::Assembling, err) => {
            FailureReason::Resolution(err.to_string())
        }
        (_, err) => FailureReason::Other(err.to_string()),
    }
}

fn record_transition(tracker: &StateTracker, next: DeploymentState) {
    if let Err(e) = tracker.transition(next) {
        error!("{}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use deploy_config::ContainerSettings;
    use model_manager::LayoutManager;

    use inference_engine::testing::{FakeProbe, FakeRuntime};
    use model_manager::testing::{FakeSource, CONFIG_REPO, WEIGHTS_REPO};

    const WEIGHT_FILE: &str = "Llama-3.2-3B-Instruct-Q4_K_M.gguf";

    fn settings(probe_timeout: Duration) -> CoordinatorSettings {
        CoordinatorSettings {
            port: 8000,
            probe_interval: Duration::from_millis(2),
            probe_timeout,
            log_buffer_lines: 50,
        }
    }

    fn coordinator(
        workdir: &Path,
        source: Arc<FakeSource>,
        runtime: Arc<FakeRuntime>,
        probe: FakeProbe,
        probe_timeout: Duration,
    ) -> DeploymentCoordinator {
        let layout = Arc::new(LayoutManager::new(workdir).unwrap());
        let resolver = Arc::new(ModelResolver::new(source, layout, 4));
        let orchestrator = Arc::new(
            ContainerOrchestrator::new(runtime, ContainerSettings::default())
                .with_grace_period(Duration::from_millis(20), Duration::from_millis(5)),
        );
        DeploymentCoordinator::new(resolver, orchestrator, Arc::new(probe), settings(probe_timeout))
    }

    fn download_request() -> DeploymentRequest {
        let token = Secret::new("hf_test");
        DeploymentRequest::download(
            RemoteRepo::new(RepoKind::Config, CONFIG_REPO, token.clone()).unwrap(),
            RemoteRepo::new(RepoKind::Weights, WEIGHTS_REPO, token).unwrap(),
            "Q4_K_M",
        )
        .unwrap()
    }

    fn identity() -> ModelIdentity {
        ModelIdentity::new("Llama-3.2-3B-Instruct", "bartowski", "Q4_K_M").unwrap()
    }

    fn api_key() -> Secret {
        Secret::new("nvapi-test")
    }

    fn write_complete_set(workdir: &Path) {
        let dir = workdir.join("Llama-3.2-3B-Instruct").join("bartowski-Q4_K_M");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), "{\"model_type\":\"llama\"}").unwrap();
        std::fs::write(dir.join(WEIGHT_FILE), "GGUF").unwrap();
    }

    #[tokio::test]
    async fn test_download_and_deploy_reaches_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::llama());
        let runtime = Arc::new(FakeRuntime::default());
        let coordinator = coordinator(
            tmp.path(),
            source,
            runtime.clone(),
            FakeProbe::ready_after(3),
            Duration::from_secs(5),
        );

        let report = coordinator
            .run(download_request(), &api_key(), &CancellationToken::new())
            .await;

        assert!(report.is_ready(), "{:?}", report.error);
        assert_eq!(
            report.transitions,
            vec![
                DeploymentState::Init,
                DeploymentState::Resolving,
                DeploymentState::Assembling,
                DeploymentState::Starting,
                DeploymentState::Probing,
                DeploymentState::Ready,
            ]
        );

        let expected_dir = tmp.path().join("Llama-3.2-3B-Instruct").join("bartowski-Q4_K_M");
        assert_eq!(report.record.host_directory, expected_dir);
        assert!(expected_dir.join("config.json").is_file());
        assert!(expected_dir.join(WEIGHT_FILE).is_file());
        assert!(tmp.path().join(".cache/nim").is_dir());
        assert_eq!(report.record.container_name, "GGUF-NIM");
        assert_eq!(runtime.running(), vec!["GGUF-NIM".to_string()]);
    }

    #[tokio::test]
    async fn test_existing_complete_set_skips_assembling() {
        let tmp = tempfile::tempdir().unwrap();
        write_complete_set(tmp.path());
        let source = Arc::new(FakeSource::llama());
        let coordinator = coordinator(
            tmp.path(),
            source.clone(),
            Arc::new(FakeRuntime::default()),
            FakeProbe::ready_after(1),
            Duration::from_secs(5),
        );

        let report = coordinator
            .run(
                DeploymentRequest::existing(identity(), None),
                &api_key(),
                &CancellationToken::new(),
            )
            .await;

        assert!(report.is_ready(), "{:?}", report.error);
        assert!(!report.visited(&DeploymentState::Assembling));
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_existing_model_is_a_resolution_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let coordinator = coordinator(
            tmp.path(),
            Arc::new(FakeSource::llama()),
            runtime.clone(),
            FakeProbe::ready_after(1),
            Duration::from_secs(5),
        );

        let report = coordinator
            .run(
                DeploymentRequest::existing(identity(), None),
                &api_key(),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(
            report.state(),
            DeploymentState::Failed(FailureReason::Resolution(_))
        ));
        assert!(report.error.as_ref().unwrap().is_not_found());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_crash_never_reaches_probing() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::with_logs(["loading model", "invalid model dir"]));
        runtime.crash_on_start(1);
        let probe = FakeProbe::ready_after(1);
        let coordinator = coordinator(
            tmp.path(),
            Arc::new(FakeSource::llama()),
            runtime,
            probe,
            Duration::from_secs(5),
        );

        let report = coordinator
            .run(download_request(), &api_key(), &CancellationToken::new())
            .await;

        assert_eq!(
            report.state(),
            &DeploymentState::Failed(FailureReason::ContainerCrash)
        );
        assert!(!report.visited(&DeploymentState::Probing));
        match report.error {
            Some(Error::ContainerCrash { exit_code, logs, .. }) => {
                assert_eq!(exit_code, Some(1));
                assert_eq!(logs.last().map(String::as_str), Some("invalid model dir"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_container_death_during_probing_fails_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::with_logs(["loading model", "CUDA out of memory"]));
        let probe = FakeProbe::never().killing(runtime.clone(), "GGUF-NIM", 2, 137);
        let coordinator = coordinator(
            tmp.path(),
            Arc::new(FakeSource::llama()),
            runtime,
            probe,
            Duration::from_secs(60),
        );

        let started = std::time::Instant::now();
        let report = coordinator
            .run(download_request(), &api_key(), &CancellationToken::new())
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            report.state(),
            &DeploymentState::Failed(FailureReason::ContainerDied)
        );
        match report.error {
            Some(Error::ContainerDied { exit_code, logs, .. }) => {
                assert_eq!(exit_code, Some(137));
                assert!(logs.iter().any(|l| l == "CUDA out of memory"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_timeout_leaves_container_running() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let coordinator = coordinator(
            tmp.path(),
            Arc::new(FakeSource::llama()),
            runtime.clone(),
            FakeProbe::never(),
            Duration::from_millis(30),
        );

        let report = coordinator
            .run(download_request(), &api_key(), &CancellationToken::new())
            .await;

        assert_eq!(
            report.state(),
            &DeploymentState::Failed(FailureReason::ProbeTimeout)
        );
        assert!(matches!(report.error, Some(Error::ProbeTimeout { .. })));
        assert_eq!(runtime.running(), vec!["GGUF-NIM".to_string()]);
        assert!(!runtime.calls().iter().any(|c| c.starts_with("stop")));
    }

    #[tokio::test]
    async fn test_cancel_while_probing_stops_container() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        let coordinator = coordinator(
            tmp.path(),
            Arc::new(FakeSource::llama()),
            runtime.clone(),
            FakeProbe::never(),
            Duration::from_secs(600),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let report = coordinator.run(download_request(), &api_key(), &cancel).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.state(), &DeploymentState::Stopped);
        assert!(report.visited(&DeploymentState::Probing));
        assert!(report.error.as_ref().unwrap().is_cancelled());
        assert!(runtime.running().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_start_leaves_existing_container_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        runtime.start("GGUF-NIM");
        let coordinator = coordinator(
            tmp.path(),
            Arc::new(FakeSource::llama()),
            runtime.clone(),
            FakeProbe::ready_after(1),
            Duration::from_secs(5),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = coordinator.run(download_request(), &api_key(), &cancel).await;

        assert_eq!(report.state(), &DeploymentState::Stopped);
        assert_eq!(runtime.running(), vec!["GGUF-NIM".to_string()]);
    }

    #[tokio::test]
    async fn test_rerun_after_failure_replaces_container() {
        let tmp = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::llama());
        let runtime = Arc::new(FakeRuntime::default());

        let first = coordinator(
            tmp.path(),
            source.clone(),
            runtime.clone(),
            FakeProbe::never(),
            Duration::from_millis(20),
        )
        .run(download_request(), &api_key(), &CancellationToken::new())
        .await;
        assert_eq!(
            first.state(),
            &DeploymentState::Failed(FailureReason::ProbeTimeout)
        );
        let source_calls = source.calls().len();

        let second = coordinator(
            tmp.path(),
            source.clone(),
            runtime.clone(),
            FakeProbe::ready_after(1),
            Duration::from_secs(5),
        )
        .run(download_request(), &api_key(), &CancellationToken::new())
        .await;

        assert!(second.is_ready(), "{:?}", second.error);
        assert!(!second.visited(&DeploymentState::Assembling));
        assert_eq!(source.calls().len(), source_calls);
        assert_eq!(runtime.running(), vec!["GGUF-NIM".to_string()]);
        assert!(runtime.calls().contains(&"stop GGUF-NIM".to_string()));
    }

    #[tokio::test]
    async fn test_interrupted_download_is_finished_by_deploy_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let source = Arc::new(FakeSource::llama());
        source.break_file(WEIGHT_FILE);
        let runtime = Arc::new(FakeRuntime::default());

        let first = coordinator(
            tmp.path(),
            source.clone(),
            runtime.clone(),
            FakeProbe::ready_after(1),
            Duration::from_secs(5),
        )
        .run(download_request(), &api_key(), &CancellationToken::new())
        .await;
        assert!(matches!(
            first.state(),
            DeploymentState::Failed(FailureReason::Resolution(_))
        ));

        let without_token = coordinator(
            tmp.path(),
            source.clone(),
            runtime.clone(),
            FakeProbe::ready_after(1),
            Duration::from_secs(5),
        )
        .run(
            DeploymentRequest::existing(identity(), None),
            &api_key(),
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(
            without_token.state(),
            DeploymentState::Failed(FailureReason::Resolution(_))
        ));

        source.repair_file(WEIGHT_FILE);
        let before = source.calls().len();
        let resumed = coordinator(
            tmp.path(),
            source.clone(),
            runtime,
            FakeProbe::ready_after(1),
            Duration::from_secs(5),
        )
        .run(
            DeploymentRequest::existing(identity(), Some(Secret::new("hf_test"))),
            &api_key(),
            &CancellationToken::new(),
        )
        .await;

        assert!(resumed.is_ready(), "{:?}", resumed.error);
        assert!(resumed.visited(&DeploymentState::Assembling));
        let downloads: Vec<String> = source.calls()[before..]
            .iter()
            .filter(|c| c.starts_with("get "))
            .cloned()
            .collect();
        assert_eq!(downloads, vec![format!("get {}", WEIGHT_FILE)]);
    }

    #[test]
    fn test_failure_reason_follows_stage() {
        let not_found = Error::NotFound("a/b".into());
        assert!(matches!(
            failure_reason(&DeploymentState::Assembling, &not_found),
            FailureReason::Resolution(_)
        ));
        assert!(matches!(
            failure_reason(&DeploymentState::Starting, &Error::ExternalService("docker".into())),
            FailureReason::Other(_)
        ));
    }
}
