//! Main integration module for nim-deploy
//!
//! Wires the registry adapter, the model layout, the container runtime and
//! the readiness probe into a [`DeploymentCoordinator`] and exposes the
//! entry operations the command line uses.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use common::credentials::{Credentials, Secret};
use common::error::Result;
use common::types::{ModelIdentity, RemoteRepo, RepoKind};
use deploy_config::DeployConfig;
use inference_engine::{
    ContainerOrchestrator, ContainerRuntime, DockerRuntime, HttpReadinessProbe, ImageCatalog,
    ReadinessProbe,
};
use model_manager::{ArtifactSource, Discovery, HfArtifactSource, LayoutManager, ModelResolver};
use orchestrator_core::{CoordinatorSettings, DeploymentCoordinator, DeploymentReport, DeploymentRequest};

/// Entry point to every deployment operation
pub struct DeploymentService {
    config: DeployConfig,
    layout: Arc<LayoutManager>,
    orchestrator: Arc<ContainerOrchestrator>,
    coordinator: DeploymentCoordinator,
    catalog: ImageCatalog,
}

impl DeploymentService {
    /// Service talking to the configured registry, container runtime and
    /// inference server
    pub fn new(config: DeployConfig) -> Result<Self> {
        let source = Arc::new(HfArtifactSource::new(&config.registry)?);
        let runtime = Arc::new(DockerRuntime::new(config.container.runtime_bin.clone()));
        let probe = Arc::new(HttpReadinessProbe::from_settings(&config.probe, config.container.port)?);
        Self::with_components(config, source, runtime, probe)
    }

    pub fn with_components(
        config: DeployConfig,
        source: Arc<dyn ArtifactSource>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let layout = Arc::new(LayoutManager::new(&config.workdir)?);
        let resolver = Arc::new(ModelResolver::new(
            source,
            layout.clone(),
            config.registry.max_concurrent_downloads,
        ));
        let orchestrator = Arc::new(ContainerOrchestrator::new(runtime, config.container.clone()));
        let coordinator = DeploymentCoordinator::new(
            resolver,
            orchestrator.clone(),
            probe,
            CoordinatorSettings::from_config(&config),
        );

        Ok(Self {
            config,
            layout,
            orchestrator,
            coordinator,
            catalog: ImageCatalog::default(),
        })
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    /// Complete and resumable models under the workdir
    pub fn list_local_models(&self) -> Result<Discovery> {
        self.layout.discover_local_models()
    }

    /// Assembles the model from `model_repo` (config and tokenizer) and
    /// `quant_repo` (weights for `tag`), then deploys it
    pub async fn download_and_deploy(
        &self,
        model_repo: &str,
        quant_repo: &str,
        tag: &str,
        credentials: &Credentials,
        cancel: &CancellationToken,
    ) -> Result<DeploymentReport> {
        credentials.validate()?;
        let config_repo = RemoteRepo::new(RepoKind::Config, model_repo, credentials.registry_token.clone())?;
        let weights_repo = RemoteRepo::new(RepoKind::Weights, quant_repo, credentials.registry_token.clone())?;
        let request = DeploymentRequest::download(config_repo, weights_repo, tag)?;

        info!("Deploying {}", request.identity());
        Ok(self
            .coordinator
            .run(request, &credentials.api_key, cancel)
            .await)
    }

    /// Deploys a model already in the layout. `registry_token` allows an
    /// interrupted download of it to be finished first.
    pub async fn deploy_existing(
        &self,
        identity: ModelIdentity,
        registry_token: Option<Secret>,
        api_key: &Secret,
        cancel: &CancellationToken,
    ) -> DeploymentReport {
        info!("Deploying local model {}", identity);
        self.coordinator
            .run(DeploymentRequest::existing(identity, registry_token), api_key, cancel)
            .await
    }

    /// Stops the container of the active deployment, if any
    pub async fn stop_active(&self) -> Result<bool> {
        let name = self.orchestrator.container_name();
        let present = self.orchestrator.status(name).await?.is_some();
        self.orchestrator.stop(name).await?;
        Ok(present)
    }

    /// Released tags of the inference server image, newest first
    pub async fn image_tags(&self) -> Result<Vec<String>> {
        self.catalog.list_tags(self.config.container.catalog_repo()).await
    }
}
