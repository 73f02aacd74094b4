//! Resolution of a (config repo, weights repo, tag) selection into a
//! complete local artifact set
//!
//! Resolution is idempotent: a set that is already complete on disk is
//! returned without touching the registry, and a partially assembled one
//! is continued rather than started over.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::types::{FileDescriptor, ModelIdentity, RemoteRepo, RepoKind};

use crate::downloader::{is_already_downloaded, PART_SUFFIX};
use crate::layout::{LayoutManager, LocalArtifactSet, LocalState, MODEL_CONFIG_FILE};
use crate::metadata::{Provenance, RecordedFile};
use crate::quantization::{available_tags, flatten_by_base_name, select_weights};
use crate::source::ArtifactSource;

/// Files fetched from the config repository, `config.json` required
pub const CONFIG_FILES: [&str; 4] = [
    MODEL_CONFIG_FILE,
    "tokenizer.json",
    "tokenizer_config.json",
    "generation_config.json",
];

/// Number of listed files quoted when a config repo lacks `config.json`
const LISTING_EXCERPT: usize = 20;

/// Files to fetch for one identity
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvePlan {
    pub identity: ModelIdentity,
    pub config_files: Vec<FileDescriptor>,
    pub weight_files: Vec<FileDescriptor>,
}

impl ResolvePlan {
    fn recorded_files(&self) -> Vec<RecordedFile> {
        self.config_files
            .iter()
            .map(|f| RecordedFile::new(f, RepoKind::Config))
            .chain(
                self.weight_files
                    .iter()
                    .map(|f| RecordedFile::new(f, RepoKind::Weights)),
            )
            .collect()
    }
}

/// Config files of a config repository listing
pub fn select_config_files(files: &[FileDescriptor]) -> Vec<FileDescriptor> {
    flatten_by_base_name(
        files
            .iter()
            .filter(|f| CONFIG_FILES.contains(&f.base_name())),
    )
}

/// Deletes staged transfers in `dir` whose target the plan does not name.
/// They cannot be resumed and would keep the set from ever validating.
fn discard_stray_parts(dir: &Path, plan: &ResolvePlan) -> Result<()> {
    let planned: HashSet<&str> = plan
        .config_files
        .iter()
        .chain(&plan.weight_files)
        .map(|f| f.base_name())
        .collect();

    let entries = std::fs::read_dir(dir).map_err(|e| Error::filesystem(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::filesystem(dir, e))?;
        let name = entry.file_name();
        let Some(target) = name.to_str().and_then(|n| n.strip_suffix(PART_SUFFIX)) else {
            continue;
        };
        if planned.contains(target) {
            continue;
        }

        let path = entry.path();
        warn!("Discarding stale transfer {}", path.display());
        std::fs::remove_file(&path).map_err(|e| Error::filesystem(&path, e))?;
    }
    Ok(())
}

/// Turns remote repositories into complete local artifact sets
pub struct ModelResolver {
    source: Arc<dyn ArtifactSource>,
    layout: Arc<LayoutManager>,
    max_concurrent: usize,
}

impl ModelResolver {
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        layout: Arc<LayoutManager>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            source,
            layout,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn layout(&self) -> &LayoutManager {
        &self.layout
    }

    /// Makes sure the set of `identity` is complete on disk, downloading
    /// whatever is missing.
    pub async fn resolve(
        &self,
        config_repo: &RemoteRepo,
        weights_repo: &RemoteRepo,
        tag: &str,
        identity: &ModelIdentity,
        cancel: &CancellationToken,
    ) -> Result<LocalArtifactSet> {
        if identity.quantization != tag {
            return Err(Error::InvalidArgument(format!(
                "Identity {} does not match quantization tag {}",
                identity, tag
            )));
        }

        match self.layout.inspect(identity)? {
            LocalState::Complete(set) => {
                info!("{} is already complete at {}", identity, set.path.display());
                return Ok(set);
            }
            LocalState::Resumable(set) => {
                info!("Resuming {} ({})", identity, set.reason);
            }
            LocalState::Absent => {
                info!(
                    "Resolving {} from {} and {}",
                    identity, config_repo, weights_repo
                );
            }
        }

        let plan = self.plan(config_repo, weights_repo, tag, identity).await?;
        self.assemble(&plan, config_repo, weights_repo, cancel).await
    }

    /// Lists both repositories and selects the files to fetch. Both
    /// listings happen before any transfer so a bad tag fails fast.
    pub async fn plan(
        &self,
        config_repo: &RemoteRepo,
        weights_repo: &RemoteRepo,
        tag: &str,
        identity: &ModelIdentity,
    ) -> Result<ResolvePlan> {
        let config_listing = self.source.list_files(config_repo).await?;
        let config_files = select_config_files(&config_listing);

        if !config_files.iter().any(|f| f.base_name() == MODEL_CONFIG_FILE) {
            let mut found: Vec<&str> = config_listing
                .iter()
                .take(LISTING_EXCERPT)
                .map(|f| f.name.as_str())
                .collect();
            if config_listing.len() > LISTING_EXCERPT {
                found.push("...");
            }
            return Err(Error::NotFound(format!(
                "{} has no {} (found: {})",
                config_repo,
                MODEL_CONFIG_FILE,
                found.join(", ")
            )));
        }

        let weights_listing = self.source.list_files(weights_repo).await?;
        let weight_files = select_weights(&weights_listing, tag);

        if weight_files.is_empty() {
            return Err(Error::NoMatchingQuantization {
                repo: weights_repo.repo_path.clone(),
                tag: tag.to_string(),
                available: available_tags(&weights_listing),
            });
        }

        debug!(
            config_files = config_files.len(),
            weight_files = weight_files.len(),
            "Planned {}",
            identity
        );

        Ok(ResolvePlan {
            identity: identity.clone(),
            config_files,
            weight_files,
        })
    }

    /// Downloads what `plan` names and is not on disk yet. All config files
    /// are fetched before the first weight file.
    pub async fn assemble(
        &self,
        plan: &ResolvePlan,
        config_repo: &RemoteRepo,
        weights_repo: &RemoteRepo,
        cancel: &CancellationToken,
    ) -> Result<LocalArtifactSet> {
        let dir = self.layout.ensure_layout(&plan.identity)?;

        let mut provenance = Provenance::begin(
            plan.identity.clone(),
            config_repo.repo_path.clone(),
            weights_repo.repo_path.clone(),
            plan.recorded_files(),
        );
        if let Ok(Some(previous)) = Provenance::load(&dir) {
            if previous.config_repo == provenance.config_repo
                && previous.weights_repo == provenance.weights_repo
            {
                provenance.started_at = previous.started_at;
            }
        }
        provenance.store(&dir)?;
        discard_stray_parts(&dir, plan)?;

        self.fetch_all(config_repo, &plan.config_files, &dir, cancel).await?;
        self.fetch_all(weights_repo, &plan.weight_files, &dir, cancel).await?;

        for file in plan.config_files.iter().chain(&plan.weight_files) {
            let dest = dir.join(file.base_name());
            if !is_already_downloaded(&dest, file.size)? {
                return Err(Error::transient(
                    format!("assembling {}", plan.identity),
                    format!("{} is incomplete after download", file.name),
                ));
            }
        }

        provenance.mark_complete();
        provenance.store(&dir)?;

        match self.layout.inspect(&plan.identity)? {
            LocalState::Complete(set) => {
                info!(
                    "{} ready at {} ({} weight files)",
                    plan.identity,
                    set.path.display(),
                    set.weight_files.len()
                );
                Ok(set)
            }
            LocalState::Resumable(set) => Err(Error::ExternalService(format!(
                "{} downloaded but failed validation: {}",
                plan.identity, set.reason
            ))),
            LocalState::Absent => Err(Error::Internal(format!(
                "{} vanished during assembly",
                dir.display()
            ))),
        }
    }

    async fn fetch_all(
        &self,
        repo: &RemoteRepo,
        files: &[FileDescriptor],
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut pending = Vec::new();
        for file in files {
            if is_already_downloaded(&dir.join(file.base_name()), file.size)? {
                debug!(file = %file.name, "Already present");
            } else {
                pending.push(file);
            }
        }

        if pending.is_empty() {
            return Ok(());
        }
        info!(
            repo = %repo,
            "Fetching {} of {} {} files",
            pending.len(),
            files.len(),
            repo.kind
        );

        stream::iter(pending)
            .map(|file| {
                let dest = dir.join(file.base_name());
                async move { self.source.download_file(repo, file, &dest, cancel).await }
            })
            .buffer_unordered(self.max_concurrent)
            .try_collect::<Vec<()>>()
            .await?;

        Ok(())
    }
}
