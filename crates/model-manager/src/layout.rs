//! On-disk layout of local artifact sets
//!
//! ```text
//! <workdir>/<ModelName>/<Author>-<Quantization>/
//!   config.json
//!   <other config files>
//!   *.gguf
//!   .provenance.json
//! <workdir>/.cache/nim/
//! ```
//!
//! The layout manager is the only component that decides whether a set on
//! disk is complete. Everything it reports as [`LocalState::Complete`] can be
//! served; partial sets are reported as [`LocalState::Resumable`] and never
//! mixed into the ready set.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use common::error::{Error, Result};
use common::types::ModelIdentity;
use deploy_config::CACHE_SUBDIR;

use crate::downloader::{is_already_downloaded, is_part_file};
use crate::metadata::{Provenance, PROVENANCE_FILE};
use crate::quantization::{is_weight_file, matches_tag, shards_complete};

/// Model configuration document required in every complete set
pub const MODEL_CONFIG_FILE: &str = "config.json";

/// A complete set of artifacts ready to be served
#[derive(Debug, Clone, PartialEq)]
pub struct LocalArtifactSet {
    pub identity: ModelIdentity,
    /// Absolute path of the set directory
    pub path: PathBuf,
    pub config_files: Vec<PathBuf>,
    pub weight_files: Vec<PathBuf>,
    pub provenance: Option<Provenance>,
}

/// A set that exists on disk but cannot be served yet
#[derive(Debug, Clone, PartialEq)]
pub struct ResumableSet {
    pub identity: ModelIdentity,
    pub path: PathBuf,
    /// Present when the set was started by the resolver; names the repos to
    /// resume from
    pub provenance: Option<Provenance>,
    /// Why the set is not complete
    pub reason: String,
}

/// State of one identity's directory
#[derive(Debug, Clone, PartialEq)]
pub enum LocalState {
    Absent,
    Resumable(ResumableSet),
    Complete(LocalArtifactSet),
}

impl LocalState {
    pub fn is_complete(&self) -> bool {
        matches!(self, LocalState::Complete(_))
    }
}

/// Result of scanning the workdir
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub ready: Vec<LocalArtifactSet>,
    pub resumable: Vec<ResumableSet>,
}

/// Owns every path under the workdir
#[derive(Debug, Clone)]
pub struct LayoutManager {
    workdir: PathBuf,
}

impl LayoutManager {
    /// Creates a manager rooted at `workdir`, made absolute against the
    /// current directory
    pub fn new(workdir: impl Into<PathBuf>) -> Result<Self> {
        let workdir = workdir.into();
        let workdir = if workdir.is_absolute() {
            workdir
        } else {
            let cwd = std::env::current_dir().map_err(|e| Error::filesystem(&workdir, e))?;
            cwd.join(workdir)
        };

        Ok(Self { workdir })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Directory of `identity`'s set; no I/O
    pub fn path_for(&self, identity: &ModelIdentity) -> PathBuf {
        self.workdir
            .join(&identity.name)
            .join(identity.variant_dir_name())
    }

    /// Cache directory shared by all deployments
    pub fn cache_dir(&self) -> PathBuf {
        self.workdir.join(CACHE_SUBDIR)
    }

    /// Creates the set directory of `identity` if needed
    pub fn ensure_layout(&self, identity: &ModelIdentity) -> Result<PathBuf> {
        let path = self.path_for(identity);
        fs::create_dir_all(&path).map_err(|e| Error::filesystem(&path, e))?;
        Ok(path)
    }

    /// Creates the shared cache directory if needed
    pub fn ensure_cache(&self) -> Result<PathBuf> {
        let path = self.cache_dir();
        fs::create_dir_all(&path).map_err(|e| Error::filesystem(&path, e))?;
        Ok(path)
    }

    /// Whether `identity`'s set is complete
    pub fn validate_complete(&self, identity: &ModelIdentity) -> Result<bool> {
        Ok(self.inspect(identity)?.is_complete())
    }

    /// Classifies the directory of `identity`
    pub fn inspect(&self, identity: &ModelIdentity) -> Result<LocalState> {
        let path = self.path_for(identity);
        if !path.is_dir() {
            return Ok(LocalState::Absent);
        }

        let files = list_files(&path)?;

        let provenance = match Provenance::load(&path) {
            Ok(provenance) => provenance,
            Err(Error::Serialization(e)) => {
                warn!("Ignoring unreadable provenance in {}: {}", path.display(), e);
                return Ok(self.resumable(identity, path, None, "provenance file is unreadable"));
            }
            Err(e) => return Err(e),
        };

        let content: Vec<&String> = files
            .iter()
            .filter(|name| !name.starts_with(PROVENANCE_FILE))
            .collect();

        if content.is_empty() && provenance.is_none() {
            return Ok(LocalState::Absent);
        }

        if let Some(staged) = content.iter().find(|name| is_part_file(name)) {
            let reason = format!("interrupted transfer ({})", staged);
            return Ok(self.resumable(identity, path, provenance, reason));
        }

        if !has_valid_model_config(&path)? {
            let reason = format!("{} missing or not a JSON object", MODEL_CONFIG_FILE);
            return Ok(self.resumable(identity, path, provenance, reason));
        }

        let weights: Vec<&String> = content
            .iter()
            .copied()
            .filter(|name| is_weight_file(name) && matches_tag(name, &identity.quantization))
            .collect();

        let gap = match &provenance {
            Some(record) if !record.is_complete() => Some("download incomplete".to_string()),
            Some(record) => missing_recorded_file(&path, record)?,
            None => None,
        };
        if let Some(reason) = gap {
            return Ok(self.resumable(identity, path, provenance, reason));
        }

        if weights.is_empty() {
            let reason = format!("no weight files for {}", identity.quantization);
            return Ok(self.resumable(identity, path, provenance, reason));
        }
        if !shards_complete(weights.iter().map(|s| s.as_str())) {
            return Ok(self.resumable(identity, path, provenance, "multi-part weights incomplete"));
        }

        let config_files = content
            .iter()
            .filter(|name| !is_weight_file(name) && !name.starts_with('.'))
            .map(|name| path.join(name))
            .collect();
        let weight_files = weights.iter().map(|name| path.join(name)).collect();

        Ok(LocalState::Complete(LocalArtifactSet {
            identity: identity.clone(),
            path,
            config_files,
            weight_files,
            provenance,
        }))
    }

    /// Scans the two-level directory structure under the workdir
    pub fn discover_local_models(&self) -> Result<Discovery> {
        let mut discovery = Discovery::default();

        for model_dir in list_visible_dirs(&self.workdir)? {
            let Some(model_name) = dir_name(&model_dir) else { continue };

            for variant_dir in list_visible_dirs(&model_dir)? {
                let Some(variant) = dir_name(&variant_dir) else { continue };
                let Some((author, quantization)) = variant.rsplit_once('-') else {
                    debug!("Skipping {}: not <author>-<quantization>", variant_dir.display());
                    continue;
                };

                let identity = match ModelIdentity::new(model_name, author, quantization) {
                    Ok(identity) => identity,
                    Err(e) => {
                        debug!("Skipping {}: {}", variant_dir.display(), e);
                        continue;
                    }
                };

                match self.inspect(&identity)? {
                    LocalState::Complete(set) => discovery.ready.push(set),
                    LocalState::Resumable(set) => discovery.resumable.push(set),
                    LocalState::Absent => {}
                }
            }
        }

        discovery.ready.sort_by(|a, b| a.identity.cmp(&b.identity));
        discovery.resumable.sort_by(|a, b| a.identity.cmp(&b.identity));

        debug!(
            ready = discovery.ready.len(),
            resumable = discovery.resumable.len(),
            "Scanned {}",
            self.workdir.display()
        );
        Ok(discovery)
    }

    fn resumable(
        &self,
        identity: &ModelIdentity,
        path: PathBuf,
        provenance: Option<Provenance>,
        reason: impl Into<String>,
    ) -> LocalState {
        LocalState::Resumable(ResumableSet {
            identity: identity.clone(),
            path,
            provenance,
            reason: reason.into(),
        })
    }
}

fn missing_recorded_file(dir: &Path, record: &Provenance) -> Result<Option<String>> {
    for file in &record.files {
        if !is_already_downloaded(&dir.join(&file.name), file.size)? {
            return Ok(Some(format!("{} is missing or has the wrong size", file.name)));
        }
    }
    Ok(None)
}

fn has_valid_model_config(dir: &Path) -> Result<bool> {
    let path = dir.join(MODEL_CONFIG_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::filesystem(path, e)),
    };

    Ok(serde_json::from_str::<serde_json::Value>(&contents)
        .map(|value| value.is_object())
        .unwrap_or(false))
}

/// Names of the regular files in `dir`, sorted
fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::filesystem(dir, e))? {
        let entry = entry.map_err(|e| Error::filesystem(dir, e))?;
        let is_file = entry
            .file_type()
            .map_err(|e| Error::filesystem(entry.path(), e))?
            .is_file();
        if is_file {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Subdirectories of `dir` whose names do not start with `.`; a missing
/// `dir` has none
fn list_visible_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::filesystem(dir, e)),
    };

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::filesystem(dir, e))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if !hidden && path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn dir_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}
