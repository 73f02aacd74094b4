//! Provenance metadata of a local artifact set
//!
//! Every set assembled by the resolver carries a `.provenance.json` file
//! recording where its files came from. It is written before the first
//! transfer and finalised once every file has been verified, so a set
//! whose provenance lacks `completed_at` is known to be partial.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::error::{Error, Result};
use common::types::{FileDescriptor, ModelIdentity, RepoKind};

/// File name of the provenance record inside a set directory
pub const PROVENANCE_FILE: &str = ".provenance.json";

/// A file as recorded in the provenance file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedFile {
    /// Base name inside the set directory
    pub name: String,
    /// Path inside the source repository
    pub source: String,
    /// Size in bytes as listed by the registry
    pub size: u64,
    pub kind: RepoKind,
}

impl RecordedFile {
    pub fn new(file: &FileDescriptor, kind: RepoKind) -> Self {
        Self {
            name: file.base_name().to_string(),
            source: file.name.clone(),
            size: file.size,
            kind,
        }
    }
}

/// Where a local artifact set came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub identity: ModelIdentity,
    /// `owner/name` of the config repository
    pub config_repo: String,
    /// `owner/name` of the weights repository
    pub weights_repo: String,
    pub files: Vec<RecordedFile>,
    pub started_at: DateTime<Utc>,
    /// Set once all files are present and verified
    pub completed_at: Option<DateTime<Utc>>,
}

impl Provenance {
    /// Starts a new, incomplete record
    pub fn begin(
        identity: ModelIdentity,
        config_repo: impl Into<String>,
        weights_repo: impl Into<String>,
        files: Vec<RecordedFile>,
    ) -> Self {
        Self {
            identity,
            config_repo: config_repo.into(),
            weights_repo: weights_repo.into(),
            files,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn mark_complete(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    /// Path of the provenance file inside `dir`
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(PROVENANCE_FILE)
    }

    /// Reads the record from `dir`. A missing file yields `Ok(None)`; an
    /// unreadable or malformed one is an error.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path_in(dir);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::filesystem(path, e)),
        };

        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Writes the record into `dir`, replacing any previous one atomically
    pub fn store(&self, dir: &Path) -> Result<()> {
        let path = Self::path_in(dir);
        let tmp = dir.join(format!("{}.tmp", PROVENANCE_FILE));

        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, contents).map_err(|e| Error::filesystem(&tmp, e))?;
        std::fs::rename(&tmp, &path).map_err(|e| Error::filesystem(&path, e))?;

        debug!(
            complete = self.is_complete(),
            "Wrote provenance for {} to {}",
            self.identity,
            path.display()
        );
        Ok(())
    }
}
