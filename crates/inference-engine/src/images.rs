//! Available versions of the inference server image
//!
//! Tags come from the image catalog CLI (`ngc registry image info`). The
//! floating `latest` tag is dropped and released versions are listed
//! newest first.

use std::cmp::Ordering;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use common::error::{Error, Result};

/// Floating tag that never appears in version listings
pub const LATEST_TAG: &str = "latest";

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(default)]
    tags: Vec<String>,
}

/// Lists image tags through the catalog CLI
#[derive(Debug, Clone)]
pub struct ImageCatalog {
    bin: String,
}

impl ImageCatalog {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Tags of `repo` (e.g. `nim/nvidia/llm-nim`), newest version first
    pub async fn list_tags(&self, repo: &str) -> Result<Vec<String>> {
        debug!("Fetching tags of {}", repo);

        let output = Command::new(&self.bin)
            .args(["registry", "image", "info", repo, "--format_type", "json"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::ExternalService(format!("Failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            return Err(Error::ExternalService(format!(
                "{} registry image info {} failed: {}",
                self.bin,
                repo,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_tags(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Default for ImageCatalog {
    fn default() -> Self {
        Self::new("ngc")
    }
}

/// Extracts and orders the tags of an image info document
pub fn parse_tags(json: &str) -> Result<Vec<String>> {
    let info: ImageInfo = serde_json::from_str(json)?;
    Ok(sort_versions(info.tags))
}

fn numeric_version(tag: &str) -> Option<Vec<u64>> {
    tag.split('.').map(|part| part.parse().ok()).collect()
}

/// Drops `latest`, then orders dotted numeric versions descending ahead of
/// all other tags, which follow in descending lexical order.
pub fn sort_versions(tags: Vec<String>) -> Vec<String> {
    let mut tags: Vec<(Option<Vec<u64>>, String)> = tags
        .into_iter()
        .filter(|tag| tag != LATEST_TAG)
        .map(|tag| (numeric_version(&tag), tag))
        .collect();

    tags.sort_by(|(a_version, a), (b_version, b)| match (a_version, b_version) {
        (Some(a_version), Some(b_version)) => b_version.cmp(a_version),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => b.cmp(a),
    });
    tags.dedup_by(|(_, a), (_, b)| a == b);

    tags.into_iter().map(|(_, tag)| tag).collect()
}
