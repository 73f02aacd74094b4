//! Common types for nim-deploy
//!
//! Identities of deployable models, remote repositories and the file
//! listings exchanged with the artifact registry.

use std::fmt;
use serde::{Deserialize, Serialize};

use crate::credentials::Secret;
use crate::error::{Error, Result};

/// Uniquely identifies a deployable unit: a model, the author of its
/// quantized weights and the quantization tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelIdentity {
    /// Model name, e.g. `Llama-3.2-3B-Instruct`
    pub name: String,
    /// Publisher of the quantized weights, e.g. `bartowski`
    pub author: String,
    /// Quantization tag, e.g. `Q4_K_M`
    pub quantization: String,
}

impl ModelIdentity {
    /// Creates a new identity, rejecting components that cannot be used as
    /// directory names.
    pub fn new(
        name: impl Into<String>,
        author: impl Into<String>,
        quantization: impl Into<String>,
    ) -> Result<Self> {
        let identity = Self {
            name: name.into(),
            author: author.into(),
            quantization: quantization.into(),
        };

        for (label, value) in [
            ("model name", &identity.name),
            ("author", &identity.author),
            ("quantization", &identity.quantization),
        ] {
            if value.is_empty() || value.starts_with('.') || value.contains(['/', '\\']) {
                return Err(Error::InvalidArgument(format!(
                    "Invalid {} '{}'",
                    label, value
                )));
            }
        }

        if identity.quantization.contains('-') {
            return Err(Error::InvalidArgument(format!(
                "Quantization tag '{}' must not contain '-'",
                identity.quantization
            )));
        }

        Ok(identity)
    }

    /// Derives the identity of a model assembled from a config repository
    /// and a weights repository: the model name comes from the config repo,
    /// the author from the owner of the weights repo.
    pub fn from_repos(config_repo: &RemoteRepo, weights_repo: &RemoteRepo, tag: &str) -> Result<Self> {
        Self::new(config_repo.name(), weights_repo.owner(), tag)
    }

    /// Name under which the inference server serves the model
    pub fn display_id(&self) -> String {
        format!("{}-{}", self.name, self.quantization)
    }

    /// Name of the second-level directory holding this model's artifacts
    pub fn variant_dir_name(&self) -> String {
        format!("{}-{}", self.author, self.quantization)
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.author, self.quantization)
    }
}

/// Role a remote repository plays in assembling a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    /// Holds the model configuration and tokenizer files
    Config,
    /// Holds the quantized weight files
    Weights,
}

impl fmt::Display for RepoKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoKind::Config => write!(f, "config"),
            RepoKind::Weights => write!(f, "weights"),
        }
    }
}

/// A repository on the remote artifact registry, together with the token
/// used to access it.
#[derive(Debug, Clone)]
pub struct RemoteRepo {
    pub kind: RepoKind,
    /// Registry-qualified path, `owner/name`
    pub repo_path: String,
    pub token: Secret,
}

impl RemoteRepo {
    /// Creates a repository reference, validating the `owner/name` form
    pub fn new(kind: RepoKind, repo_path: impl Into<String>, token: Secret) -> Result<Self> {
        let repo_path = repo_path.into().trim().to_string();
        let mut parts = repo_path.split('/');

        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => {}
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "Repository '{}' must have the form owner/name (e.g. meta-llama/Llama-3.2-3B-Instruct)",
                    repo_path
                )))
            }
        }

        Ok(Self {
            kind,
            repo_path,
            token,
        })
    }

    /// Owner segment of the repository path
    pub fn owner(&self) -> &str {
        self.repo_path.split('/').next().unwrap_or_default()
    }

    /// Name segment of the repository path
    pub fn name(&self) -> &str {
        self.repo_path.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for RemoteRepo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repo_path)
    }
}

/// A file listed in a remote repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Path of the file inside the repository, may contain `/`
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

impl FileDescriptor {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// File name without any repository subdirectory
    pub fn base_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Number of directory levels above the file inside the repository
    pub fn depth(&self) -> usize {
        self.name.matches('/').count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(kind: RepoKind, path: &str) -> RemoteRepo {
        RemoteRepo::new(kind, path, Secret::new("hf_test")).unwrap()
    }

    #[test]
    fn test_identity_from_repos() {
        let config = repo(RepoKind::Config, "meta-llama/Llama-3.2-3B-Instruct");
        let weights = repo(RepoKind::Weights, "bartowski/Llama-3.2-3B-Instruct-GGUF");

        let identity = ModelIdentity::from_repos(&config, &weights, "Q4_K_M").unwrap();
        assert_eq!(identity.name, "Llama-3.2-3B-Instruct");
        assert_eq!(identity.author, "bartowski");
        assert_eq!(identity.display_id(), "Llama-3.2-3B-Instruct-Q4_K_M");
        assert_eq!(identity.variant_dir_name(), "bartowski-Q4_K_M");
    }

    #[test]
    fn test_identity_rejects_path_components() {
        assert!(ModelIdentity::new("a/b", "x", "Q8_0").is_err());
        assert!(ModelIdentity::new("model", "..", "Q8_0").is_err());
        assert!(ModelIdentity::new("model", "x", "").is_err());
        assert!(ModelIdentity::new("model", "x", "Q4-K").is_err());
        assert!(ModelIdentity::new("model", "lmstudio-community", "Q8_0").is_ok());
    }

    #[test]
    fn test_repo_path_validation() {
        let token = Secret::new("hf_test");
        assert!(RemoteRepo::new(RepoKind::Config, "no-slash", token.clone()).is_err());
        assert!(RemoteRepo::new(RepoKind::Config, "a/b/c", token.clone()).is_err());
        assert!(RemoteRepo::new(RepoKind::Config, "/b", token.clone()).is_err());

        let repo = RemoteRepo::new(RepoKind::Weights, " bartowski/Model-GGUF ", token).unwrap();
        assert_eq!(repo.owner(), "bartowski");
        assert_eq!(repo.name(), "Model-GGUF");
    }

    #[test]
    fn test_file_descriptor_paths() {
        let file = FileDescriptor::new("original/params/config.json", 10);
        assert_eq!(file.base_name(), "config.json");
        assert_eq!(file.depth(), 2);
        assert_eq!(FileDescriptor::new("config.json", 1).depth(), 0);
    }
}
