//! HTTP artifact source for a Hugging Face compatible registry
//!
//! Listings come from `GET {endpoint}/api/models/{repo}/revision/{rev}?blobs=true`,
//! files from `GET {endpoint}/{repo}/resolve/{rev}/{file}`. Interrupted
//! transfers are resumed with a `Range` request against the staged `.part`
//! file.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::types::{FileDescriptor, RemoteRepo};
use common::utils::format_bytes;
use deploy_config::RegistrySettings;

use crate::downloader::{commit, is_already_downloaded, part_path, resume_offset, write_part};
use crate::retry::{with_backoff, RetryPolicy};
use crate::source::ArtifactSource;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Registry client speaking the Hugging Face Hub HTTP API
#[derive(Debug, Clone)]
pub struct HfArtifactSource {
    client: Client,
    endpoint: String,
    revision: String,
    retry: RetryPolicy,
}

impl HfArtifactSource {
    pub fn new(settings: &RegistrySettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("nim-deploy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            revision: settings.revision.clone(),
            retry: RetryPolicy::from(&settings.retry),
        })
    }

    fn list_url(&self, repo: &RemoteRepo) -> String {
        format!(
            "{}/api/models/{}/revision/{}?blobs=true",
            self.endpoint, repo.repo_path, self.revision
        )
    }

    fn file_url(&self, repo: &RemoteRepo, file: &FileDescriptor) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, repo.repo_path, self.revision, file.name
        )
    }

    fn authorized(&self, request: RequestBuilder, repo: &RemoteRepo) -> RequestBuilder {
        if repo.token.is_empty() {
            request
        } else {
            request.bearer_auth(repo.token.expose())
        }
    }

    async fn list_once(&self, repo: &RemoteRepo) -> Result<Vec<FileDescriptor>> {
        let context = format!("listing {}", repo);
        let request = self.authorized(self.client.get(self.list_url(repo)), repo);

        let response = request.send().await.map_err(|e| request_error(&context, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, repo, &format!("repository {}", repo)));
        }

        let info: RepoInfo = response.json().await.map_err(|e| request_error(&context, e))?;
        let mut files: Vec<FileDescriptor> = info
            .siblings
            .into_iter()
            .map(|s| FileDescriptor::new(s.rfilename, s.size.unwrap_or(0)))
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(repo = %repo, files = files.len(), "Listed repository");
        Ok(files)
    }

    async fn download_once(
        &self,
        repo: &RemoteRepo,
        file: &FileDescriptor,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if is_already_downloaded(dest, file.size)? {
            debug!(file = %file.name, "Already present, skipping");
            return Ok(());
        }

        let context = format!("downloading {} from {}", file.name, repo);
        let offset = resume_offset(dest, file.size);

        let mut request = self.authorized(self.client.get(self.file_url(repo, file)), repo);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled(context)),
            response = request.send() => response.map_err(|e| request_error(&context, e))?,
        };

        let offset = match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                info!(file = %file.name, "Resuming download at {}", format_bytes(offset));
                offset
            }
            status if status.is_success() => 0,
            StatusCode::RANGE_NOT_SATISFIABLE => {
                let part = part_path(dest);
                tokio::fs::remove_file(&part)
                    .await
                    .map_err(|e| Error::filesystem(&part, e))?;
                return Err(Error::transient(context, "staged data rejected by server"));
            }
            status => {
                return Err(classify_status(status, repo, &format!("file {} in {}", file.name, repo)))
            }
        };

        if offset == 0 {
            info!(file = %file.name, size = %format_bytes(file.size), "Downloading");
        }

        let chunk_context = context.clone();
        let stream = Box::pin(
            response
                .bytes_stream()
                .map(move |chunk| chunk.map_err(|e| Error::transient(chunk_context.clone(), e))),
        );

        write_part(dest, offset, stream, cancel).await?;
        commit(dest, file.size).await
    }
}

#[async_trait]
impl ArtifactSource for HfArtifactSource {
    async fn list_files(&self, repo: &RemoteRepo) -> Result<Vec<FileDescriptor>> {
        // Listing is short; callers cancel by dropping the future.
        let never = CancellationToken::new();
        let description = format!("listing {}", repo);

        with_backoff(&self.retry, &description, &never, move || self.list_once(repo)).await
    }

    async fn download_file(
        &self,
        repo: &RemoteRepo,
        file: &FileDescriptor,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let description = format!("download of {}", file.name);

        with_backoff(&self.retry, &description, cancel, move || {
            self.download_once(repo, file, dest, cancel)
        })
        .await
    }
}

/// Maps an unsuccessful HTTP status to the error taxonomy
fn classify_status(status: StatusCode, repo: &RemoteRepo, what: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Auth {
            repo: repo.repo_path.clone(),
            message: format!("access to {} denied ({})", what, status),
        },
        StatusCode::NOT_FOUND => Error::NotFound(format!("{} does not exist", what)),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Error::transient(what, status)
        }
        s if s.is_server_error() => Error::transient(what, s),
        s => Error::ExternalService(format!("registry answered {} for {}", s, what)),
    }
}

fn request_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_builder() {
        Error::Internal(format!("{}: {}", context, err))
    } else if err.is_decode() {
        Error::ExternalService(format!("{}: malformed response: {}", context, err))
    } else {
        Error::transient(context, err)
    }
}
