//! Boundary to the remote artifact registry.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common::error::Result;
use common::types::{FileDescriptor, RemoteRepo};

/// A remote registry of model repositories.
///
/// Implementations classify failures: [`common::Error::Auth`] for rejected
/// tokens, [`common::Error::NotFound`] for unknown repositories or files and
/// [`common::Error::Transient`] for network trouble that survived retrying.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Lists the files of `repo`, ordered by name
    async fn list_files(&self, repo: &RemoteRepo) -> Result<Vec<FileDescriptor>>;

    /// Downloads `file` from `repo` to `dest`.
    ///
    /// If `dest` already holds `file.size` bytes this is a no-op. Data is
    /// staged in a temporary file next to `dest` that is renamed into place
    /// only once the transfer is complete, so `dest` never looks complete
    /// after an interrupted transfer. Cancelling `cancel` aborts the
    /// transfer with [`common::Error::Cancelled`] and leaves the temporary
    /// file behind for a later resume.
    async fn download_file(
        &self,
        repo: &RemoteRepo,
        file: &FileDescriptor,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;
}
