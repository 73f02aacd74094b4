//! Resumable file transfers
//!
//! Bytes are staged in `<dest>.part` and only renamed to `<dest>` once the
//! staged file has exactly the size the registry listed. A destination that
//! exists is therefore always complete, and an interrupted transfer leaves
//! a `.part` file that the next attempt continues from.

use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use common::error::{Error, Result};
use common::utils::format_bytes;

/// Suffix of staged, not yet committed transfers
pub const PART_SUFFIX: &str = ".part";

/// Emit a progress line every this many bytes
const PROGRESS_STEP: u64 = 256 * 1024 * 1024;

/// Path of the staging file for `dest`
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PART_SUFFIX);
    dest.with_file_name(name)
}

/// Returns true for staging file names
pub fn is_part_file(name: &str) -> bool {
    name.ends_with(PART_SUFFIX)
}

/// Whether `dest` already holds the complete file.
///
/// A listed size of 0 means the registry did not report one; any existing
/// file is then accepted.
pub fn is_already_downloaded(dest: &Path, expected_size: u64) -> Result<bool> {
    match std::fs::metadata(dest) {
        Ok(meta) if meta.is_file() => {
            Ok(meta.len() == expected_size || (expected_size == 0 && meta.len() > 0))
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::filesystem(dest, e)),
    }
}

/// Byte offset a transfer into `dest` can resume from. Staged data that is
/// already as long as (or longer than) the expected size cannot be resumed
/// and is restarted.
pub fn resume_offset(dest: &Path, expected_size: u64) -> u64 {
    match std::fs::metadata(part_path(dest)) {
        Ok(meta) if meta.is_file() && (expected_size == 0 || meta.len() < expected_size) => {
            meta.len()
        }
        _ => 0,
    }
}

/// Appends `stream` to the staging file of `dest`, starting at `offset`
/// (0 truncates any staged data). Returns the staged length afterwards.
pub async fn write_part<S>(
    dest: &Path,
    offset: u64,
    mut stream: S,
    cancel: &CancellationToken,
) -> Result<u64>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let part = part_path(dest);
    if let Some(parent) = part.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::filesystem(parent, e))?;
    }

    let mut file = if offset > 0 {
        OpenOptions::new().append(true).open(&part).await
    } else {
        OpenOptions::new().create(true).write(true).truncate(true).open(&part).await
    }
    .map_err(|e| Error::filesystem(&part, e))?;

    let started = Instant::now();
    let mut written = offset;
    let mut next_report = offset + PROGRESS_STEP;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                // Keep what we have; the next attempt resumes from here.
                file.flush().await.map_err(|e| Error::filesystem(&part, e))?;
                return Err(Error::Cancelled(format!("transfer of {}", dest.display())));
            }
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else { break };
        let chunk = chunk?;

        file.write_all(&chunk)
            .await
            .map_err(|e| Error::filesystem(&part, e))?;
        written += chunk.len() as u64;
        trace!(bytes = chunk.len(), "wrote chunk to {}", part.display());

        if written >= next_report {
            debug!(
                "{}: {} staged ({}/s)",
                dest.display(),
                format_bytes(written),
                format_bytes(rate(written - offset, started))
            );
            next_report = written + PROGRESS_STEP;
        }
    }

    file.flush().await.map_err(|e| Error::filesystem(&part, e))?;
    file.sync_all().await.map_err(|e| Error::filesystem(&part, e))?;

    Ok(written)
}

/// Moves the staged file into place once it has the expected size.
///
/// A short staging file is kept and reported as transient so that the
/// transfer is resumed; an oversized one is discarded.
pub async fn commit(dest: &Path, expected_size: u64) -> Result<()> {
    let part = part_path(dest);
    let staged = tokio::fs::metadata(&part)
        .await
        .map_err(|e| Error::filesystem(&part, e))?
        .len();

    if expected_size > 0 && staged != expected_size {
        if staged > expected_size {
            tokio::fs::remove_file(&part)
                .await
                .map_err(|e| Error::filesystem(&part, e))?;
        }
        return Err(Error::transient(
            format!("download of {}", dest.display()),
            format!(
                "received {} bytes, expected {}",
                staged, expected_size
            ),
        ));
    }

    tokio::fs::rename(&part, dest)
        .await
        .map_err(|e| Error::filesystem(dest, e))?;

    debug!("Committed {} ({})", dest.display(), format_bytes(staged));
    Ok(())
}

fn rate(bytes: u64, since: Instant) -> u64 {
    let secs = since.elapsed().as_secs_f64();
    if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn chunks(parts: &[&'static [u8]]) -> impl Stream<Item = Result<Bytes>> + Unpin {
        stream::iter(
            parts
                .iter()
                .map(|p| Ok(Bytes::from_static(p)))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_part_path() {
        let dest = Path::new("/work/model/config.json");
        assert_eq!(part_path(dest), PathBuf::from("/work/model/config.json.part"));
        assert!(is_part_file("model-Q4_K_M.gguf.part"));
        assert!(!is_part_file("model-Q4_K_M.gguf"));
    }

    #[tokio::test]
    async fn test_write_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("config.json");
        let cancel = CancellationToken::new();

        let written = write_part(&dest, 0, chunks(&[b"{\"a\":", b"1}"]), &cancel)
            .await
            .unwrap();
        assert_eq!(written, 7);
        assert!(!dest.exists());
        assert!(!is_already_downloaded(&dest, 7).unwrap());

        commit(&dest, 7).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "{\"a\":1}");
        assert!(!part_path(&dest).exists());
        assert!(is_already_downloaded(&dest, 7).unwrap());
        assert!(!is_already_downloaded(&dest, 8).unwrap());
    }

    #[tokio::test]
    async fn test_interrupted_transfer_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model-Q4_K_M.gguf");
        let cancel = CancellationToken::new();

        let failing = stream::iter(vec![
            Ok(Bytes::from_static(b"GGUF")),
            Err(Error::transient("download", "connection reset")),
        ]);
        let result = write_part(&dest, 0, failing, &cancel).await;
        assert!(matches!(result, Err(Error::Transient { .. })));
        assert!(!dest.exists());

        let offset = resume_offset(&dest, 10);
        assert_eq!(offset, 4);

        let written = write_part(&dest, offset, chunks(&[b"-weights"]), &cancel).await;
        assert!(written.is_ok());
        // 12 bytes staged but 10 expected: oversize is discarded, never committed
        assert!(commit(&dest, 10).await.is_err());
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_short_transfer_is_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tokenizer.json");
        let cancel = CancellationToken::new();

        write_part(&dest, 0, chunks(&[b"abc"]), &cancel).await.unwrap();
        let err = commit(&dest, 6).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!dest.exists());
        assert_eq!(resume_offset(&dest, 6), 3);
    }

    #[tokio::test]
    async fn test_cancel_keeps_staged_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.gguf");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = write_part(&dest, 0, stream::pending(), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert!(part_path(&dest).exists());
        assert!(!dest.exists());
    }
}
