//! In-memory registry for tests of this crate and the crates built on it

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use common::error::{Error, Result};
use common::types::{FileDescriptor, RemoteRepo};

use crate::source::ArtifactSource;

pub const CONFIG_REPO: &str = "meta-llama/Llama-3.2-3B-Instruct";
pub const WEIGHTS_REPO: &str = "bartowski/Llama-3.2-3B-Instruct-GGUF";

/// Registry serving in-memory files and recording every call
#[derive(Default)]
pub struct FakeSource {
    repos: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    fail_once: Mutex<HashSet<String>>,
    fail_always: Mutex<HashSet<String>>,
    transfer_delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeSource {
    /// Config repo with top-level and `original/` files, weights repo with
    /// a Q4_K_M and a Q8_0 file
    pub fn llama() -> Self {
        Self::default()
            .with_file(CONFIG_REPO, "README.md", b"readme")
            .with_file(CONFIG_REPO, "config.json", b"{\"model_type\":\"llama\"}")
            .with_file(CONFIG_REPO, "original/params.json", b"{}")
            .with_file(CONFIG_REPO, "original/tokenizer.json", b"{\"old\":1}")
            .with_file(CONFIG_REPO, "tokenizer.json", b"{\"version\":\"1.0\"}")
            .with_file(CONFIG_REPO, "tokenizer_config.json", b"{}")
            .with_file(WEIGHTS_REPO, "Llama-3.2-3B-Instruct-Q4_K_M.gguf", b"GGUF-q4km")
            .with_file(WEIGHTS_REPO, "Llama-3.2-3B-Instruct-Q8_0.gguf", b"GGUF-q8")
    }

    pub fn with_file(mut self, repo: &str, name: &str, data: &[u8]) -> Self {
        self.repos
            .entry(repo.to_string())
            .or_default()
            .insert(name.to_string(), data.to_vec());
        self
    }

    pub fn without_file(mut self, repo: &str, name: &str) -> Self {
        if let Some(files) = self.repos.get_mut(repo) {
            files.remove(name);
        }
        self
    }

    /// Every download sleeps this long before writing
    pub fn with_transfer_delay(mut self, delay: Duration) -> Self {
        self.transfer_delay = Some(delay);
        self
    }

    /// Fails the next download of `file` with a transient error
    pub fn fail_once(&self, file: &str) {
        self.fail_once.lock().insert(file.to_string());
    }

    /// Fails every download of `file` with a transient error
    pub fn break_file(&self, file: &str) {
        self.fail_always.lock().insert(file.to_string());
    }

    pub fn repair_file(&self, file: &str) {
        self.fail_always.lock().remove(file);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Names of the files requested, in request order
    pub fn downloads(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.strip_prefix("get ").map(str::to_string))
            .collect()
    }

    /// Most downloads ever running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtifactSource for FakeSource {
    async fn list_files(&self, repo: &RemoteRepo) -> Result<Vec<FileDescriptor>> {
        self.calls.lock().push(format!("list {}", repo));
        let files = self
            .repos
            .get(&repo.repo_path)
            .ok_or_else(|| Error::NotFound(format!("repository {}", repo)))?;
        Ok(files
            .iter()
            .map(|(name, data)| FileDescriptor::new(name.clone(), data.len() as u64))
            .collect())
    }

    async fn download_file(
        &self,
        repo: &RemoteRepo,
        file: &FileDescriptor,
        dest: &Path,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.calls.lock().push(format!("get {}", file.name));
        if self.fail_once.lock().remove(&file.name) || self.fail_always.lock().contains(&file.name) {
            return Err(Error::transient("download", "connection reset"));
        }
        let data = self
            .repos
            .get(&repo.repo_path)
            .and_then(|files| files.get(&file.name))
            .cloned()
            .ok_or_else(|| Error::NotFound(file.name.clone()))?;

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.transfer_delay {
            tokio::time::sleep(delay).await;
        }
        let written = std::fs::write(dest, data).map_err(|e| Error::filesystem(dest, e));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        written
    }
}
