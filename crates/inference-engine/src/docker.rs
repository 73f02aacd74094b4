//! Container runtime driven through the `docker` command line
//!
//! Works with any runtime exposing docker's CLI (`docker`, `podman`,
//! `nerdctl`). Secret environment values are handed to the child process
//! through its environment and referenced by name only (`-e NAME`), so
//! they never appear in argument lists.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, trace};

use common::error::{Error, Result};

use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, LogStream};

const STATE_FORMAT: &str = "{{.State.Running}} {{.State.ExitCode}}";
const STOP_TIMEOUT_SECS: &str = "10";
const LOG_CHANNEL_CAPACITY: usize = 256;

/// [`ContainerRuntime`] backed by the docker CLI
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    bin: String,
}

impl DockerRuntime {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.bin);
        command.stdin(Stdio::null()).kill_on_drop(true);
        command
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        trace!("{} {}", self.bin, args.join(" "));
        self.command()
            .args(args)
            .output()
            .await
            .map_err(|e| Error::ExternalService(format!("Failed to run {}: {}", self.bin, e)))
    }

    fn failure(&self, action: &str, output: &Output) -> Error {
        Error::ExternalService(format!(
            "{} {} failed ({}): {}",
            self.bin,
            action,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Arguments of `docker run` for `spec`. Secrets are referenced by name.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];

    if let Some(gpus) = &spec.gpus {
        args.extend(["--gpus".to_string(), gpus.clone()]);
    }
    if let Some(shm_size) = &spec.shm_size {
        args.extend(["--shm-size".to_string(), shm_size.clone()]);
    }

    args.extend([
        "--publish".to_string(),
        format!("{}:{}", spec.port.host_port, spec.port.container_port),
    ]);

    for mount in &spec.mounts {
        let mut volume = format!("{}:{}", mount.host_path.display(), mount.container_path);
        if mount.read_only {
            volume.push_str(":ro");
        }
        args.extend(["--volume".to_string(), volume]);
    }

    for (key, value) in &spec.env {
        args.extend(["--env".to_string(), format!("{}={}", key, value)]);
    }
    for key in spec.secrets.keys() {
        args.extend(["--env".to_string(), key.clone()]);
    }

    args.push(spec.image.clone());
    args
}

/// Parses the output of `inspect --format` with [`STATE_FORMAT`]
pub fn parse_state(output: &str) -> Option<ContainerStatus> {
    let mut fields = output.split_whitespace();
    let running = fields.next()?.parse::<bool>().ok()?;
    let exit_code = fields.next().and_then(|code| code.parse::<i64>().ok());

    Some(ContainerStatus {
        running,
        exit_code: if running { None } else { exit_code },
    })
}

fn is_missing_container(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr);
    stderr.contains("No such container") || stderr.contains("no such container")
}

/// Splits `--timestamps` log lines into their time and text. A line
/// without a readable timestamp continues the previous one.
fn timestamped_lines(output: &str) -> Vec<(Option<DateTime<FixedOffset>>, &str)> {
    let mut last = None;
    output
        .lines()
        .map(|line| {
            let parsed = line
                .split_once(' ')
                .and_then(|(ts, text)| DateTime::parse_from_rfc3339(ts).ok().map(|ts| (ts, text)));
            match parsed {
                Some((ts, text)) => {
                    last = Some(ts);
                    (last, text)
                }
                None => (last, line),
            }
        })
        .collect()
}

/// Interleaves the two output streams of `logs --timestamps` in time order
/// and keeps the last `lines` lines, timestamps stripped
pub fn merge_timestamped(stdout: &str, stderr: &str, lines: usize) -> Vec<String> {
    let mut all = timestamped_lines(stdout);
    all.extend(timestamped_lines(stderr));
    // stable, so stdout wins ties
    all.sort_by_key(|(ts, _)| *ts);

    let skip = all.len().saturating_sub(lines);
    all.into_iter()
        .skip(skip)
        .map(|(_, text)| text.to_string())
        .collect()
}

fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, LinesCodec::new());
        while let Some(line) = lines.next().await {
            let Ok(line) = line else { break };
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_present(&self, image: &str) -> Result<bool> {
        let output = self
            .output(&["image", "inspect", "--format", "{{.Id}}", image])
            .await?;
        Ok(output.status.success())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!("Pulling image {}", image);

        let mut child = self
            .command()
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ExternalService(format!("Failed to run {}: {}", self.bin, e)))?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = FramedRead::new(stdout, LinesCodec::new());
            while let Some(Ok(line)) = lines.next().await {
                debug!(image, "{}", line);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::ExternalService(format!("Failed to run {}: {}", self.bin, e)))?;
        if !output.status.success() {
            return Err(self.failure(&format!("pull {}", image), &output));
        }
        Ok(())
    }

    async fn run(&self, spec: &ContainerSpec) -> Result<()> {
        let args = run_args(spec);
        debug!("{} {}", self.bin, args.join(" "));

        let mut command = self.command();
        command.args(&args);
        for (key, value) in &spec.secrets {
            command.env(key, value.expose());
        }

        let output = command
            .output()
            .await
            .map_err(|e| Error::ExternalService(format!("Failed to run {}: {}", self.bin, e)))?;
        if !output.status.success() {
            return Err(self.failure(&format!("run {}", spec.name), &output));
        }

        let id = String::from_utf8_lossy(&output.stdout);
        info!(container = %spec.name, id = %id.trim(), "Container started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let output = self.output(&["stop", "--time", STOP_TIMEOUT_SECS, name]).await?;
        if !output.status.success() && !is_missing_container(&output.stderr) {
            return Err(self.failure(&format!("stop {}", name), &output));
        }

        let output = self.output(&["rm", "--force", name]).await?;
        if !output.status.success() && !is_missing_container(&output.stderr) {
            return Err(self.failure(&format!("rm {}", name), &output));
        }

        debug!(container = name, "Container stopped and removed");
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerStatus>> {
        let output = self
            .output(&["container", "inspect", "--format", STATE_FORMAT, name])
            .await?;

        if !output.status.success() {
            if is_missing_container(&output.stderr) {
                return Ok(None);
            }
            return Err(self.failure(&format!("inspect {}", name), &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_state(&stdout).map(Some).ok_or_else(|| {
            Error::ExternalService(format!(
                "Unexpected inspect output for {}: {}",
                name,
                stdout.trim()
            ))
        })
    }

    async fn logs(&self, name: &str) -> Result<LogStream> {
        let mut child = self
            .command()
            .args(["logs", "--follow", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ExternalService(format!("Failed to run {}: {}", self.bin, e)))?;

        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, tx.clone());
        }

        // The follower is killed once the consumer goes away.
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {}
                _ = child.wait() => {}
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn tail_logs(&self, name: &str, lines: usize) -> Result<Vec<String>> {
        let count = lines.to_string();
        let output = self
            .output(&["logs", "--timestamps", "--tail", &count, name])
            .await?;

        if !output.status.success() {
            if is_missing_container(&output.stderr) {
                return Ok(Vec::new());
            }
            return Err(self.failure(&format!("logs {}", name), &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(merge_timestamped(&stdout, &stderr, lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Mount, PortMapping};
    use common::credentials::Secret;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn spec() -> ContainerSpec {
        let mut env = BTreeMap::new();
        env.insert("NIM_SERVED_MODEL_NAME".to_string(), "Llama-3.2-3B-Instruct-Q4_K_M".to_string());
        let mut secrets = BTreeMap::new();
        secrets.insert("NGC_API_KEY".to_string(), Secret::new("nvapi-very-secret"));

        ContainerSpec {
            image: "nvcr.io/nim/nvidia/llm-nim:latest".to_string(),
            name: "GGUF-NIM".to_string(),
            mounts: vec![Mount {
                host_path: PathBuf::from("/work/Llama-3.2-3B-Instruct/bartowski-Q4_K_M"),
                container_path: "/opt/models/Llama-3.2-3B-Instruct-Q4_K_M".to_string(),
                read_only: true,
            }],
            env,
            secrets,
            port: PortMapping {
                host_port: 8000,
                container_port: 8000,
            },
            gpus: Some("all".to_string()),
            shm_size: Some("16GB".to_string()),
        }
    }

    #[test]
    fn test_run_args() {
        let args = run_args(&spec());
        let joined = args.join(" ");

        assert_eq!(&args[..4], ["run", "--detach", "--name", "GGUF-NIM"]);
        assert!(joined.contains("--gpus all --shm-size 16GB --publish 8000:8000"));
        assert!(joined.contains(
            "--volume /work/Llama-3.2-3B-Instruct/bartowski-Q4_K_M:/opt/models/Llama-3.2-3B-Instruct-Q4_K_M:ro"
        ));
        assert!(joined.contains("--env NIM_SERVED_MODEL_NAME=Llama-3.2-3B-Instruct-Q4_K_M"));
        assert!(joined.contains("--env NGC_API_KEY "));
        assert!(!joined.contains("nvapi-very-secret"));
        assert_eq!(args.last().unwrap(), "nvcr.io/nim/nvidia/llm-nim:latest");
    }

    #[test]
    fn test_run_args_without_gpus() {
        let mut spec = spec();
        spec.gpus = None;
        spec.shm_size = None;
        let args = run_args(&spec);
        assert!(!args.contains(&"--gpus".to_string()));
        assert!(!args.contains(&"--shm-size".to_string()));
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(
            parse_state("true 0\n"),
            Some(ContainerStatus {
                running: true,
                exit_code: None
            })
        );
        assert_eq!(
            parse_state("false 137\n"),
            Some(ContainerStatus {
                running: false,
                exit_code: Some(137)
            })
        );
        assert_eq!(parse_state(""), None);
        assert_eq!(parse_state("maybe 1"), None);
    }

    #[test]
    fn test_tail_interleaves_streams_by_time() {
        let stdout = "2024-05-01T10:00:01.000000000Z loading model\n\
                      2024-05-01T10:00:05.000000000Z listening on 8000\n";
        let stderr = "2024-05-01T10:00:02.000000000Z warn 1\n\
                      2024-05-01T10:00:03.000000000Z warn 2\n\
                      2024-05-01T10:00:04.000000000Z warn 3\n";

        assert_eq!(
            merge_timestamped(stdout, stderr, 3),
            vec!["warn 2", "warn 3", "listening on 8000"]
        );
        assert_eq!(merge_timestamped(stdout, stderr, 50).len(), 5);
        assert_eq!(merge_timestamped(stdout, stderr, 50)[0], "loading model");
    }

    #[test]
    fn test_tail_keeps_continuation_lines_in_place() {
        let stdout = "2024-05-01T10:00:01.000000000Z Traceback:\n  File \"server.py\"\n\
                      2024-05-01T10:00:03.000000000Z exiting\n";
        let stderr = "2024-05-01T10:00:02.000000000Z CUDA error\n";

        assert_eq!(
            merge_timestamped(stdout, stderr, 10),
            vec!["Traceback:", "  File \"server.py\"", "CUDA error", "exiting"]
        );
    }

    #[test]
    fn test_missing_container_detection() {
        assert!(is_missing_container(b"Error response from daemon: No such container: GGUF-NIM"));
        assert!(is_missing_container(b"Error: no such container GGUF-NIM"));
        assert!(!is_missing_container(b"permission denied while trying to connect"));
    }
}
