// ABOUTME: Docker implementation of the SandboxRuntime trait
// ABOUTME: Uses bollard to manage isolated, network-less containers for script execution

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        StopContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::runtime::{RuntimeError, SandboxRuntime};
use crate::types::{ExecHandle, ExecOutcome, OutputChunk, SandboxSpec, StreamKind, WorkFile};

type Result<T> = std::result::Result<T, RuntimeError>;

/// Work dir used when a container is not in the bookkeeping map, e.g.
/// one adopted after a process restart
const DEFAULT_WORK_DIR: &str = "/workspace";

/// Docker-backed sandbox runtime.
///
/// Sandboxes are plain containers with network disabled, a memory/CPU cap,
/// and an idle `sleep infinity` entrypoint so they can sit warm in the pool.
pub struct DockerRuntime {
    client: Docker,
    label_prefix: String,
    /// Cache of successfully pulled images to avoid redundant pulls
    image_cache: Arc<RwLock<HashMap<String, chrono::DateTime<chrono::Utc>>>>,
    /// Work dir of each managed container, recorded at creation
    work_dirs: Arc<RwLock<HashMap<String, String>>>,
    /// Timeout for image pull operations
    pull_timeout: Duration,
}

impl DockerRuntime {
    /// Connect with default Docker settings and a 10 minute pull timeout
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(600))
    }

    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self::with_client_and_timeout(client, timeout))
    }

    /// Create with a specific Docker connection (mainly for tests)
    pub fn with_client(client: Docker) -> Self {
        Self::with_client_and_timeout(client, Duration::from_secs(600))
    }

    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            label_prefix: "caselab.sandbox".to_string(),
            image_cache: Arc::new(RwLock::new(HashMap::new())),
            work_dirs: Arc::new(RwLock::new(HashMap::new())),
            pull_timeout: timeout,
        }
    }

    async fn work_dir(&self, container_id: &str) -> String {
        self.work_dirs
            .read()
            .await
            .get(container_id)
            .cloned()
            .unwrap_or_else(|| DEFAULT_WORK_DIR.to_string())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        {
            let cache = self.image_cache.read().await;
            if cache.contains_key(image) {
                debug!("Image {} found in cache, skipping pull", image);
                return Ok(());
            }
        }

        if self.image_exists(image).await? {
            let mut cache = self.image_cache.write().await;
            cache.insert(image.to_string(), chrono::Utc::now());
            return Ok(());
        }

        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            while let Some(result) = stream.next().await {
                match result {
                    Ok(progress) => {
                        if let Some(error) = progress.error {
                            return Err(RuntimeError::Image(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(e) => {
                        return Err(RuntimeError::Image(format!(
                            "Failed to pull image {}: {}",
                            image, e
                        )));
                    }
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                let mut cache = self.image_cache.write().await;
                cache.insert(image.to_string(), chrono::Utc::now());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::Image(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::Image(e.to_string())),
        }
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }

    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<String> {
        self.pull_image(&spec.image).await?;

        let name = format!("caselab-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let options = CreateContainerOptions {
            name,
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), container_config(&self.label_prefix, spec))
            .await
            .map_err(|e| RuntimeError::Container(e.to_string()))?;

        debug!("Created sandbox container: {}", container.id);

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Container(e.to_string()))?;

        self.work_dirs
            .write()
            .await
            .insert(container.id.clone(), spec.work_dir.clone());

        Ok(container.id)
    }

    async fn inject_files(&self, container_id: &str, files: &[WorkFile]) -> Result<()> {
        let tar_data = build_tar_archive(files)?;

        let options = UploadToContainerOptions {
            path: self.work_dir(container_id).await,
            ..Default::default()
        };

        self.client
            .upload_to_container(container_id, Some(options), tar_data.into())
            .await
            .map_err(|e| RuntimeError::Container(e.to_string()))?;

        Ok(())
    }

    async fn reset_workdir(&self, container_id: &str) -> Result<()> {
        let exec_config = CreateExecOptions {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                reset_command(&self.work_dir(container_id).await),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        if let StartExecResults::Attached { mut output, .. } = start_result {
            while let Some(_msg) = output.next().await {}
        }

        let inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        match inspect.exit_code {
            Some(0) | None => Ok(()),
            Some(code) => Err(RuntimeError::Exec(format!(
                "workdir reset exited with code {}",
                code
            ))),
        }
    }

    async fn exec_streaming(
        &self,
        container_id: &str,
        command: Vec<String>,
        env_vars: HashMap<String, String>,
    ) -> Result<ExecHandle> {
        debug!("Exec in sandbox {}: {:?}", container_id, command);

        let env: Vec<String> = env_vars
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            env: Some(env),
            working_dir: Some(self.work_dir(container_id).await),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::Exec(e.to_string()))?;

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let client = self.client.clone();
        let exec_id = exec.id.clone();
        let started = std::time::Instant::now();

        tokio::spawn(async move {
            match start_result {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(msg) = output.next().await {
                        let (stream, data) = match msg {
                            Ok(LogOutput::StdOut { message }) => {
                                (StreamKind::Stdout, message.to_vec())
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                (StreamKind::Stderr, message.to_vec())
                            }
                            Ok(LogOutput::Console { message }) => {
                                (StreamKind::Stdout, message.to_vec())
                            }
                            Ok(_) => continue,
                            Err(e) => {
                                // Stream errors happen when the container is
                                // killed out from under the exec; the exit
                                // code inspection below still resolves.
                                debug!("Exec stream ended with error: {}", e);
                                break;
                            }
                        };

                        let chunk = OutputChunk {
                            timestamp: chrono::Utc::now(),
                            stream,
                            data,
                        };

                        if chunk_tx.send(chunk).is_err() {
                            break; // Receiver dropped
                        }
                    }
                }
                StartExecResults::Detached => {
                    warn!("Exec was detached unexpectedly");
                }
            }

            // Close the output stream before resolving the outcome (contract
            // consumers rely on to drain safely).
            drop(chunk_tx);

            let exit_code = match client.inspect_exec(&exec_id).await {
                Ok(inspect) => inspect.exit_code.unwrap_or(-1),
                Err(e) => {
                    warn!("Failed to inspect exec {}: {}", exec_id, e);
                    -1
                }
            };

            let _ = outcome_tx.send(ExecOutcome {
                exit_code,
                duration: started.elapsed(),
            });
        });

        Ok(ExecHandle {
            output: chunk_rx,
            outcome: outcome_rx,
        })
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        info!("Hard-killing sandbox {}", container_id);

        // t=0: SIGKILL immediately, taking the exec'd process group with it
        let options = StopContainerOptions { t: 0 };
        self.client
            .stop_container(container_id, Some(options))
            .await
            .map_err(|e| RuntimeError::Container(e.to_string()))?;

        Ok(())
    }

    async fn remove_sandbox(&self, container_id: &str) -> Result<()> {
        debug!("Removing sandbox {}", container_id);

        let options = RemoveContainerOptions {
            force: true,
            v: true, // Remove volumes
            ..Default::default()
        };

        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| RuntimeError::Container(e.to_string()))?;

        self.work_dirs.write().await.remove(container_id);

        Ok(())
    }
}

fn container_config(label_prefix: &str, spec: &SandboxSpec) -> Config<String> {
    let mut labels = HashMap::new();
    labels.insert(format!("{}.managed", label_prefix), "true".to_string());
    for (k, v) in &spec.labels {
        labels.insert(k.clone(), v.clone());
    }

    let env: Vec<String> = spec
        .env_vars
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let host_config = bollard::models::HostConfig {
        memory: Some((spec.memory_mb * 1024 * 1024) as i64),
        cpu_shares: Some((spec.cpu_cores * 1024.0) as i64),
        // Untrusted scripts run without network unless explicitly enabled
        network_mode: if spec.network_enabled {
            None
        } else {
            Some("none".to_string())
        },
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        // Idle entrypoint: the sandbox waits for exec'd scripts
        cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
        env: Some(env),
        working_dir: Some(spec.work_dir.clone()),
        labels: Some(labels),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn reset_command(work_dir: &str) -> String {
    format!("rm -rf {dir}/* {dir}/.[!.]* 2>/dev/null; true", dir = work_dir)
}

fn build_tar_archive(files: &[WorkFile]) -> std::io::Result<Vec<u8>> {
    use tar::{Builder, Header};

    let mut archive = Builder::new(Vec::new());

    for file in files {
        let mut header = Header::new_gnu();
        header.set_size(file.contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        archive.append_data(&mut header, &file.path, file.contents.as_slice())?;
    }

    archive.into_inner().map_err(std::io::Error::other)
}
