// ABOUTME: Docker implementation of the container runtime using bollard
// ABOUTME: Applies network isolation, read-only rootfs, dropped capabilities and resource caps to every container

use super::{
    ContainerRuntime, ContainerSpec, ContainerState, ContainerSummary, OutputChunk, OutputStream,
    Result, RuntimeError, StreamType, LABEL_MANAGED,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
        LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as BollardError,
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct DockerRuntime {
    client: Docker,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerRuntime {
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| RuntimeError::ConnectionError(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            pull_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::ImageError(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut last_status = String::new();
            while let Some(item) = stream.next().await {
                let info = item.map_err(|e| {
                    RuntimeError::ImageError(format!("Failed to pull image {}: {}", image, e))
                })?;
                if let Some(status) = &info.status {
                    if status != &last_status {
                        debug!("Pull status: {}", status);
                        last_status = status.clone();
                    }
                }
                if let Some(error) = info.error {
                    return Err(RuntimeError::ImageError(format!(
                        "Failed to pull image {}: {}",
                        image, error
                    )));
                }
            }
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

/// Translate a spec into the bollard create config, hardening included.
pub fn build_container_config(spec: &ContainerSpec) -> Config<String> {
    let mut labels = spec.labels.clone();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

    let binds: Vec<String> = spec
        .mounts
        .iter()
        .map(|m| {
            format!(
                "{}:{}:{}",
                m.host_path,
                m.container_path,
                if m.read_only { "ro" } else { "rw" }
            )
        })
        .collect();

    let mut env: Vec<String> = spec
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();

    let memory = (spec.memory_mb * 1024 * 1024) as i64;
    let host_config = HostConfig {
        binds: Some(binds),
        network_mode: Some("none".to_string()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        privileged: Some(false),
        pids_limit: Some(spec.pids_limit),
        memory: Some(memory),
        memory_swap: Some(memory),
        nano_cpus: Some(spec.nano_cpus),
        tmpfs: Some(HashMap::from([(
            "/tmp".to_string(),
            format!("rw,noexec,nosuid,nodev,size={}m", spec.tmpfs_size_mb),
        )])),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        env: Some(env),
        working_dir: Some(spec.working_dir.clone()),
        user: spec.user.clone(),
        labels: Some(labels),
        network_disabled: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        info!("Creating container: {}", spec.name);

        if !self.image_exists(&spec.image).await? {
            self.pull_image(&spec.image).await?;
        }

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let container = self
            .client
            .create_container(Some(options), build_container_config(spec))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;
        debug!("Created container: {}", container.id);

        if let Err(e) = self
            .client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.remove_container(&container.id).await;
            return Err(RuntimeError::ContainerError(format!(
                "Failed to start {}: {}",
                spec.name, e
            )));
        }

        Ok(container.id)
    }

    async fn stream_output(&self, container_id: &str) -> Result<OutputStream> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        };
        let logs = self.client.logs(container_id, Some(options));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut stream = Box::pin(logs);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(log) => {
                        let (stream_type, data) = match log {
                            LogOutput::StdOut { message } => (StreamType::Stdout, message.to_vec()),
                            LogOutput::StdErr { message } => (StreamType::Stderr, message.to_vec()),
                            LogOutput::Console { message } => (StreamType::Stdout, message.to_vec()),
                            _ => continue,
                        };
                        let chunk = OutputChunk {
                            timestamp: chrono::Utc::now(),
                            stream: stream_type,
                            data,
                        };
                        if tx.send(chunk).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => {
                        error!("Error streaming logs: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(OutputStream { receiver: rx })
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.client.wait_container(container_id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard surfaces nonzero exits as an error carrying the code
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) if is_status(&e, 404) => Err(RuntimeError::NotFound(container_id.to_string())),
            Some(Err(e)) => Err(RuntimeError::ContainerError(e.to_string())),
            None => Err(RuntimeError::ContainerError(format!(
                "wait stream for {} ended without a status",
                container_id
            ))),
        }
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        info!("Killing container: {}", container_id);
        match self
            .client
            .kill_container(container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            // 409: not running
            Err(e) if is_status(&e, 404) || is_status(&e, 409) => Ok(()),
            Err(e) => Err(RuntimeError::ContainerError(e.to_string())),
        }
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        info!("Stopping container: {} (timeout: {}s)", container_id, timeout_secs);
        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(e) if is_status(&e, 304) || is_status(&e, 404) => Ok(()),
            Err(e) => Err(RuntimeError::ContainerError(e.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        info!("Removing container: {}", container_id);
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            // 409: removal already in progress
            Err(e) if is_status(&e, 409) => {
                debug!("Container {} is already being removed", container_id);
                Ok(())
            }
            Err(e) => Err(RuntimeError::ContainerError(e.to_string())),
        }
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState> {
        match self.client.inspect_container(container_id, None).await {
            Ok(inspect) => {
                let running = inspect
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false);
                Ok(if running {
                    ContainerState::Running
                } else {
                    ContainerState::Exited
                })
            }
            Err(e) if is_status(&e, 404) => Ok(ContainerState::Missing),
            Err(e) => Err(RuntimeError::ContainerError(e.to_string())),
        }
    }

    async fn list_containers(&self, labels: &[(&str, &str)]) -> Result<Vec<ContainerSummary>> {
        let mut label_filters = vec![format!("{}=true", LABEL_MANAGED)];
        label_filters.extend(labels.iter().map(|(k, v)| format!("{}={}", k, v)));
        let filters = HashMap::from([("label".to_string(), label_filters)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::ContainerError(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| id.clone());
                let created_at = c
                    .created
                    .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                    .unwrap_or_else(chrono::Utc::now);
                Some(ContainerSummary {
                    id,
                    name,
                    labels: c.labels.unwrap_or_default(),
                    created_at,
                })
            })
            .collect())
    }
}
