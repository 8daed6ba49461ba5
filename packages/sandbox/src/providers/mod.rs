// ABOUTME: Container runtime trait used by the executors and its Docker implementation
// ABOUTME: Defines the hardened container spec, output streaming types and labelled listing

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerRuntime;

/// Label marking every container this crate creates
pub const LABEL_MANAGED: &str = "codebox.managed";
pub const LABEL_KIND: &str = "codebox.kind";
pub const LABEL_HOST: &str = "codebox.host";
pub const LABEL_RUN_ID: &str = "codebox.run_id";
pub const LABEL_SESSION_ID: &str = "codebox.session_id";
pub const LABEL_CONVERSATION_ID: &str = "codebox.conversation_id";

pub const KIND_EPHEMERAL: &str = "ephemeral";
pub const KIND_SESSION: &str = "session";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Container not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Reduce an arbitrary id to characters valid in container and file names.
pub fn name_fragment(id: &str) -> String {
    let fragment: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(64)
        .collect();
    if fragment.is_empty() {
        "run".to_string()
    } else {
        fragment
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Everything needed to launch one sandbox container.
///
/// Network isolation, a read-only root filesystem, dropped capabilities and
/// no-new-privileges are not options: every runtime applies them.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub mounts: Vec<Mount>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub memory_mb: u64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub tmpfs_size_mb: u64,
    pub user: Option<String>,
}

/// Stream output from a container's stdout/stderr
pub struct OutputStream {
    pub receiver: tokio::sync::mpsc::UnboundedReceiver<OutputChunk>,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// What the runtime itself reports, never inferred from stored state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Missing,
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl ContainerSummary {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime daemon is reachable
    async fn is_available(&self) -> Result<bool>;

    /// Create and start a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Follow a container's stdout/stderr until it exits
    async fn stream_output(&self, container_id: &str) -> Result<OutputStream>;

    /// Wait for the container to stop and return its exit code
    async fn wait_container(&self, container_id: &str) -> Result<i64>;

    /// SIGKILL the container
    async fn kill_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    /// Force-remove a container. Removing a missing container succeeds.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn container_state(&self, container_id: &str) -> Result<ContainerState>;

    /// All managed containers (running or not) carrying every given label
    async fn list_containers(&self, labels: &[(&str, &str)]) -> Result<Vec<ContainerSummary>>;
}
