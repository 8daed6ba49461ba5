// ABOUTME: Request, result and artifact value types exchanged at the executor boundary
// ABOUTME: Shared by the ephemeral and persistent executors and their callers

use codebox_protocol::ManifestEntry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where an input file's bytes come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Inline(Vec<u8>),
    Path(PathBuf),
    /// Key resolved through a [`crate::files::FileStore`]
    Stored(String),
}

#[derive(Debug, Clone)]
pub struct SandboxInputFile {
    pub external_id: String,
    pub display_name: String,
    pub source: InputSource,
    pub content_type: Option<String>,
}

impl SandboxInputFile {
    pub fn new(
        external_id: impl Into<String>,
        display_name: impl Into<String>,
        source: InputSource,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            display_name: display_name.into(),
            source,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SandboxExecutionRequest {
    pub run_id: String,
    pub code: String,
    pub input_files: Vec<SandboxInputFile>,
}

impl SandboxExecutionRequest {
    /// New request with a generated run id.
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
            input_files: Vec::new(),
        }
    }

    pub fn with_input(mut self, file: SandboxInputFile) -> Self {
        self.input_files.push(file);
        self
    }
}

/// External id → sandboxed filename → in-container path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxInputFileMapping {
    pub external_id: String,
    pub sandbox_name: String,
    pub container_path: String,
}

impl From<&ManifestEntry> for SandboxInputFileMapping {
    fn from(entry: &ManifestEntry) -> Self {
        Self {
            external_id: entry.external_id.clone(),
            sandbox_name: entry.sandbox_name.clone(),
            container_path: entry.input_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxArtifact {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecutionResult {
    pub run_id: String,
    pub status: ExecutionStatus,
    pub summary: String,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub artifacts: Vec<SandboxArtifact>,
    pub error_message: Option<String>,
    pub input_files: Vec<SandboxInputFileMapping>,
    pub duration_ms: u64,

    // Persistent mode only
    pub session_id: Option<String>,
    pub reused: bool,
    pub request_sequence: Option<i64>,
    pub queue_wait_ms: Option<u64>,
}

impl SandboxExecutionResult {
    fn terminal(run_id: &str, status: ExecutionStatus, summary: String) -> Self {
        Self {
            run_id: run_id.to_string(),
            status,
            summary,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            artifacts: Vec::new(),
            error_message: None,
            input_files: Vec::new(),
            duration_ms: 0,
            session_id: None,
            reused: false,
            request_sequence: None,
            queue_wait_ms: None,
        }
    }

    pub fn succeeded(run_id: &str, summary: impl Into<String>) -> Self {
        Self::terminal(run_id, ExecutionStatus::Succeeded, summary.into())
    }

    pub fn failed(run_id: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut result = Self::terminal(run_id, ExecutionStatus::Failed, "Execution failed".into());
        result.error_message = Some(message);
        result
    }

    pub fn timeout(run_id: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut result = Self::terminal(run_id, ExecutionStatus::Timeout, "Execution timed out".into());
        result.error_message = Some(message);
        result
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

/// Why a session is not alive, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessReason {
    NoSession,
    TtlExpired,
    WorkspaceMissing,
    ContainerNotRunning,
}

impl LivenessReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::TtlExpired => "ttl_expired",
            Self::WorkspaceMissing => "workspace_missing",
            Self::ContainerNotRunning => "container_not_running",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub alive: bool,
    pub session_id: Option<String>,
    pub request_sequence: i64,
    pub reason: Option<LivenessReason>,
    pub available_files: Vec<SandboxInputFileMapping>,
}

impl SessionStatus {
    pub fn absent() -> Self {
        Self {
            alive: false,
            session_id: None,
            request_sequence: 0,
            reason: Some(LivenessReason::NoSession),
            available_files: Vec::new(),
        }
    }
}
