// ABOUTME: Error types for sandbox executors
// ABOUTME: Host-side failures that executors fold into terminal results

use crate::artifacts::ArtifactError;
use crate::providers::RuntimeError;
use codebox_protocol::ProtocolError;
use codebox_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Artifact rejected: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Input file error: {0}")]
    Input(String),

    #[error("Session did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("Session {0} was reset")]
    SessionGone(String),

    #[error("Could not acquire a session for conversation {0}")]
    Acquire(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
