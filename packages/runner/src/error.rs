// ABOUTME: Error types for the guest runner
// ABOUTME: Distinguishes interpreter failures from protocol and filesystem errors

use codebox_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Interpreter exited unexpectedly: {0}")]
    KernelExited(String),

    #[error("Interpreter protocol violation: {0}")]
    KernelProtocol(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
