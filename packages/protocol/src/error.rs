// ABOUTME: Error types for protocol encoding, decoding and IPC file handling
// ABOUTME: Wraps IO and JSON failures with the path or line that caused them

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed runner line: {0}")]
    MalformedLine(String),

    #[error("Invalid request file name: {0}")]
    InvalidFileName(String),
}

impl ProtocolError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
