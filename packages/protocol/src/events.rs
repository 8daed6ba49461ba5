// ABOUTME: Newline-delimited JSON events written by the one-shot runner on stdout
// ABOUTME: A closed tagged union of status, error and result messages decoded at the host boundary

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};

/// A file the runner reports as produced, relative to the output root it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    pub rel_path: String,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// Progress notification, forwarded to the status bus
    Status { stage: String, message: String },
    /// Terminal: guest code raised
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        traceback: Option<String>,
        #[serde(default)]
        stdout_tail: String,
        #[serde(default)]
        stderr_tail: String,
    },
    /// Terminal: guest code completed
    Result {
        #[serde(default)]
        stdout_tail: String,
        #[serde(default)]
        stderr_tail: String,
        #[serde(default)]
        artifacts: Vec<ArtifactRef>,
    },
}

impl RunnerEvent {
    pub fn status(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Status { .. })
    }

    /// Encode as a single line, including the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one stdout line. Lines that are not JSON objects with a known
    /// `type` are reported as malformed so callers can treat them as plain output.
    pub fn from_line(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Err(ProtocolError::MalformedLine(trimmed.to_string()));
        }
        serde_json::from_str(trimmed).map_err(|_| ProtocolError::MalformedLine(trimmed.to_string()))
    }
}
