// ABOUTME: Filesystem request/response queue shared by the session executor and session runner
// ABOUTME: Sequence-ordered request names, atomic JSON writes and the readiness marker

use crate::error::{ProtocolError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Width of the zero-padded sequence prefix. Names sort lexicographically in
/// arrival order as long as sequences stay below 10^12.
const SEQUENCE_WIDTH: usize = 12;

/// Directory layout of one session's IPC root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcLayout {
    root: PathBuf,
}

impl IpcLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn requests_dir(&self) -> PathBuf {
        self.root.join("requests")
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.root.join("responses")
    }

    pub fn ready_path(&self) -> PathBuf {
        self.root.join("ready")
    }

    pub fn request_path(&self, stem: &str) -> PathBuf {
        self.requests_dir().join(format!("{}.json", stem))
    }

    pub fn response_path(&self, stem: &str) -> PathBuf {
        self.responses_dir().join(format!("{}.json", stem))
    }

    /// Per-request directory holding the files a request changed
    pub fn artifacts_dir(&self, stem: &str) -> PathBuf {
        self.responses_dir().join(stem)
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [self.requests_dir(), self.responses_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| ProtocolError::io(&dir, e))?;
        }
        Ok(())
    }
}

/// Written by the session runner once it is ready to consume requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyMarker {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub runner_version: String,
}

pub fn request_file_stem(sequence: i64, request_id: &str) -> String {
    format!(
        "{:0width$}_{}",
        sequence,
        request_id,
        width = SEQUENCE_WIDTH
    )
}

pub fn parse_request_sequence(file_name: &str) -> Result<i64> {
    file_name
        .split_once('_')
        .and_then(|(seq, _)| seq.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::InvalidFileName(file_name.to_string()))
}

/// Pending request files in strict arrival order. Temporary files from
/// in-flight atomic writes are skipped.
pub fn pending_requests(requests_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries =
        std::fs::read_dir(requests_dir).map_err(|e| ProtocolError::io(requests_dir, e))?;

    let mut pending: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            !name.starts_with('.') && name.ends_with(".json") && path.is_file()
        })
        .collect();

    pending.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(pending)
}

/// Serialize `value` next to `path` and rename it into place, so readers
/// polling for `path` never observe a partial file.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ProtocolError::InvalidFileName(path.display().to_string()))?;
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, std::process::id()));

    std::fs::write(&tmp, &bytes).map_err(|e| ProtocolError::io(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(ProtocolError::io(path, e));
    }
    Ok(())
}
