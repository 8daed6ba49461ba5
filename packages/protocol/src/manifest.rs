// ABOUTME: Input manifest entries mapping external file identities to sandbox-visible names
// ABOUTME: Persisted as a JSON array inside each workspace so allocation survives restarts

use crate::error::{ProtocolError, Result};
use crate::queue::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MANIFEST_FILE_NAME: &str = "input_manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub external_id: String,
    pub original_name: String,
    pub sandbox_name: String,
    pub content_type: String,
    /// Path of the file as seen from inside the container
    pub input_path: String,
}

/// Read a manifest file. A missing file is an empty manifest.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(ProtocolError::io(path, e)),
    }
}

pub fn write_manifest(path: &Path, entries: &[ManifestEntry]) -> Result<()> {
    write_json_atomic(path, &entries)
}
