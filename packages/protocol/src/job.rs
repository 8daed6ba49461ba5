// ABOUTME: Job descriptors handed to the runner: one-shot job files and queued session requests
// ABOUTME: Both carry the code to run and the manifest of staged input files

use crate::manifest::ManifestEntry;
use serde::{Deserialize, Serialize};

/// One-shot job descriptor, mounted read-only into the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFile {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub file_manifest: Vec<ManifestEntry>,
}

/// A queued request for a session runner. The file name carries the sequence
/// too, the field is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFile {
    pub id: String,
    #[serde(default)]
    pub sequence: i64,
    pub code: String,
    #[serde(default)]
    pub file_manifest: Vec<ManifestEntry>,
}
