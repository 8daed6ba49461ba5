// ABOUTME: Execution kernel abstraction shared by the one-shot and session loops
// ABOUTME: A kernel owns one persistent namespace and runs code against it

use crate::error::Result;
use async_trait::async_trait;
use codebox_protocol::ManifestEntry;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Values injected into the namespace before each execution.
#[derive(Debug, Clone, Serialize)]
pub struct NamespaceBindings {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub input_files: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionFailure {
    pub message: String,
    pub traceback: Option<String>,
}

/// Captured outcome of one execution. Guest errors are data, not `Err`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Execution {
    pub stdout: String,
    pub stderr: String,
    pub failure: Option<ExecutionFailure>,
}

impl Execution {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[async_trait]
pub trait Kernel: Send {
    /// Refresh INPUT_DIR, OUTPUT_DIR, INPUT_FILES and helper bindings.
    async fn bind(&mut self, bindings: &NamespaceBindings) -> Result<()>;

    /// Run `code` in the persistent namespace.
    async fn execute(&mut self, code: &str) -> Result<Execution>;

    /// Save plot figures that are still open into `output_dir` and close them.
    /// Returns the file names written.
    async fn autosave_figures(&mut self, output_dir: &Path) -> Result<Vec<String>>;

    async fn shutdown(&mut self) -> Result<()>;
}
