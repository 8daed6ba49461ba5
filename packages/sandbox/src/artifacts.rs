// ABOUTME: Validation and loading of guest-declared artifacts from an output root
// ABOUTME: Rejects traversal, symlink escapes, missing files, oversize files and too many artifacts

use crate::types::SandboxArtifact;
use codebox_protocol::{content_type_for, ArtifactRef};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("{0} resolves outside the output directory")]
    PathEscape(String),

    #[error("{0} does not exist or is not a regular file")]
    Missing(String),

    #[error("{name} is {size} bytes, limit is {max}")]
    TooLarge { name: String, size: u64, max: u64 },

    #[error("{count} artifacts produced, limit is {max}")]
    TooMany { count: usize, max: usize },

    #[error("output root {path} is unavailable: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ArtifactLimits {
    pub max_count: usize,
    pub max_bytes: u64,
}

/// Resolve `rel` under the canonical `root`, refusing anything that lands outside it.
async fn resolve_contained(root: &Path, rel: &str) -> Result<PathBuf, ArtifactError> {
    let rel_path = Path::new(rel);
    let plain = !rel.is_empty()
        && rel_path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !plain {
        return Err(ArtifactError::PathEscape(rel.to_string()));
    }

    let resolved = tokio::fs::canonicalize(root.join(rel_path))
        .await
        .map_err(|_| ArtifactError::Missing(rel.to_string()))?;
    if !resolved.starts_with(root) {
        return Err(ArtifactError::PathEscape(rel.to_string()));
    }
    Ok(resolved)
}

/// Validate every declared artifact and read its bytes.
///
/// The whole batch fails on the first violation. Filenames and content types
/// are derived from the resolved path, not from what the guest declared.
pub async fn load_artifacts(
    root: &Path,
    refs: &[ArtifactRef],
    limits: ArtifactLimits,
) -> Result<Vec<SandboxArtifact>, ArtifactError> {
    if refs.len() > limits.max_count {
        return Err(ArtifactError::TooMany {
            count: refs.len(),
            max: limits.max_count,
        });
    }
    if refs.is_empty() {
        return Ok(Vec::new());
    }

    let root = tokio::fs::canonicalize(root)
        .await
        .map_err(|source| ArtifactError::Root {
            path: root.to_path_buf(),
            source,
        })?;

    let mut artifacts = Vec::with_capacity(refs.len());
    for artifact in refs {
        let path = resolve_contained(&root, &artifact.rel_path).await?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| ArtifactError::Missing(artifact.rel_path.clone()))?;
        if !meta.is_file() {
            return Err(ArtifactError::Missing(artifact.rel_path.clone()));
        }
        if meta.len() > limits.max_bytes {
            return Err(ArtifactError::TooLarge {
                name: artifact.rel_path.clone(),
                size: meta.len(),
                max: limits.max_bytes,
            });
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| ArtifactError::Read {
                name: artifact.rel_path.clone(),
                source,
            })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact.filename.clone());

        debug!("Loaded artifact {} ({} bytes)", artifact.rel_path, bytes.len());
        artifacts.push(SandboxArtifact {
            content_type: content_type_for(&filename).to_string(),
            filename,
            size: bytes.len() as u64,
            bytes,
        });
    }
    Ok(artifacts)
}
