// ABOUTME: Output directory fingerprinting used to detect files changed by an execution
// ABOUTME: Compares size and modification time, then stages changed files for the host

use crate::error::Result;
use codebox_protocol::{content_type_for, ArtifactRef};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// Relative path (with `/` separators) to fingerprint for every regular file
/// under `root`. Symlinks are not followed.
pub type Snapshot = BTreeMap<String, Fingerprint>;

pub fn snapshot(root: &Path) -> Result<Snapshot> {
    let mut files = Snapshot::new();
    if root.is_dir() {
        walk(root, root, &mut files)?;
    }
    Ok(files)
}

fn walk(root: &Path, dir: &Path, files: &mut Snapshot) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            walk(root, &path, files)?;
        } else if meta.is_file() {
            files.insert(
                relative_key(root, &path),
                Fingerprint {
                    len: meta.len(),
                    modified: meta.modified().ok(),
                },
            );
        }
    }
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Files that are new in `after` or whose fingerprint changed, in path order.
pub fn changed_files(before: &Snapshot, after: &Snapshot) -> Vec<String> {
    after
        .iter()
        .filter(|(path, fp)| before.get(*path) != Some(*fp))
        .map(|(path, _)| path.clone())
        .collect()
}

pub fn artifact_ref(rel_path: &str) -> ArtifactRef {
    let filename = rel_path.rsplit('/').next().unwrap_or(rel_path).to_string();
    ArtifactRef {
        content_type: content_type_for(&filename).to_string(),
        filename,
        rel_path: rel_path.to_string(),
    }
}

/// Copy each changed file from `output_dir` into `dest`, preserving relative
/// paths. Files that vanish between scan and copy are skipped.
pub fn stage_changed(output_dir: &Path, changed: &[String], dest: &Path) -> Result<Vec<ArtifactRef>> {
    std::fs::create_dir_all(dest)?;
    let mut staged = Vec::with_capacity(changed.len());

    for rel in changed {
        let src = join_relative(output_dir, rel);
        let dst = join_relative(dest, rel);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::copy(&src, &dst) {
            Ok(_) => staged.push(artifact_ref(rel)),
            Err(e) => warn!("Skipping changed file {}: {}", rel, e),
        }
    }

    Ok(staged)
}

fn join_relative(root: &Path, rel: &str) -> PathBuf {
    rel.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// First `figure_{n}.png` name not already present in `dir`.
pub fn next_figure_name(dir: &Path, start: usize) -> (usize, String) {
    let mut n = start.max(1);
    loop {
        let name = format!("figure_{}.png", n);
        if !dir.join(&name).exists() {
            return (n, name);
        }
        n += 1;
    }
}
