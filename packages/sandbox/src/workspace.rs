// ABOUTME: Sandbox filename allocation and the per-workspace input manifest
// ABOUTME: Names are sanitized, stable per external id, and collision-prefixed using only the manifest

use crate::error::Result;
use crate::files::InputMaterializer;
use crate::types::{SandboxInputFile, SandboxInputFileMapping};
use codebox_protocol::{content_type_for, read_manifest, write_manifest, ManifestEntry};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MAX_NAME_BYTES: usize = 180;

/// Replace path separators and control characters. Spaces and non-ASCII survive.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    // Leading dots would produce hidden files or `..`
    let cleaned = replaced.trim().trim_start_matches('.').trim_start();
    if cleaned.is_empty() {
        return "file".to_string();
    }
    clamp_length(cleaned)
}

fn clamp_length(name: &str) -> String {
    if name.len() <= MAX_NAME_BYTES {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(pos) if name.len() - pos <= 16 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    };
    let mut cut = MAX_NAME_BYTES.saturating_sub(ext.len()).min(stem.len());
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &stem[..cut], ext)
}

/// Pick a free sandbox name for `desired`, prefixing `NN_` on collision.
///
/// The next index is one past the highest `NN_desired` already in the
/// manifest, so allocation is reproducible from the manifest file alone.
pub fn allocate_name(entries: &[ManifestEntry], desired: &str) -> String {
    let taken = |name: &str| entries.iter().any(|e| e.sandbox_name == name);
    if !taken(desired) {
        return desired.to_string();
    }

    let mut next = entries
        .iter()
        .filter_map(|e| collision_index(&e.sandbox_name, desired))
        .max()
        .map_or(1, |n| n + 1);
    loop {
        let candidate = format!("{:02}_{}", next, desired);
        if !taken(&candidate) {
            return candidate;
        }
        next += 1;
    }
}

fn collision_index(name: &str, desired: &str) -> Option<u32> {
    let (prefix, rest) = name.split_once('_')?;
    if rest != desired || prefix.len() < 2 || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

/// Name used for the `index`th input of a one-shot run.
pub fn indexed_name(index: usize, display_name: &str) -> String {
    format!("{:02}_{}", index + 1, sanitize_filename(display_name))
}

fn entry_for(file: &SandboxInputFile, sandbox_name: String, container_input_dir: &str) -> ManifestEntry {
    ManifestEntry {
        external_id: file.external_id.clone(),
        original_name: file.display_name.clone(),
        content_type: file
            .content_type
            .clone()
            .unwrap_or_else(|| content_type_for(&sandbox_name).to_string()),
        input_path: format!("{}/{}", container_input_dir.trim_end_matches('/'), sandbox_name),
        sandbox_name,
    }
}

/// Copy a one-shot run's inputs into `input_dir` under index-prefixed names.
pub async fn stage_oneshot_inputs(
    files: &[SandboxInputFile],
    input_dir: &Path,
    container_input_dir: &str,
    materializer: &InputMaterializer,
) -> Result<Vec<ManifestEntry>> {
    let mut entries = Vec::with_capacity(files.len());
    for (index, file) in files.iter().enumerate() {
        let name = indexed_name(index, &file.display_name);
        materializer
            .materialize(&file.display_name, &file.source, &input_dir.join(&name))
            .await?;
        entries.push(entry_for(file, name, container_input_dir));
    }
    Ok(entries)
}

/// Inputs visible to a request: the full manifest plus the mappings for the files it asked for.
#[derive(Debug, Clone, Default)]
pub struct SyncedInputs {
    pub manifest: Vec<ManifestEntry>,
    pub requested: Vec<SandboxInputFileMapping>,
}

/// Durable input directory of a persistent session and its manifest.
#[derive(Debug, Clone)]
pub struct InputWorkspace {
    input_dir: PathBuf,
    manifest_path: PathBuf,
    container_input_dir: String,
}

impl InputWorkspace {
    pub fn new(
        input_dir: impl Into<PathBuf>,
        manifest_path: impl Into<PathBuf>,
        container_input_dir: impl Into<String>,
    ) -> Self {
        Self {
            input_dir: input_dir.into(),
            manifest_path: manifest_path.into(),
            container_input_dir: container_input_dir.into(),
        }
    }

    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    pub fn entries(&self) -> Result<Vec<ManifestEntry>> {
        Ok(read_manifest(&self.manifest_path)?)
    }

    /// Bring `files` into the input directory.
    ///
    /// An external id seen before keeps its sandbox name; its bytes are only
    /// copied again if the file has gone missing from disk.
    pub async fn sync(
        &self,
        files: &[SandboxInputFile],
        materializer: &InputMaterializer,
    ) -> Result<SyncedInputs> {
        let mut entries = self.entries()?;
        let mut requested = Vec::with_capacity(files.len());
        let mut changed = false;

        for file in files {
            if let Some(existing) = entries.iter().find(|e| e.external_id == file.external_id) {
                let host_path = self.input_dir.join(&existing.sandbox_name);
                if !host_path.exists() {
                    debug!("Restoring missing input {}", existing.sandbox_name);
                    materializer
                        .materialize(&file.display_name, &file.source, &host_path)
                        .await?;
                }
                requested.push(SandboxInputFileMapping::from(existing));
                continue;
            }

            let name = allocate_name(&entries, &sanitize_filename(&file.display_name));
            materializer
                .materialize(&file.display_name, &file.source, &self.input_dir.join(&name))
                .await?;
            info!("Allocated sandbox name {} for input {}", name, file.external_id);

            let entry = entry_for(file, name, &self.container_input_dir);
            requested.push(SandboxInputFileMapping::from(&entry));
            entries.push(entry);
            changed = true;
        }

        if changed {
            write_manifest(&self.manifest_path, &entries)?;
        }

        Ok(SyncedInputs {
            manifest: entries,
            requested,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InputSource;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn entry(name: &str) -> ManifestEntry {
        ManifestEntry {
            external_id: format!("id-{}", name),
            original_name: name.to_string(),
            sandbox_name: name.to_string(),
            content_type: "text/csv".to_string(),
            input_path: format!("/workspace/input/{}", name),
        }
    }

    #[rstest]
    #[case("report.csv", "report.csv")]
    #[case("Q3 results (final).xlsx", "Q3 results (final).xlsx")]
    #[case("données été.csv", "données été.csv")]
    #[case("../../etc/passwd", "_.._etc_passwd")]
    #[case("a\\b/c.txt", "a_b_c.txt")]
    #[case("tab\there.txt", "tab_here.txt")]
    #[case("..", "file")]
    #[case("   ", "file")]
    #[case(".hidden", "hidden")]
    fn test_sanitize_filename(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_filename(input), expected);
    }

    #[test]
    fn test_sanitize_clamps_long_names_keeping_extension() {
        let long = format!("{}.csv", "é".repeat(200));
        let name = sanitize_filename(&long);
        assert!(name.len() <= MAX_NAME_BYTES);
        assert!(name.ends_with(".csv"));
    }

    #[test]
    fn test_allocate_name_collisions() {
        let mut entries = vec![];
        assert_eq!(allocate_name(&entries, "campaign.csv"), "campaign.csv");

        entries.push(entry("campaign.csv"));
        assert_eq!(allocate_name(&entries, "campaign.csv"), "01_campaign.csv");

        entries.push(entry("01_campaign.csv"));
        assert_eq!(allocate_name(&entries, "campaign.csv"), "02_campaign.csv");
    }

    #[test]
    fn test_allocate_name_continues_past_highest_prefix() {
        let entries = vec![entry("campaign.csv"), entry("07_campaign.csv"), entry("03_other.csv")];
        assert_eq!(allocate_name(&entries, "campaign.csv"), "08_campaign.csv");
    }

    #[test]
    fn test_indexed_name() {
        assert_eq!(indexed_name(0, "data.csv"), "01_data.csv");
        assert_eq!(indexed_name(11, "a/b.csv"), "12_a_b.csv");
    }

    #[tokio::test]
    async fn test_sync_is_idempotent_per_external_id() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = InputWorkspace::new(
            dir.path(),
            dir.path().join("input_manifest.json"),
            "/workspace/input",
        );
        let materializer = InputMaterializer::new(None, 1024);

        let first = SandboxInputFile::new("att-1", "campaign.csv", InputSource::Inline(b"a".to_vec()));
        let second = SandboxInputFile::new("att-2", "campaign.csv", InputSource::Inline(b"b".to_vec()));

        let synced = workspace.sync(&[first.clone()], &materializer).await.unwrap();
        assert_eq!(synced.requested[0].sandbox_name, "campaign.csv");
        assert_eq!(synced.requested[0].container_path, "/workspace/input/campaign.csv");

        let synced = workspace.sync(&[second, first], &materializer).await.unwrap();
        let names: Vec<_> = synced.requested.iter().map(|m| m.sandbox_name.as_str()).collect();
        assert_eq!(names, vec!["01_campaign.csv", "campaign.csv"]);
        assert_eq!(synced.manifest.len(), 2);

        // Reloaded from disk alone
        let reloaded = workspace.entries().unwrap();
        assert_eq!(reloaded, synced.manifest);
        assert_eq!(std::fs::read(dir.path().join("01_campaign.csv")).unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_stage_oneshot_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let materializer = InputMaterializer::new(None, 1024);
        let files = vec![
            SandboxInputFile::new("a", "data.csv", InputSource::Inline(b"1".to_vec())),
            SandboxInputFile::new("b", "data.csv", InputSource::Inline(b"2".to_vec()))
                .with_content_type("text/plain"),
        ];
        let entries = stage_oneshot_inputs(&files, dir.path(), "/sandbox/input", &materializer)
            .await
            .unwrap();
        assert_eq!(entries[0].sandbox_name, "01_data.csv");
        assert_eq!(entries[0].content_type, "text/csv");
        assert_eq!(entries[1].input_path, "/sandbox/input/02_data.csv");
        assert_eq!(entries[1].content_type, "text/plain");
    }
}
