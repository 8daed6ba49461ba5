// ABOUTME: Operator commands: ephemeral runs, session execution, status, reset, sweeping and diagnostics
// ABOUTME: Builds executors from environment settings and reports results through the render module

use crate::render;
use anyhow::{bail, Context, Result};
use codebox_sandbox::{
    ContainerRuntime, DockerRuntime, EphemeralExecutor, IdleSweeper, InputSource,
    SandboxExecutionRequest, SandboxExecutionResult, SandboxInputFile, SandboxSettings,
    SessionExecutor, StatusEventBus,
};
use codebox_storage::SessionStorage;
use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Where the code for a run comes from
#[derive(Debug, Clone, Default)]
pub struct CodeSource {
    pub file: Option<PathBuf>,
    pub inline: Option<String>,
}

/// Options shared by `run` and `exec`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub code: CodeSource,
    pub inputs: Vec<PathBuf>,
    pub save_dir: Option<PathBuf>,
    pub json: bool,
    pub show_events: bool,
}

pub struct App {
    settings: Arc<SandboxSettings>,
    events: StatusEventBus,
}

impl App {
    pub fn from_env() -> Result<Self> {
        let settings = SandboxSettings::from_env();
        settings.validate().context("Invalid sandbox settings")?;
        Ok(Self {
            settings: Arc::new(settings),
            events: StatusEventBus::default(),
        })
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    fn runtime(&self) -> Result<Arc<dyn ContainerRuntime>> {
        let docker = DockerRuntime::new().context("Failed to connect to Docker")?;
        Ok(Arc::new(docker))
    }

    async fn storage(&self) -> Result<SessionStorage> {
        if let Some(parent) = sqlite_parent_dir(&self.settings.database_url) {
            tokio::fs::create_dir_all(&parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let pool = codebox_storage::connect(&self.settings.database_url)
            .await
            .context("Failed to open session database")?;
        Ok(SessionStorage::new(pool))
    }

    async fn session_executor(&self) -> Result<SessionExecutor> {
        Ok(SessionExecutor::new(
            self.runtime()?,
            self.storage().await?,
            self.settings.clone(),
            self.events.clone(),
        ))
    }

    fn follow_events(&self) {
        let mut receiver = self.events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = receiver.recv().await {
                render::print_event(&event);
            }
        });
    }
}

/// Directory holding a `sqlite://` database file, if the URL names one.
pub fn sqlite_parent_dir(database_url: &str) -> Option<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// Code from `--code`, a file, or stdin when neither is given (or the file is `-`).
pub fn read_code(source: &CodeSource) -> Result<String> {
    if let Some(code) = &source.inline {
        return Ok(code.clone());
    }
    match &source.file {
        Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display())),
        _ => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read code from stdin")?;
            Ok(code)
        }
    }
}

/// Describe local files as sandbox inputs. The canonical path is the external id,
/// so passing the same file again in a later `exec` keeps its sandbox name.
pub fn input_files(paths: &[PathBuf]) -> Result<Vec<SandboxInputFile>> {
    paths
        .iter()
        .map(|path| {
            let canonical = path
                .canonicalize()
                .with_context(|| format!("Input file {} not found", path.display()))?;
            if !canonical.is_file() {
                bail!("Input {} is not a regular file", path.display());
            }
            let name = canonical
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "input".to_string());
            Ok(SandboxInputFile::new(
                canonical.to_string_lossy(),
                name,
                InputSource::Path(canonical.clone()),
            ))
        })
        .collect()
}

fn build_request(options: &RunOptions) -> Result<SandboxExecutionRequest> {
    let code = read_code(&options.code)?;
    if code.trim().is_empty() {
        bail!("No code to run");
    }
    let mut request = SandboxExecutionRequest::new(code);
    request.input_files = input_files(&options.inputs)?;
    Ok(request)
}

/// Write every artifact's bytes into `dir`, returning the written paths.
///
/// Artifacts from different output subdirectories can share a basename; later
/// ones get an `NN_` prefix instead of overwriting earlier ones.
pub fn save_artifacts(result: &SandboxExecutionResult, dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let mut written = Vec::with_capacity(result.artifacts.len());
    let mut used = HashSet::new();
    for artifact in &result.artifacts {
        // Names are host-derived basenames; never trust anything else
        let name = Path::new(&artifact.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact".to_string());
        let name = unique_name(&mut used, name);
        let path = dir.join(name);
        std::fs::write(&path, &artifact.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

fn unique_name(used: &mut HashSet<String>, name: String) -> String {
    let mut candidate = name.clone();
    let mut next = 1;
    while used.contains(&candidate) {
        candidate = format!("{:02}_{}", next, name);
        next += 1;
    }
    used.insert(candidate.clone());
    candidate
}

fn report(result: &SandboxExecutionResult, options: &RunOptions) -> Result<()> {
    if options.json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        render::print_result(result);
    }
    if let Some(dir) = &options.save_dir {
        for path in save_artifacts(result, dir)? {
            debug!("Saved artifact {}", path.display());
            if !options.json {
                render::print_saved(&path);
            }
        }
    }
    if !result.is_success() {
        bail!("Execution {}", result.status);
    }
    Ok(())
}

pub async fn run_command(app: &App, options: &RunOptions) -> Result<()> {
    let request = build_request(options)?;
    let executor = EphemeralExecutor::new(app.runtime()?, app.settings.clone(), app.events.clone());
    if options.show_events {
        app.follow_events();
    }
    let result = executor.execute(&request).await;
    report(&result, options)
}

pub async fn exec_command(app: &App, conversation_id: &str, options: &RunOptions) -> Result<()> {
    let request = build_request(options)?;
    let executor = app.session_executor().await?;
    if options.show_events {
        app.follow_events();
    }
    let result = executor.execute(conversation_id, &request).await;
    report(&result, options)
}

pub async fn status_command(app: &App, conversation_id: &str, json: bool) -> Result<()> {
    let executor = app.session_executor().await?;
    let status = executor.status(conversation_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        render::print_status(conversation_id, &status);
    }
    Ok(())
}

pub async fn reset_command(app: &App, conversation_id: &str) -> Result<()> {
    let executor = app.session_executor().await?;
    let removed = executor.reset(conversation_id).await?;
    render::print_reset(conversation_id, removed);
    Ok(())
}

pub async fn sweep_command(app: &App, watch: bool, json: bool) -> Result<()> {
    let sweeper = IdleSweeper::new(app.runtime()?, app.storage().await?, app.settings.clone());

    if watch {
        info!(
            "Sweeping every {}s, press Ctrl+C to stop",
            app.settings.sweep_interval_secs
        );
        sweeper.start().await;
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        sweeper.stop().await;
        return Ok(());
    }

    let report = sweeper.sweep_once().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        render::print_sweep(&report);
    }
    Ok(())
}

pub async fn doctor_command(app: &App) -> Result<()> {
    let available = match DockerRuntime::new() {
        Ok(docker) => docker.is_available().await.unwrap_or(false),
        Err(e) => {
            debug!("Docker client unavailable: {}", e);
            false
        }
    };
    let database = app.storage().await.map(|_| ()).map_err(|e| format!("{:#}", e));

    render::print_doctor(app.settings(), available, &database);
    if !available {
        bail!("Container runtime is not reachable");
    }
    if let Err(e) = database {
        bail!("Session database is not usable: {}", e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codebox_sandbox::SandboxArtifact;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("sqlite:///var/lib/codebox/codebox.db", Some("/var/lib/codebox"))]
    #[case("sqlite://data/codebox.db?mode=rwc", Some("data"))]
    #[case("sqlite:codebox.db", None)]
    #[case("sqlite::memory:", None)]
    #[case("postgres://localhost/codebox", None)]
    fn test_sqlite_parent_dir(#[case] url: &str, #[case] expected: Option<&str>) {
        assert_eq!(sqlite_parent_dir(url), expected.map(PathBuf::from));
    }

    #[test]
    fn test_inline_code_wins() {
        let source = CodeSource {
            file: Some(PathBuf::from("/does/not/exist.py")),
            inline: Some("print(1)".to_string()),
        };
        assert_eq!(read_code(&source).unwrap(), "print(1)");
    }

    #[test]
    fn test_code_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.py");
        std::fs::write(&path, "x = 1\n").unwrap();

        let source = CodeSource {
            file: Some(path),
            inline: None,
        };
        assert_eq!(read_code(&source).unwrap(), "x = 1\n");
    }

    #[test]
    fn test_input_files_use_canonical_path_as_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("campaign.csv");
        std::fs::write(&path, "a,b\n").unwrap();

        let files = input_files(&[path.clone()]).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].display_name, "campaign.csv");
        assert_eq!(
            files[0].external_id,
            path.canonicalize().unwrap().to_string_lossy()
        );
    }

    #[test]
    fn test_missing_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = input_files(&[dir.path().join("nope.csv")]).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_directory_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(input_files(&[dir.path().to_path_buf()]).is_err());
    }

    #[test]
    fn test_save_artifacts_writes_basenames() {
        let dir = tempfile::tempdir().unwrap();
        let mut result = SandboxExecutionResult::succeeded("run-1", "ok");
        result.artifacts = vec![SandboxArtifact {
            filename: "chart.png".to_string(),
            content_type: "image/png".to_string(),
            size: 3,
            bytes: vec![1, 2, 3],
        }];

        let written = save_artifacts(&result, &dir.path().join("out")).unwrap();
        assert_eq!(written, vec![dir.path().join("out/chart.png")]);
        assert_eq!(std::fs::read(&written[0]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_save_artifacts_keeps_colliding_basenames() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = |filename: &str, bytes: &[u8]| SandboxArtifact {
            filename: filename.to_string(),
            content_type: "text/csv".to_string(),
            size: bytes.len() as u64,
            bytes: bytes.to_vec(),
        };
        let mut result = SandboxExecutionResult::succeeded("run-1", "ok");
        result.artifacts = vec![
            artifact("x.csv", b"a"),
            artifact("x.csv", b"b"),
            artifact("x.csv", b"c"),
        ];

        let written = save_artifacts(&result, dir.path()).unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("x.csv"),
                dir.path().join("01_x.csv"),
                dir.path().join("02_x.csv"),
            ]
        );
        assert_eq!(std::fs::read(dir.path().join("x.csv")).unwrap(), b"a");
        assert_eq!(std::fs::read(dir.path().join("02_x.csv")).unwrap(), b"c");
    }
}
