// ABOUTME: Session runner loop consuming queued requests in strict sequence order
// ABOUTME: Keeps one namespace alive across requests and stages per-request changed files

use crate::error::Result;
use crate::kernel::{Execution, Kernel, NamespaceBindings};
use crate::oneshot::RunnerDirs;
use crate::scan::{changed_files, snapshot, stage_changed, Snapshot};
use codebox_protocol::{
    is_image, pending_requests, truncate_tail, write_json_atomic, IpcLayout, ReadyMarker,
    RequestFile, ResponseFile, ResponseStatus,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SessionRunnerOptions {
    pub poll_interval: Duration,
    pub tail_chars: usize,
}

impl Default for SessionRunnerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            tail_chars: 8_000,
        }
    }
}

/// Serve requests from `layout` until its root directory disappears.
pub async fn serve<K>(
    layout: &IpcLayout,
    dirs: &RunnerDirs,
    kernel: &mut K,
    options: &SessionRunnerOptions,
) -> Result<()>
where
    K: Kernel + ?Sized,
{
    layout.create_dirs()?;
    write_json_atomic(
        &layout.ready_path(),
        &ReadyMarker {
            pid: std::process::id(),
            started_at: chrono::Utc::now(),
            runner_version: env!("CARGO_PKG_VERSION").to_string(),
        },
    )?;
    info!("Session runner ready at {}", layout.root().display());

    let mut fingerprints = snapshot(&dirs.output_dir)?;

    loop {
        if !layout.root().exists() {
            info!("IPC directory removed, shutting down session runner");
            break;
        }

        let next = match pending_requests(&layout.requests_dir()) {
            Ok(pending) => pending.into_iter().next(),
            Err(e) => {
                warn!("Failed to list pending requests: {}", e);
                None
            }
        };

        let Some(request_path) = next else {
            tokio::time::sleep(options.poll_interval).await;
            continue;
        };

        match handle_request(layout, dirs, kernel, options, &request_path, &fingerprints).await {
            Ok(updated) => fingerprints = updated,
            Err(e) => {
                warn!("Failed to handle {}: {}", request_path.display(), e);
                if let Err(e) = answer_failure(layout, options, &request_path, &e.to_string()) {
                    warn!("Failed to answer {}: {}", request_path.display(), e);
                }
                // Never spin on a request that cannot be answered
                let _ = std::fs::remove_file(&request_path);
                // The guest may have written files before the failure
                if let Ok(current) = snapshot(&dirs.output_dir) {
                    fingerprints = current;
                }
            }
        }
    }

    kernel.shutdown().await
}

async fn handle_request<K>(
    layout: &IpcLayout,
    dirs: &RunnerDirs,
    kernel: &mut K,
    options: &SessionRunnerOptions,
    request_path: &Path,
    before: &Snapshot,
) -> Result<Snapshot>
where
    K: Kernel + ?Sized,
{
    let stem = request_stem(request_path);
    debug!("Handling request {}", stem);

    let request: RequestFile = match std::fs::read(request_path)
        .map_err(crate::RunnerError::from)
        .and_then(|bytes| serde_json::from_slice(&bytes).map_err(crate::RunnerError::from))
    {
        Ok(request) => request,
        Err(e) => {
            let response = failed_response(format!("Malformed request: {}", e), Execution::default(), options);
            write_json_atomic(&layout.response_path(&stem), &response)?;
            std::fs::remove_file(request_path)?;
            return Ok(before.clone());
        }
    };

    let bindings = NamespaceBindings {
        input_dir: dirs.input_dir.clone(),
        output_dir: dirs.output_dir.clone(),
        input_files: request.file_manifest.clone(),
    };

    let execution = match kernel.bind(&bindings).await {
        Ok(()) => kernel.execute(&request.code).await,
        Err(e) => Err(e),
    };

    let mut after = snapshot(&dirs.output_dir)?;
    let mut changed = changed_files(before, &after);

    if matches!(&execution, Ok(exec) if exec.succeeded())
        && !changed.iter().any(|rel| is_image(rel))
    {
        match kernel.autosave_figures(&dirs.output_dir).await {
            Ok(saved) if !saved.is_empty() => {
                after = snapshot(&dirs.output_dir)?;
                changed = changed_files(before, &after);
            }
            Ok(_) => {}
            Err(e) => warn!("Figure auto-save failed: {}", e),
        }
    }

    let artifacts = stage_changed(&dirs.output_dir, &changed, &layout.artifacts_dir(&stem))?;

    let response = match execution {
        Ok(exec) if exec.succeeded() => ResponseFile {
            status: ResponseStatus::Succeeded,
            summary: format!(
                "Execution succeeded with {} changed file(s)",
                artifacts.len()
            ),
            stdout_tail: truncate_tail(&exec.stdout, options.tail_chars),
            stderr_tail: truncate_tail(&exec.stderr, options.tail_chars),
            artifacts,
            error_message: None,
        },
        Ok(exec) => {
            let mut response = failed_response(String::new(), exec.clone(), options);
            if let Some(failure) = exec.failure {
                response.error_message = Some(match failure.traceback {
                    Some(tb) => format!("{}\n{}", failure.message, tb),
                    None => failure.message,
                });
            }
            response.artifacts = artifacts;
            response
        }
        Err(e) => {
            let mut response = failed_response(e.to_string(), Execution::default(), options);
            response.artifacts = artifacts;
            response
        }
    };

    write_json_atomic(&layout.response_path(&stem), &response)?;
    std::fs::remove_file(request_path)?;
    debug!("Answered request {} ({:?})", stem, response.status);

    Ok(after)
}

/// Write a `failed` response for a request whose handling broke down.
fn answer_failure(
    layout: &IpcLayout,
    options: &SessionRunnerOptions,
    request_path: &Path,
    message: &str,
) -> Result<()> {
    let stem = request_stem(request_path);
    let response = failed_response(
        format!("Runner failed to complete the request: {}", message),
        Execution::default(),
        options,
    );
    write_json_atomic(&layout.response_path(&stem), &response)?;
    Ok(())
}

fn request_stem(request_path: &Path) -> String {
    request_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

fn failed_response(message: String, exec: Execution, options: &SessionRunnerOptions) -> ResponseFile {
    ResponseFile {
        status: ResponseStatus::Failed,
        summary: "Execution failed".to_string(),
        stdout_tail: truncate_tail(&exec.stdout, options.tail_chars),
        stderr_tail: truncate_tail(&exec.stderr, options.tail_chars),
        artifacts: Vec::new(),
        error_message: if message.is_empty() { None } else { Some(message) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptKernel;
    use codebox_protocol::request_file_stem;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _root: tempfile::TempDir,
        layout: IpcLayout,
        dirs: RunnerDirs,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let layout = IpcLayout::new(root.path().join("ipc"));
        layout.create_dirs().unwrap();
        let dirs = RunnerDirs {
            input_dir: root.path().join("input"),
            output_dir: root.path().join("output"),
        };
        std::fs::create_dir_all(&dirs.input_dir).unwrap();
        std::fs::create_dir_all(&dirs.output_dir).unwrap();
        Fixture {
            _root: root,
            layout,
            dirs,
        }
    }

    fn enqueue(layout: &IpcLayout, seq: i64, code: &str) -> String {
        let id = format!("req-{}", seq);
        let stem = request_file_stem(seq, &id);
        write_json_atomic(
            &layout.request_path(&stem),
            &RequestFile {
                id,
                sequence: seq,
                code: code.to_string(),
                file_manifest: vec![],
            },
        )
        .unwrap();
        stem
    }

    async fn answer_one(f: &Fixture, kernel: &mut ScriptKernel, before: &Snapshot) -> Snapshot {
        let next = pending_requests(&f.layout.requests_dir())
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        handle_request(
            &f.layout,
            &f.dirs,
            kernel,
            &SessionRunnerOptions::default(),
            &next,
            before,
        )
        .await
        .unwrap()
    }

    fn read_response(layout: &IpcLayout, stem: &str) -> ResponseFile {
        serde_json::from_slice(&std::fs::read(layout.response_path(stem)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_namespace_persists_between_requests() {
        let f = fixture();
        let mut kernel = ScriptKernel::new();
        let first = enqueue(&f.layout, 1, "x = 41");
        let second = enqueue(&f.layout, 2, "print(x + 1)");

        let snap = answer_one(&f, &mut kernel, &Snapshot::new()).await;
        answer_one(&f, &mut kernel, &snap).await;

        assert_eq!(read_response(&f.layout, &first).status, ResponseStatus::Succeeded);
        let response = read_response(&f.layout, &second);
        assert_eq!(response.stdout_tail, "42\n");
        assert!(pending_requests(&f.layout.requests_dir()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_changed_files_are_staged() {
        let f = fixture();
        let mut kernel = ScriptKernel::new();
        let first = enqueue(&f.layout, 1, "write(\"shared.txt\", \"first\")\nwrite(\"keep.txt\", \"k\")");
        let second = enqueue(&f.layout, 2, "write(\"shared.txt\", \"second value\")");

        let snap = answer_one(&f, &mut kernel, &Snapshot::new()).await;
        answer_one(&f, &mut kernel, &snap).await;

        let first_response = read_response(&f.layout, &first);
        assert_eq!(first_response.artifacts.len(), 2);
        let second_response = read_response(&f.layout, &second);
        assert_eq!(second_response.artifacts.len(), 1);
        assert_eq!(second_response.artifacts[0].rel_path, "shared.txt");

        let staged_first =
            std::fs::read_to_string(f.layout.artifacts_dir(&first).join("shared.txt")).unwrap();
        let staged_second =
            std::fs::read_to_string(f.layout.artifacts_dir(&second).join("shared.txt")).unwrap();
        assert_eq!(staged_first, "first");
        assert_eq!(staged_second, "second value");
    }

    #[tokio::test]
    async fn test_failure_is_reported_in_response() {
        let f = fixture();
        let mut kernel = ScriptKernel::new();
        let stem = enqueue(&f.layout, 1, "print(missing)");

        answer_one(&f, &mut kernel, &Snapshot::new()).await;

        let response = read_response(&f.layout, &stem);
        assert_eq!(response.status, ResponseStatus::Failed);
        assert!(response
            .error_message
            .unwrap()
            .starts_with("NameError: name 'missing' is not defined"));
    }

    #[tokio::test]
    async fn test_malformed_request_gets_failed_response() {
        let f = fixture();
        let mut kernel = ScriptKernel::new();
        let stem = request_file_stem(1, "broken");
        std::fs::write(f.layout.request_path(&stem), "{not json").unwrap();

        answer_one(&f, &mut kernel, &Snapshot::new()).await;

        let response = read_response(&f.layout, &stem);
        assert_eq!(response.status, ResponseStatus::Failed);
        assert!(response.error_message.unwrap().starts_with("Malformed request"));
    }

    #[tokio::test]
    async fn test_request_that_cannot_be_staged_still_gets_failed_response() {
        let f = fixture();
        let stem = enqueue(&f.layout, 1, "write(\"table.csv\", \"a,b\")");
        // A regular file where the artifacts directory belongs breaks staging
        std::fs::write(f.layout.artifacts_dir(&stem), "in the way").unwrap();

        let layout = f.layout.clone();
        let dirs = f.dirs.clone();
        let handle = tokio::spawn(async move {
            let mut kernel = ScriptKernel::new();
            let options = SessionRunnerOptions {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            };
            serve(&layout, &dirs, &mut kernel, &options).await
        });

        let response_path = f.layout.response_path(&stem);
        for _ in 0..200 {
            if response_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let response = read_response(&f.layout, &stem);
        assert_eq!(response.status, ResponseStatus::Failed);
        assert!(response.artifacts.is_empty());
        assert!(response
            .error_message
            .unwrap()
            .starts_with("Runner failed to complete the request"));
        assert!(!f.layout.request_path(&stem).exists());

        std::fs::remove_dir_all(f.layout.root()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("runner did not stop");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_serve_exits_when_ipc_root_removed() {
        let f = fixture();
        let layout = f.layout.clone();
        let dirs = f.dirs.clone();

        let handle = tokio::spawn(async move {
            let mut kernel = ScriptKernel::new();
            let options = SessionRunnerOptions {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            };
            serve(&layout, &dirs, &mut kernel, &options).await
        });

        for _ in 0..100 {
            if f.layout.ready_path().exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.layout.ready_path().exists());

        std::fs::remove_dir_all(f.layout.root()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("runner did not stop");
        assert!(result.unwrap().is_ok());
    }
}
