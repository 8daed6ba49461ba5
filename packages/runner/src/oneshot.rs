// ABOUTME: One-shot runner: execute a single job and report exactly one terminal event
// ABOUTME: Auto-saves open figures when the code produced no image of its own

use crate::emit::emit;
use crate::error::Result;
use crate::kernel::{Kernel, NamespaceBindings};
use crate::scan::{artifact_ref, changed_files, snapshot};
use codebox_protocol::{is_image, truncate_tail, JobFile, RunnerEvent};
use std::path::PathBuf;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RunnerDirs {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub tail_chars: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self { tail_chars: 8_000 }
    }
}

/// Run `job` once, writing status events and one terminal event to `out`.
/// Returns whether the guest code succeeded.
pub async fn run_job<K, W>(
    job: &JobFile,
    dirs: &RunnerDirs,
    kernel: &mut K,
    out: &mut W,
    options: &RunnerOptions,
) -> Result<bool>
where
    K: Kernel + ?Sized,
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    emit(
        out,
        &RunnerEvent::status(
            "preparing",
            format!("Binding {} input file(s)", job.file_manifest.len()),
        ),
    )
    .await?;

    let bindings = NamespaceBindings {
        input_dir: dirs.input_dir.clone(),
        output_dir: dirs.output_dir.clone(),
        input_files: job.file_manifest.clone(),
    };
    if let Err(e) = kernel.bind(&bindings).await {
        emit(out, &error_event(format!("Failed to prepare namespace: {}", e))).await?;
        return Ok(false);
    }

    let before = snapshot(&dirs.output_dir)?;

    emit(out, &RunnerEvent::status("running", "Executing code")).await?;
    let execution = match kernel.execute(&job.code).await {
        Ok(execution) => execution,
        Err(e) => {
            emit(out, &error_event(e.to_string())).await?;
            return Ok(false);
        }
    };

    let stdout_tail = truncate_tail(&execution.stdout, options.tail_chars);
    let stderr_tail = truncate_tail(&execution.stderr, options.tail_chars);

    if let Some(failure) = execution.failure {
        emit(
            out,
            &RunnerEvent::Error {
                message: failure.message,
                traceback: failure.traceback,
                stdout_tail,
                stderr_tail,
            },
        )
        .await?;
        return Ok(false);
    }

    emit(
        out,
        &RunnerEvent::status("collecting_artifacts", "Scanning output files"),
    )
    .await?;

    let mut changed = changed_files(&before, &snapshot(&dirs.output_dir)?);
    if !changed.iter().any(|rel| is_image(rel)) {
        match kernel.autosave_figures(&dirs.output_dir).await {
            Ok(saved) if !saved.is_empty() => {
                debug!("Auto-saved {} open figure(s)", saved.len());
                changed = changed_files(&before, &snapshot(&dirs.output_dir)?);
            }
            Ok(_) => {}
            Err(e) => warn!("Figure auto-save failed: {}", e),
        }
    }

    emit(
        out,
        &RunnerEvent::Result {
            stdout_tail,
            stderr_tail,
            artifacts: changed.iter().map(|rel| artifact_ref(rel)).collect(),
        },
    )
    .await?;

    Ok(true)
}

fn error_event(message: String) -> RunnerEvent {
    RunnerEvent::Error {
        message,
        traceback: None,
        stdout_tail: String::new(),
        stderr_tail: String::new(),
    }
}
