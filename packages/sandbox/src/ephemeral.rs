// ABOUTME: One-shot executor: a fresh hardened container per call, torn down afterwards
// ABOUTME: Drains the runner's NDJSON stdout, enforces the timeout and validates declared artifacts

use crate::artifacts::{load_artifacts, ArtifactLimits};
use crate::error::Result;
use crate::events::{stages, StatusEventBus};
use crate::files::{FileStore, InputMaterializer};
use crate::output::{trim_traceback, LineSplitter};
use crate::providers::{
    name_fragment, ContainerRuntime, ContainerSpec, Mount, OutputChunk, StreamType, KIND_EPHEMERAL,
    LABEL_HOST, LABEL_KIND, LABEL_RUN_ID,
};
use crate::settings::SandboxSettings;
use crate::types::{SandboxExecutionRequest, SandboxExecutionResult, SandboxInputFileMapping};
use crate::workspace::stage_oneshot_inputs;
use codebox_protocol::{truncate_tail, write_json_atomic, JobFile, RunnerEvent, TailBuffer};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub const SANDBOX_INPUT_DIR: &str = "/sandbox/input";
pub const SANDBOX_OUTPUT_DIR: &str = "/sandbox/output";
pub const SANDBOX_JOB_DIR: &str = "/sandbox/job";
pub const JOB_FILE_NAME: &str = "job.json";

/// Prefix of per-run working directories under the ephemeral root
pub const RUN_DIR_PREFIX: &str = "codebox-run-";

const MAX_PROTOCOL_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Stdout/stderr of one container, split into protocol events and stray output
struct OutputDrain {
    lines: LineSplitter,
    stray_stdout: TailBuffer,
    stderr: TailBuffer,
    terminal: Option<RunnerEvent>,
}

impl OutputDrain {
    fn new(tail_chars: usize) -> Self {
        Self {
            lines: LineSplitter::new(MAX_PROTOCOL_LINE_BYTES),
            stray_stdout: TailBuffer::new(tail_chars),
            stderr: TailBuffer::new(tail_chars),
            terminal: None,
        }
    }

    fn accept(&mut self, chunk: OutputChunk, run_id: &str, events: &StatusEventBus) {
        match chunk.stream {
            StreamType::Stdout => {
                for line in self.lines.push(&chunk.data) {
                    self.on_line(&line, run_id, events);
                }
            }
            StreamType::Stderr => self.stderr.push(&String::from_utf8_lossy(&chunk.data)),
        }
    }

    fn on_line(&mut self, line: &str, run_id: &str, events: &StatusEventBus) {
        if line.trim().is_empty() {
            return;
        }
        match RunnerEvent::from_line(line) {
            Ok(RunnerEvent::Status { stage, message }) => events.publish(run_id, &stage, message),
            Ok(event) => {
                if self.terminal.is_none() {
                    self.terminal = Some(event);
                } else {
                    warn!(run_id, "Ignoring additional terminal event from runner");
                }
            }
            Err(_) => {
                self.stray_stdout.push(line);
                self.stray_stdout.push("\n");
            }
        }
    }

    fn finish(&mut self, run_id: &str, events: &StatusEventBus) {
        if let Some(rest) = self.lines.finish() {
            self.on_line(&rest, run_id, events);
        }
    }
}

struct RunOutcome {
    drain: OutputDrain,
    exit_code: Option<i64>,
    timed_out: bool,
}

pub struct EphemeralExecutor {
    runtime: Arc<dyn ContainerRuntime>,
    settings: Arc<SandboxSettings>,
    events: StatusEventBus,
    materializer: InputMaterializer,
}

impl EphemeralExecutor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        settings: Arc<SandboxSettings>,
        events: StatusEventBus,
    ) -> Self {
        let materializer = InputMaterializer::new(None, settings.max_input_bytes);
        Self {
            runtime,
            settings,
            events,
            materializer,
        }
    }

    pub fn with_file_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.materializer = InputMaterializer::new(Some(store), self.settings.max_input_bytes);
        self
    }

    pub fn events(&self) -> &StatusEventBus {
        &self.events
    }

    /// Run `request` in a fresh container. Never fails: every host-side error
    /// becomes a `failed` result.
    pub async fn execute(&self, request: &SandboxExecutionRequest) -> SandboxExecutionResult {
        let started = Instant::now();
        let run_id = request.run_id.as_str();
        info!(run_id, "Starting ephemeral execution");

        let mut result = if request.code.chars().count() > self.settings.max_code_chars {
            SandboxExecutionResult::failed(
                run_id,
                format!("Code exceeds the {} character limit", self.settings.max_code_chars),
            )
        } else {
            self.run(request).await
        };

        result.duration_ms = started.elapsed().as_millis() as u64;
        let stage = match result.status {
            crate::types::ExecutionStatus::Succeeded => stages::COMPLETED,
            crate::types::ExecutionStatus::Failed => stages::FAILED,
            crate::types::ExecutionStatus::Timeout => stages::TIMEOUT,
        };
        self.events.publish(run_id, stage, result.summary.clone());
        info!(run_id, status = %result.status, duration_ms = result.duration_ms, "Ephemeral execution finished");
        result
    }

    async fn run(&self, request: &SandboxExecutionRequest) -> SandboxExecutionResult {
        let run_id = request.run_id.as_str();
        self.events.publish(run_id, stages::PREPARING, "Preparing workspace");

        if let Err(e) = tokio::fs::create_dir_all(&self.settings.ephemeral_root).await {
            return SandboxExecutionResult::failed(
                run_id,
                format!("Failed to create sandbox root: {}", e),
            );
        }
        let workdir = match tempfile::Builder::new()
            .prefix(RUN_DIR_PREFIX)
            .tempdir_in(&self.settings.ephemeral_root)
        {
            Ok(dir) => dir,
            Err(e) => {
                return SandboxExecutionResult::failed(
                    run_id,
                    format!("Failed to create sandbox workspace: {}", e),
                )
            }
        };

        let outcome = self.run_in(request, workdir.path()).await;

        let path = workdir.path().to_path_buf();
        if let Err(e) = workdir.close() {
            warn!(run_id, "Failed to remove workspace {}: {}", path.display(), e);
        }

        match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(run_id, "Ephemeral execution failed: {}", e);
                SandboxExecutionResult::failed(run_id, format!("Sandbox setup failed: {}", e))
            }
        }
    }

    async fn run_in(
        &self,
        request: &SandboxExecutionRequest,
        root: &Path,
    ) -> Result<SandboxExecutionResult> {
        let run_id = request.run_id.as_str();
        let input_dir = root.join("input");
        let output_dir = root.join("output");
        let job_dir = root.join("job");
        for dir in [&input_dir, &output_dir, &job_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }

        let manifest = stage_oneshot_inputs(
            &request.input_files,
            &input_dir,
            SANDBOX_INPUT_DIR,
            &self.materializer,
        )
        .await?;
        let mappings: Vec<SandboxInputFileMapping> =
            manifest.iter().map(SandboxInputFileMapping::from).collect();

        let job = JobFile {
            id: request.run_id.clone(),
            code: request.code.clone(),
            file_manifest: manifest,
        };
        write_json_atomic(&job_dir.join(JOB_FILE_NAME), &job)?;

        let spec = self.container_spec(run_id, root);
        self.events
            .publish(run_id, stages::STARTING_CONTAINER, "Starting sandbox container");
        let container_id = self.runtime.create_container(&spec).await?;
        debug!(run_id, container = %spec.name, "Container started");

        let outcome = self.supervise(run_id, &container_id).await;
        if let Err(e) = self.runtime.remove_container(&container_id).await {
            warn!(run_id, "Failed to remove container {}: {}", spec.name, e);
        }
        let outcome = outcome?;

        let mut result = self.interpret(run_id, outcome, &output_dir).await;
        result.input_files = mappings;
        Ok(result)
    }

    fn container_spec(&self, run_id: &str, root: &Path) -> ContainerSpec {
        let settings = &self.settings;
        let mount = |sub: &str, container_path: &str, read_only: bool| Mount {
            host_path: root.join(sub).to_string_lossy().into_owned(),
            container_path: container_path.to_string(),
            read_only,
        };
        let job_path = format!("{}/{}", SANDBOX_JOB_DIR, JOB_FILE_NAME);

        ContainerSpec {
            name: format!("codebox-run-{}", name_fragment(run_id)),
            image: settings.image.clone(),
            command: vec![
                settings.runner_path.clone(),
                "--tail-chars".to_string(),
                settings.output_tail_chars.to_string(),
                "oneshot".to_string(),
                "--job".to_string(),
                job_path,
                "--input-dir".to_string(),
                SANDBOX_INPUT_DIR.to_string(),
                "--output-dir".to_string(),
                SANDBOX_OUTPUT_DIR.to_string(),
            ],
            working_dir: SANDBOX_OUTPUT_DIR.to_string(),
            mounts: vec![
                mount("input", SANDBOX_INPUT_DIR, true),
                mount("output", SANDBOX_OUTPUT_DIR, false),
                mount("job", SANDBOX_JOB_DIR, true),
            ],
            env: guest_env(),
            labels: HashMap::from([
                (LABEL_KIND.to_string(), KIND_EPHEMERAL.to_string()),
                (LABEL_RUN_ID.to_string(), run_id.to_string()),
                (LABEL_HOST.to_string(), settings.host_id.clone()),
            ]),
            memory_mb: settings.memory_mb,
            nano_cpus: settings.nano_cpus(),
            pids_limit: settings.pids_limit,
            tmpfs_size_mb: settings.tmpfs_size_mb,
            user: settings.container_user.clone().or_else(|| workspace_owner(root)),
        }
    }

    /// Drain output until the container exits or the deadline passes.
    async fn supervise(&self, run_id: &str, container_id: &str) -> Result<RunOutcome> {
        let deadline = tokio::time::Instant::now() + self.settings.timeout();
        let mut output = self.runtime.stream_output(container_id).await?;
        let mut drain = OutputDrain::new(self.settings.output_tail_chars);
        self.events.publish(run_id, stages::RUNNING, "Executing code");

        let mut timed_out = false;
        loop {
            tokio::select! {
                chunk = output.receiver.recv() => match chunk {
                    Some(chunk) => drain.accept(chunk, run_id, &self.events),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }
        drain.finish(run_id, &self.events);

        let mut exit_code = None;
        if !timed_out {
            match tokio::time::timeout_at(deadline, self.runtime.wait_container(container_id)).await {
                Ok(Ok(code)) => exit_code = Some(code),
                Ok(Err(e)) => warn!(run_id, "Failed to read exit code: {}", e),
                Err(_) => timed_out = true,
            }
        }

        if timed_out {
            warn!(run_id, "Execution timed out after {:?}, killing container", self.settings.timeout());
            if let Err(e) = self.runtime.kill_container(container_id).await {
                warn!(run_id, "Failed to kill container: {}", e);
            }
        }

        Ok(RunOutcome {
            drain,
            exit_code,
            timed_out,
        })
    }

    async fn interpret(
        &self,
        run_id: &str,
        outcome: RunOutcome,
        output_dir: &Path,
    ) -> SandboxExecutionResult {
        let tail = self.settings.output_tail_chars;
        let RunOutcome {
            drain,
            exit_code,
            timed_out,
        } = outcome;
        let stray_stdout = drain.stray_stdout.finish();
        let stderr = drain.stderr.finish();
        let pick = |from_runner: String, fallback: &str| {
            if from_runner.is_empty() {
                fallback.to_string()
            } else {
                truncate_tail(&from_runner, tail)
            }
        };

        if timed_out {
            let mut result = SandboxExecutionResult::timeout(
                run_id,
                format!("Execution exceeded {}s and was stopped", self.settings.timeout_secs),
            );
            result.stdout_tail = stray_stdout;
            result.stderr_tail = stderr;
            return result;
        }

        match drain.terminal {
            Some(RunnerEvent::Result {
                stdout_tail,
                stderr_tail,
                artifacts,
            }) => {
                self.events
                    .publish(run_id, stages::COLLECTING_ARTIFACTS, "Collecting artifacts");
                let limits = ArtifactLimits {
                    max_count: self.settings.max_artifacts,
                    max_bytes: self.settings.max_artifact_bytes,
                };
                let mut result = match load_artifacts(output_dir, &artifacts, limits).await {
                    Ok(loaded) => {
                        let summary = format!("Execution succeeded with {} artifact(s)", loaded.len());
                        let mut result = SandboxExecutionResult::succeeded(run_id, summary);
                        result.artifacts = loaded;
                        result
                    }
                    Err(e) => {
                        warn!(run_id, "Artifact rejected: {}", e);
                        SandboxExecutionResult::failed(run_id, format!("Artifact rejected: {}", e))
                    }
                };
                result.stdout_tail = pick(stdout_tail, &stray_stdout);
                result.stderr_tail = pick(stderr_tail, &stderr);
                result
            }
            Some(RunnerEvent::Error {
                message,
                traceback,
                stdout_tail,
                stderr_tail,
            }) => {
                let error_message = match traceback {
                    Some(tb) => format!(
                        "{}\n{}",
                        message,
                        trim_traceback(&tb, self.settings.traceback_lines)
                    ),
                    None => message,
                };
                let mut result = SandboxExecutionResult::failed(run_id, error_message);
                result.summary = "Code raised an error".to_string();
                result.stdout_tail = pick(stdout_tail, &stray_stdout);
                result.stderr_tail = pick(stderr_tail, &stderr);
                result
            }
            _ => {
                let code = exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                let mut result = SandboxExecutionResult::failed(
                    run_id,
                    format!("Runner exited with code {} without reporting a result", code),
                );
                result.stdout_tail = stray_stdout;
                result.stderr_tail = stderr;
                result
            }
        }
    }
}

/// Environment shared by every guest container
pub(crate) fn guest_env() -> HashMap<String, String> {
    HashMap::from([
        ("HOME".to_string(), "/tmp".to_string()),
        ("MPLBACKEND".to_string(), "Agg".to_string()),
        ("MPLCONFIGDIR".to_string(), "/tmp/matplotlib".to_string()),
        ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
        ("RUST_LOG".to_string(), "warn".to_string()),
    ])
}

/// `uid:gid` owning `path`, so files the guest writes stay removable by the host.
#[cfg(unix)]
pub(crate) fn workspace_owner(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path)
        .ok()
        .map(|meta| format!("{}:{}", meta.uid(), meta.gid()))
}

#[cfg(not(unix))]
pub(crate) fn workspace_owner(_path: &Path) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use codebox_protocol::ArtifactRef;

    fn chunk(stream: StreamType, data: &str) -> OutputChunk {
        OutputChunk {
            timestamp: chrono::Utc::now(),
            stream,
            data: data.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn test_drain_routes_events() {
        let events = StatusEventBus::default();
        let mut rx = events.subscribe();
        let mut drain = OutputDrain::new(100);

        let status = RunnerEvent::status("running", "Executing code").to_line().unwrap();
        let result = RunnerEvent::Result {
            stdout_tail: "hi\n".into(),
            stderr_tail: String::new(),
            artifacts: vec![ArtifactRef {
                filename: "a.csv".into(),
                rel_path: "a.csv".into(),
                content_type: "text/csv".into(),
            }],
        }
        .to_line()
        .unwrap();

        drain.accept(chunk(StreamType::Stdout, &status[..10]), "run-1", &events);
        drain.accept(chunk(StreamType::Stdout, &status[10..]), "run-1", &events);
        drain.accept(chunk(StreamType::Stdout, "not json\n"), "run-1", &events);
        drain.accept(chunk(StreamType::Stderr, "warning: x\n"), "run-1", &events);
        drain.accept(chunk(StreamType::Stdout, &result), "run-1", &events);
        drain.finish("run-1", &events);

        let forwarded = rx.recv().await.unwrap();
        assert_eq!(forwarded.stage, "running");
        assert_eq!(forwarded.run_id, "run-1");
        assert!(matches!(drain.terminal, Some(RunnerEvent::Result { .. })));
        assert_eq!(drain.stray_stdout.finish(), "not json\n");
        assert_eq!(drain.stderr.finish(), "warning: x\n");
    }

    #[test]
    fn test_first_terminal_event_wins() {
        let events = StatusEventBus::default();
        let mut drain = OutputDrain::new(100);
        let error = RunnerEvent::Error {
            message: "boom".into(),
            traceback: None,
            stdout_tail: String::new(),
            stderr_tail: String::new(),
        };
        let result = RunnerEvent::Result {
            stdout_tail: String::new(),
            stderr_tail: String::new(),
            artifacts: vec![],
        };
        drain.on_line(&error.to_line().unwrap(), "r", &events);
        drain.on_line(&result.to_line().unwrap(), "r", &events);
        assert_eq!(drain.terminal, Some(error));
    }
}
