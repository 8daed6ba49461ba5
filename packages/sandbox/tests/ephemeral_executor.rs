// ABOUTME: Integration tests for one-shot executions in throwaway containers
// ABOUTME: Covers success, guest errors, timeouts, artifact limits and runner misbehaviour

mod common;

use codebox_protocol::{ArtifactRef, RunnerEvent};
use codebox_sandbox::{stages, ExecutionStatus, InputSource, SandboxExecutionRequest, SandboxInputFile};
use common::{Behavior, Harness, HOST_ID};
use pretty_assertions::assert_eq;

fn run_dirs_left(harness: &Harness) -> usize {
    std::fs::read_dir(&harness.settings.ephemeral_root)
        .map(|entries| entries.count())
        .unwrap_or(0)
}

fn result_line(artifacts: Vec<ArtifactRef>) -> String {
    RunnerEvent::Result {
        stdout_tail: String::new(),
        stderr_tail: String::new(),
        artifacts,
    }
    .to_line()
    .unwrap()
    .trim_end()
    .to_string()
}

#[tokio::test]
async fn test_success_returns_output_and_artifacts() {
    let harness = Harness::new().await;
    let executor = harness.ephemeral_executor();

    let request = SandboxExecutionRequest::new(
        "x = 2\nprint(x + 3)\nwrite(\"report/summary.txt\", \"done\")\nsavefig(\"chart.png\")",
    );
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::Succeeded, "{:?}", result.error_message);
    assert_eq!(result.run_id, request.run_id);
    assert_eq!(result.stdout_tail, "5\n");
    assert!(result.session_id.is_none());
    assert!(!result.reused);

    let mut names: Vec<_> = result
        .artifacts
        .iter()
        .map(|a| (a.filename.as_str(), a.content_type.as_str()))
        .collect();
    names.sort();
    assert_eq!(names, vec![("chart.png", "image/png"), ("summary.txt", "text/plain")]);
    assert_eq!(run_dirs_left(&harness), 0);
}

#[tokio::test]
async fn test_inputs_are_staged_with_index_prefix() {
    let harness = Harness::new().await;
    let executor = harness.ephemeral_executor();

    let request = SandboxExecutionRequest::new("read(\"01_campaign.csv\")\nfiles()").with_input(
        SandboxInputFile::new("f1", "campaign.csv", InputSource::Inline(b"spend\n10\n".to_vec())),
    );
    let result = executor.execute(&request).await;

    assert_eq!(result.status, ExecutionStatus::Succeeded, "{:?}", result.error_message);
    assert_eq!(result.stdout_tail, "spend\n10\n01_campaign.csv\n");
    assert_eq!(result.input_files.len(), 1);
    assert_eq!(result.input_files[0].container_path, "/sandbox/input/01_campaign.csv");
}

#[tokio::test]
async fn test_guest_error_is_reported_with_traceback() {
    let harness = Harness::new().await;
    let executor = harness.ephemeral_executor();

    let result = executor
        .execute(&SandboxExecutionRequest::new("print(1)\nprint(missing)"))
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.summary, "Code raised an error");
    assert_eq!(result.stdout_tail, "1\n");
    let message = result.error_message.unwrap();
    assert!(message.starts_with("NameError: name 'missing' is not defined"), "{}", message);
    assert!(message.contains("Traceback"));
}

#[tokio::test]
async fn test_hanging_container_times_out_and_is_removed() {
    let harness = Harness::with_settings(|s| s.timeout_secs = 1).await;
    harness.runtime.set_behavior(Behavior::Hang);
    let executor = harness.ephemeral_executor();

    let result = executor.execute(&SandboxExecutionRequest::new("sleep(60000)")).await;

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.duration_ms >= 1000);
    assert!(harness.runtime.container_names().is_empty());
    assert_eq!(harness.runtime.removed().len(), 1);
    assert_eq!(run_dirs_left(&harness), 0);
}

#[tokio::test]
async fn test_too_many_artifacts_fails_the_run() {
    let harness = Harness::with_settings(|s| s.max_artifacts = 2).await;
    let executor = harness.ephemeral_executor();

    let code = (0..3)
        .map(|i| format!("write(\"out{}.txt\", \"x\")", i))
        .collect::<Vec<_>>()
        .join("\n");
    let result = executor.execute(&SandboxExecutionRequest::new(code)).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.artifacts.is_empty());
    assert!(result
        .error_message
        .unwrap()
        .starts_with("Artifact rejected: 3 artifacts produced"));
}

#[tokio::test]
async fn test_escaping_artifact_path_is_rejected() {
    let harness = Harness::new().await;
    harness.runtime.set_behavior(Behavior::Raw {
        lines: vec![result_line(vec![ArtifactRef {
            filename: "job.json".to_string(),
            rel_path: "../job/job.json".to_string(),
            content_type: "application/json".to_string(),
        }])],
        exit_code: 0,
    });
    let executor = harness.ephemeral_executor();

    let result = executor.execute(&SandboxExecutionRequest::new("print(1)")).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.artifacts.is_empty());
    assert!(result
        .error_message
        .unwrap()
        .contains("resolves outside the output directory"));
}

#[tokio::test]
async fn test_runner_without_terminal_event_fails() {
    let harness = Harness::new().await;
    harness.runtime.set_behavior(Behavior::Raw {
        lines: vec!["hello from a broken runner".to_string()],
        exit_code: 3,
    });
    let executor = harness.ephemeral_executor();

    let result = executor.execute(&SandboxExecutionRequest::new("print(1)")).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(
        result.error_message.as_deref(),
        Some("Runner exited with code 3 without reporting a result")
    );
    assert!(result.stdout_tail.contains("hello from a broken runner"));
}

#[tokio::test]
async fn test_container_spec_is_hardened() {
    let harness = Harness::new().await;
    let executor = harness.ephemeral_executor();

    let request = SandboxExecutionRequest::new("x = 1");
    executor.execute(&request).await;

    let spec = harness.runtime.created().remove(0);
    assert!(spec.name.starts_with("codebox-run-"));
    assert_eq!(spec.labels["codebox.kind"], "ephemeral");
    assert_eq!(spec.labels["codebox.run_id"], request.run_id);
    assert_eq!(spec.labels["codebox.host"], HOST_ID);
    assert_eq!(spec.env["HOME"], "/tmp");
    assert_eq!(spec.memory_mb, harness.settings.memory_mb);
    assert_eq!(spec.pids_limit, harness.settings.pids_limit);

    let writable: Vec<_> = spec
        .mounts
        .iter()
        .filter(|m| !m.read_only)
        .map(|m| m.container_path.as_str())
        .collect();
    assert_eq!(writable, vec!["/sandbox/output"]);
}

#[tokio::test]
async fn test_status_events_end_with_terminal_stage() {
    let harness = Harness::new().await;
    let executor = harness.ephemeral_executor();
    let mut events = executor.events().subscribe();

    let request = SandboxExecutionRequest::new("print(1)\nraise nope");
    executor.execute(&request).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.stage);
    }
    assert_eq!(seen.first().map(String::as_str), Some(stages::PREPARING));
    assert!(seen.iter().any(|s| s == stages::RUNNING));
    assert_eq!(seen.last().map(String::as_str), Some(stages::FAILED));
}
