// ABOUTME: Terminal rendering for execution results, session status, sweep reports and diagnostics
// ABOUTME: Colored headings plus comfy-table tables in the style of the rest of the CLI

use codebox_sandbox::{
    ExecutionStatus, SandboxExecutionResult, SandboxSettings, SessionStatus, StatusEvent,
    SweepReport,
};
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use std::path::Path;

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn status_label(status: ExecutionStatus) -> ColoredString {
    match status {
        ExecutionStatus::Succeeded => status.as_str().green().bold(),
        ExecutionStatus::Failed => status.as_str().red().bold(),
        ExecutionStatus::Timeout => status.as_str().yellow().bold(),
    }
}

pub fn print_event(event: &StatusEvent) {
    eprintln!(
        "{} {} {}",
        event.timestamp.format("%H:%M:%S").to_string().dimmed(),
        format!("[{}]", event.stage).cyan(),
        event.message
    );
}

pub fn print_result(result: &SandboxExecutionResult) {
    println!(
        "{} {} ({} ms)",
        status_label(result.status),
        result.summary,
        result.duration_ms
    );
    if let Some(session_id) = &result.session_id {
        println!(
            "Session: {} {}",
            session_id.cyan(),
            (if result.reused { "(reused)" } else { "(new)" }).dimmed()
        );
    }
    if let Some(sequence) = result.request_sequence {
        let wait = result
            .queue_wait_ms
            .map(|ms| format!(", waited {} ms", ms))
            .unwrap_or_default();
        println!("Request: #{}{}", sequence, wait);
    }

    if !result.input_files.is_empty() {
        println!();
        println!("{}", "Inputs".blue().bold());
        let mut inputs = table();
        inputs.set_header(vec!["Sandbox name", "Path", "Source"]);
        for input in &result.input_files {
            inputs.add_row(vec![
                input.sandbox_name.as_str(),
                input.container_path.as_str(),
                input.external_id.as_str(),
            ]);
        }
        println!("{}", inputs);
    }

    if !result.stdout_tail.is_empty() {
        println!();
        println!("{}", "stdout".blue().bold());
        print!("{}", result.stdout_tail);
        if !result.stdout_tail.ends_with('\n') {
            println!();
        }
    }
    if !result.stderr_tail.is_empty() {
        println!();
        println!("{}", "stderr".yellow().bold());
        print!("{}", result.stderr_tail);
        if !result.stderr_tail.ends_with('\n') {
            println!();
        }
    }
    if let Some(message) = &result.error_message {
        println!();
        println!("{}", "error".red().bold());
        println!("{}", message);
    }

    if !result.artifacts.is_empty() {
        println!();
        println!("{}", "Artifacts".blue().bold());
        let mut artifacts = table();
        artifacts.set_header(vec!["File", "Type", "Bytes"]);
        for artifact in &result.artifacts {
            artifacts.add_row(vec![
                artifact.filename.clone(),
                artifact.content_type.clone(),
                artifact.size.to_string(),
            ]);
        }
        println!("{}", artifacts);
    }
}

pub fn print_saved(path: &Path) {
    println!("{} {}", "Saved".green(), path.display());
}

pub fn print_status(conversation_id: &str, status: &SessionStatus) {
    let state = if status.alive {
        "alive".green().bold()
    } else {
        "not alive".red().bold()
    };
    println!("Conversation {}: {}", conversation_id.cyan(), state);
    if let Some(reason) = status.reason {
        println!("Reason: {}", reason.as_str());
    }
    if let Some(session_id) = &status.session_id {
        println!("Session: {}", session_id);
        println!("Last request: #{}", status.request_sequence);
    }

    if status.available_files.is_empty() {
        return;
    }
    println!();
    let mut files = table();
    files.set_header(vec!["Sandbox name", "Path", "Source"]);
    for file in &status.available_files {
        files.add_row(vec![
            file.sandbox_name.as_str(),
            file.container_path.as_str(),
            file.external_id.as_str(),
        ]);
    }
    println!("{}", files);
}

pub fn print_reset(conversation_id: &str, removed: bool) {
    if removed {
        println!("{}", format!("Session for '{}' reset", conversation_id).green());
    } else {
        println!("{}", format!("No session for '{}'", conversation_id).yellow());
    }
}

pub fn print_sweep(report: &SweepReport) {
    let mut rows = table();
    rows.set_header(vec!["Removed", "Count"]);
    for (label, count) in [
        ("Expired sessions", report.expired_sessions),
        ("Orphaned session containers", report.orphaned_containers),
        ("Orphaned workspaces", report.orphaned_workspaces),
        ("Stale ephemeral containers", report.stale_ephemeral_containers),
        ("Stale run directories", report.stale_ephemeral_workspaces),
    ] {
        rows.add_row(vec![label.to_string(), count.to_string()]);
    }
    println!("{}", rows);
    println!("Total: {}", report.total().to_string().cyan());
}

pub fn print_doctor(
    settings: &SandboxSettings,
    runtime_available: bool,
    database: &Result<(), String>,
) {
    let check = |ok: bool| if ok { "ok".green() } else { "unavailable".red() };
    println!("{}", "Codebox diagnostics".blue().bold());
    println!("Container runtime: {}", check(runtime_available));
    match database {
        Ok(()) => println!("Session database:  {}", check(true)),
        Err(e) => println!("Session database:  {} ({})", check(false), e),
    }
    println!();

    let mut rows = table();
    rows.set_header(vec!["Setting", "Value"]);
    let entries = [
        ("image", settings.image.clone()),
        ("runner", settings.runner_path.clone()),
        ("memory", format!("{} MB", settings.memory_mb)),
        ("cpus", settings.cpus.to_string()),
        ("pids limit", settings.pids_limit.to_string()),
        ("timeout", format!("{}s", settings.timeout_secs)),
        ("session ttl", format!("{}s", settings.session_ttl_secs)),
        ("queue wait timeout", format!("{}s", settings.queue_wait_timeout_secs)),
        ("sessions root", settings.sessions_root.display().to_string()),
        ("ephemeral root", settings.ephemeral_root.display().to_string()),
        ("database", settings.database_url.clone()),
        ("host", settings.host_id.clone()),
    ];
    for (name, value) in entries {
        rows.add_row(vec![name.to_string(), value]);
    }
    println!("{}", rows);
}
