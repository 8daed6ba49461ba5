// ABOUTME: Entry point for the in-container guest runner
// ABOUTME: Dispatches to the one-shot job runner or the persistent session loop

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codebox_config::{constants, env_string};
use codebox_protocol::{IpcLayout, JobFile, RunnerEvent};
use codebox_runner::emit::emit;
use codebox_runner::{
    run_job, serve, Kernel, ReplKernel, RunnerDirs, RunnerOptions, SessionRunnerOptions,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codebox-runner")]
#[command(about = "Execute sandboxed analysis code inside a Codebox container")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Interpreter used for the execution kernel
    #[arg(long, global = true)]
    python: Option<String>,

    /// Characters of stdout/stderr kept in reports
    #[arg(long, global = true, default_value = "8000")]
    tail_chars: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single job and report NDJSON events on stdout
    Oneshot {
        #[arg(long)]
        job: PathBuf,
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
    },
    /// Serve queued requests until the IPC directory disappears
    Session {
        #[arg(long)]
        ipc_dir: PathBuf,
        #[arg(long)]
        input_dir: PathBuf,
        #[arg(long)]
        output_dir: PathBuf,
        /// Request queue poll interval in milliseconds
        #[arg(long, default_value = "100")]
        poll_interval_ms: u64,
    },
}

#[tokio::main]
async fn main() {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let python = cli
        .python
        .clone()
        .or_else(|| env_string(constants::CODEBOX_PYTHON))
        .unwrap_or_else(|| "python3".to_string());

    let code = match cli.command {
        Commands::Oneshot {
            job,
            input_dir,
            output_dir,
        } => {
            let dirs = RunnerDirs {
                input_dir,
                output_dir,
            };
            match run_oneshot(&python, &job, &dirs, cli.tail_chars).await {
                Ok(true) => 0,
                Ok(false) => 1,
                Err(e) => {
                    let mut stdout = tokio::io::stdout();
                    let event = RunnerEvent::Error {
                        message: format!("{:#}", e),
                        traceback: None,
                        stdout_tail: String::new(),
                        stderr_tail: String::new(),
                    };
                    let _ = emit(&mut stdout, &event).await;
                    2
                }
            }
        }
        Commands::Session {
            ipc_dir,
            input_dir,
            output_dir,
            poll_interval_ms,
        } => {
            let dirs = RunnerDirs {
                input_dir,
                output_dir,
            };
            let options = SessionRunnerOptions {
                poll_interval: Duration::from_millis(poll_interval_ms),
                tail_chars: cli.tail_chars,
            };
            match run_session(&python, &IpcLayout::new(ipc_dir), &dirs, &options).await {
                Ok(()) => 0,
                Err(e) => {
                    tracing::error!("Session runner failed: {:#}", e);
                    1
                }
            }
        }
    };

    std::process::exit(code);
}

async fn run_oneshot(
    python: &str,
    job_path: &Path,
    dirs: &RunnerDirs,
    tail_chars: usize,
) -> Result<bool> {
    let bytes = tokio::fs::read(job_path)
        .await
        .with_context(|| format!("Failed to read job file {}", job_path.display()))?;
    let job: JobFile = serde_json::from_slice(&bytes).context("Failed to parse job file")?;

    let mut kernel = ReplKernel::spawn(python, &dirs.output_dir, tail_chars * 4)
        .await
        .context("Failed to start interpreter")?;
    let mut stdout = tokio::io::stdout();
    let options = RunnerOptions { tail_chars };

    let succeeded = run_job(&job, dirs, &mut kernel, &mut stdout, &options).await?;
    kernel.shutdown().await?;
    Ok(succeeded)
}

async fn run_session(
    python: &str,
    layout: &IpcLayout,
    dirs: &RunnerDirs,
    options: &SessionRunnerOptions,
) -> Result<()> {
    let mut kernel = ReplKernel::spawn(python, &dirs.output_dir, options.tail_chars * 4)
        .await
        .context("Failed to start interpreter")?;
    serve(layout, dirs, &mut kernel, options).await?;
    Ok(())
}
