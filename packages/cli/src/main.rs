// ABOUTME: Entry point for the codebox operator CLI
// ABOUTME: Parses subcommands and dispatches to the sandbox executors, sweeper and diagnostics

use clap::{Args, Parser, Subcommand};
use codebox_cli::commands::{self, CodeSource, RunOptions};
use codebox_cli::App;
use colored::*;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codebox")]
#[command(about = "Codebox CLI - sandboxed execution of analysis code")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CodeArgs {
    /// File containing the code to run ("-" or omitted reads stdin)
    file: Option<PathBuf>,

    /// Code given inline instead of a file
    #[arg(short, long, conflicts_with = "file")]
    code: Option<String>,

    /// Local file to expose in the sandbox input directory (repeatable)
    #[arg(short, long = "input")]
    inputs: Vec<PathBuf>,

    /// Directory to save returned artifacts into
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    /// Print status events to stderr while running
    #[arg(long)]
    events: bool,
}

impl From<CodeArgs> for RunOptions {
    fn from(args: CodeArgs) -> Self {
        RunOptions {
            code: CodeSource {
                file: args.file,
                inline: args.code,
            },
            inputs: args.inputs,
            save_dir: args.save_dir,
            json: args.json,
            show_events: args.events,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run code once in a throwaway container
    Run(CodeArgs),
    /// Run code in a conversation's persistent session
    Exec {
        /// Conversation the session belongs to
        #[arg(long)]
        conversation: String,
        #[command(flatten)]
        args: CodeArgs,
    },
    /// Show whether a conversation's session is alive
    Status {
        #[arg(long)]
        conversation: String,
        #[arg(long)]
        json: bool,
    },
    /// Tear down a conversation's session
    Reset {
        #[arg(long)]
        conversation: String,
    },
    /// Remove expired sessions and leftovers from crashed runs
    Sweep {
        /// Keep sweeping at the configured interval until interrupted
        #[arg(long)]
        watch: bool,
        #[arg(long)]
        json: bool,
    },
    /// Check the container runtime and database, and show effective settings
    Doctor,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(e) = handle_command(cli.command).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn handle_command(command: Commands) -> anyhow::Result<()> {
    let app = App::from_env()?;
    match command {
        Commands::Run(args) => commands::run_command(&app, &args.into()).await,
        Commands::Exec { conversation, args } => {
            commands::exec_command(&app, &conversation, &args.into()).await
        }
        Commands::Status { conversation, json } => {
            commands::status_command(&app, &conversation, json).await
        }
        Commands::Reset { conversation } => commands::reset_command(&app, &conversation).await,
        Commands::Sweep { watch, json } => commands::sweep_command(&app, watch, json).await,
        Commands::Doctor => commands::doctor_command(&app).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exec_parses_inputs() {
        let cli = Cli::try_parse_from([
            "codebox",
            "exec",
            "--conversation",
            "conv-1",
            "--input",
            "a.csv",
            "-i",
            "b.csv",
            "analysis.py",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec { conversation, args } => {
                assert_eq!(conversation, "conv-1");
                assert_eq!(args.inputs, vec![PathBuf::from("a.csv"), PathBuf::from("b.csv")]);
                assert_eq!(args.file, Some(PathBuf::from("analysis.py")));
            }
            _ => panic!("Expected exec"),
        }
    }

    #[test]
    fn test_code_and_file_conflict() {
        assert!(Cli::try_parse_from(["codebox", "run", "x.py", "--code", "print(1)"]).is_err());
    }
}
