use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version, about = "Agent workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true, env = "PIPEWRIGHT_PROJECT_DIR")]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API and push channel
    Serve {
        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides server.db_path)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (bind on all interfaces, permissive CORS)
        #[arg(long)]
        dev: bool,

        /// Do not spawn agents; stages complete via the advance endpoint
        #[arg(long)]
        external_runner: bool,
    },
    /// Write a default .pipewright/pipewright.toml
    Init {
        #[arg(long)]
        force: bool,
    },
    /// List workflow instances
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        stage: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and report the first problem
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let log_dir = project_dir.join(pipewright::config::CONFIG_DIR).join("logs");
    let _log_guard = pipewright::logging::init(pipewright::logging::LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        file_dir: matches!(cli.command, Commands::Serve { .. }).then_some(log_dir.as_path()),
    })?;

    match cli.command {
        Commands::Serve {
            port,
            db_path,
            dev,
            external_runner,
        } => {
            cmd::cmd_serve(
                &project_dir,
                cmd::serve::ServeArgs {
                    port,
                    db_path,
                    dev,
                    external_runner,
                },
            )
            .await?
        }
        Commands::Init { force } => cmd::cmd_init(&project_dir, force)?,
        Commands::List { status, stage } => {
            cmd::cmd_list(&project_dir, status.as_deref(), stage.as_deref())?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command)?,
    }

    Ok(())
}
