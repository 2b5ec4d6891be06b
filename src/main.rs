use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "aicoder")]
#[command(version, about = "Sandboxed AI task flow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Config file to use instead of .aicoder/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the models flows can be created with
    Models,
    /// List all flows
    Flows,
    /// Show a flow's tasks and terminal log
    Flow { id: i64 },
    /// Create a flow, run prompts and commands in its sandbox, then finish it
    Run {
        /// Model provider (openai, ollama)
        #[arg(long)]
        provider: String,

        /// Model identifier
        #[arg(long)]
        model: String,

        /// Shell command to run in the sandbox (repeatable)
        #[arg(short = 'c', long = "command")]
        commands: Vec<String>,

        /// Prompts, each admitted as an input task
        prompts: Vec<String>,
    },
    /// Resume flows left in progress and process their tasks until Ctrl-C
    Resume,
    /// Finish a flow and tear down its container
    Finish { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = cmd::load_config(&project_dir, cli.config.as_deref())?;
    let _log_guard = aicoder::logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Models => cmd::cmd_models(&config),
        Commands::Flows => cmd::cmd_flows(&config).await?,
        Commands::Flow { id } => cmd::cmd_flow(config, *id).await?,
        Commands::Run {
            provider,
            model,
            commands,
            prompts,
        } => cmd::cmd_run(config, provider, model, prompts, commands).await?,
        Commands::Resume => cmd::cmd_resume(config).await?,
        Commands::Finish { id } => cmd::cmd_finish(config, *id).await?,
    }

    Ok(())
}
