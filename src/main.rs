use anyhow::Result;
use clap::{Parser, Subcommand};
use stevedore::cli::{self, AgentCommand, BuilderCommand, RuntimeCommand};
use stevedore::infra::config::default_config_dir;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stevedore",
    about = "Container lifecycle and multi-container orchestration on podman"
)]
struct Cli {
    /// Config directory (default: ~/.config/stevedore)
    #[arg(long, env = "STEVEDORE_CONFIG_DIR", default_value_os_t = default_config_dir())]
    config_dir: std::path::PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Agent(AgentCommand),
    /// Builds an image from a directory with a Containerfile
    Build(BuilderCommand),
    #[command(flatten)]
    Runtime(RuntimeCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Agent(cmd) => cli::agent::run(cmd, &cli.config_dir).await,
        Commands::Build(cmd) => cli::builder::run(cmd, &cli.config_dir).await,
        Commands::Runtime(cmd) => cli::runtime::run(cmd, &cli.config_dir).await,
    }
}
