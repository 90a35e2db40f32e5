use crate::engine::EngineSettings;
use crate::infra::{PodmanBackend, PodmanImages};
use crate::infra::config::{
    DEFAULT_STEVEDORE_TOML_NAME, default_config_dir, install_default_config, load_engine_config,
};
use crate::services::{HealthGate, SystemService};
use anyhow::Result;
use clap::Subcommand;
use std::path::Path;
use std::sync::Arc;

#[derive(Subcommand)]
pub enum AgentCommand {
    /// Checks the container system and the configuration
    Check,
    /// Writes the default stevedore.toml into the config directory
    Setup,
}

pub async fn run(command: AgentCommand, config_dir: &Path) -> Result<()> {
    match command {
        AgentCommand::Check => check(config_dir).await,
        AgentCommand::Setup => setup(config_dir),
    }
}

async fn check(config_dir: &Path) -> Result<()> {
    println!("🔍 Checking container system and configuration...");

    let settings = match load_engine_config(config_dir).and_then(|c| c.into_settings()) {
        Ok(settings) => {
            println!("✅ Configuration is valid");
            settings
        }
        Err(e) => {
            println!("⚠️  Invalid configuration: {e:#}");
            EngineSettings::default()
        }
    };

    let backend = Arc::new(PodmanBackend::new());
    let system = SystemService::new(backend, Arc::new(PodmanImages::new()), HealthGate::default());
    if system
        .bring_up(settings.start_retries, settings.start_interval)
        .await
    {
        println!("✅ Container system is healthy");
        if system.supports_custom_networks() {
            println!("✅ Custom networks supported");
        } else {
            println!("⚠️  Custom networks unavailable; only host/none can be used");
        }
    } else {
        println!("⚠️  Container system is not healthy (is podman installed?)");
    }

    if config_dir.join(DEFAULT_STEVEDORE_TOML_NAME).exists() {
        println!("✅ Config dir: {:?}", config_dir);
    } else {
        println!(
            "⚠️  No {} in {:?} (use 'stevedore setup')",
            DEFAULT_STEVEDORE_TOML_NAME, config_dir
        );
    }

    Ok(())
}

fn setup(config_dir: &Path) -> Result<()> {
    println!("📁 Preparing config in {:?}", config_dir);

    install_default_config(config_dir)?;

    println!(
        "✅ Config ready. Adjust {} as needed (default: {:?})",
        DEFAULT_STEVEDORE_TOML_NAME,
        default_config_dir()
    );

    Ok(())
}
