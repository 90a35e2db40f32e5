use super::boot_engine;
use crate::domain::ContainerState;
use crate::infra::config::load_stack;
use crate::services::{EngineEvent, deployment_order};
use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Subcommand)]
pub enum RuntimeCommand {
    /// Deploys a stack, waits for Ctrl-C, then tears it down in reverse order
    Up {
        /// Stack file (.toml, .yml or .yaml)
        stack: PathBuf,
    },
    /// Prints the start waves of a stack without touching the backend
    Plan { stack: PathBuf },
    /// Lists containers the backend runs for this engine
    Ps,
}

pub async fn run(cmd: RuntimeCommand, config_dir: &Path) -> Result<()> {
    match cmd {
        RuntimeCommand::Up { stack } => up(&stack, config_dir).await,
        RuntimeCommand::Plan { stack } => plan(&stack),
        RuntimeCommand::Ps => ps(config_dir).await,
    }
}

async fn up(stack: &Path, config_dir: &Path) -> Result<()> {
    let spec = load_stack(stack)?;
    let engine = boot_engine(config_dir).await?;

    let mut events = engine.subscribe();
    let watcher = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::ContainerStateChanged {
                    id,
                    state: ContainerState::Stopped,
                    exit_code: Some(code),
                }) => {
                    println!("⚠️  {id} exited with code {code}");
                }
                Ok(EngineEvent::ContainerRestarting { id, restart_count }) => {
                    println!("🔄 Restarting {id} (restart #{restart_count})");
                }
                Ok(event) => debug!("{event:?}"),
                Err(RecvError::Lagged(n)) => warn!("Dropped {n} engine events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("🚀 Deploying {} service(s) from {:?}", spec.services.len(), stack);
    let deployment = engine.orchestrator().deploy(spec).await?;
    for name in &deployment.start_order {
        println!("✅ {name} is up");
    }

    println!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    println!("🛑 Tearing down...");
    let result = engine.orchestrator().teardown(deployment).await;
    watcher.abort();
    result?;
    println!("✅ Everything stopped");

    Ok(())
}

fn plan(stack: &Path) -> Result<()> {
    let spec = load_stack(stack)?;
    let waves = deployment_order(&spec.services)?;

    if let Some(network) = &spec.network {
        println!("🌐 network {} ({})", network.name, network.driver);
    }
    for volume in &spec.volumes {
        println!("💾 volume {}", volume.name);
    }
    for (i, wave) in waves.iter().enumerate() {
        let names: Vec<&str> = wave
            .iter()
            .map(|&idx| spec.services[idx].name.as_str())
            .collect();
        println!("{:>2}. {}", i + 1, names.join(", "));
    }

    Ok(())
}

async fn ps(config_dir: &Path) -> Result<()> {
    let engine = boot_engine(config_dir).await?;
    let running = engine.system().list_running().await?;

    if running.is_empty() {
        println!("📦 No running containers");
        return Ok(());
    }

    println!("📦 Running containers:");
    for handle in running {
        println!("- {:<20} | {}", handle.name, handle.id);
    }

    Ok(())
}
