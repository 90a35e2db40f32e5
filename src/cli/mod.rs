pub mod agent;
pub mod builder;
pub mod runtime;

pub use agent::AgentCommand;
pub use builder::BuilderCommand;
pub use runtime::RuntimeCommand;

use crate::engine::Engine;
use crate::infra::config::load_engine_config;
use crate::infra::{PodmanBackend, PodmanImages};
use anyhow::{Result, bail};
use std::path::Path;
use std::sync::Arc;

/// Boots an engine on the local podman installation with the merged config.
pub async fn boot_engine(config_dir: &Path) -> Result<Engine> {
    let settings = load_engine_config(config_dir)?.into_settings()?;
    let engine = Engine::boot(
        Arc::new(PodmanBackend::new()),
        Arc::new(PodmanImages::new()),
        settings,
    )
    .await;

    if !engine.is_ready() {
        bail!("container system is not ready (is podman installed and running?)");
    }

    Ok(engine)
}
