use crate::domain::{
    BackendHandle, EngineError, HypervisorBackend, ImageHandle, ImageProvider, Result,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Process-wide readiness flag set once by the health check.
#[derive(Debug, Clone, Default)]
pub struct HealthGate(Arc<AtomicBool>);

impl HealthGate {
    pub fn new(ready: bool) -> Self {
        Self(Arc::new(AtomicBool::new(ready)))
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    /// Fails with `SystemNotReady` unless the health check passed.
    pub fn ensure(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(EngineError::SystemNotReady)
        }
    }
}

/// System-wide operations: health, images, backend listing
pub struct SystemService {
    backend: Arc<dyn HypervisorBackend>,
    images: Arc<dyn ImageProvider>,
    gate: HealthGate,
}

impl SystemService {
    pub fn new(
        backend: Arc<dyn HypervisorBackend>,
        images: Arc<dyn ImageProvider>,
        gate: HealthGate,
    ) -> Self {
        Self {
            backend,
            images,
            gate,
        }
    }

    pub fn gate(&self) -> &HealthGate {
        &self.gate
    }

    /// Runs the health check, starting the system and re-polling when it fails.
    pub async fn bring_up(&self, retries: u32, interval: Duration) -> bool {
        if self.backend.health_check().await {
            info!("Container system is already running");
            self.gate.set(true);
            return true;
        }

        info!("Starting container system...");
        if let Err(e) = self.backend.start_system().await {
            warn!("Failed to start container system: {e:#}");
        }

        for attempt in 1..=retries {
            if self.backend.health_check().await {
                info!("Container system started after {attempt} checks");
                self.gate.set(true);
                return true;
            }
            debug!("Container system not healthy yet ({attempt}/{retries})");
            if attempt < retries {
                tokio::time::sleep(interval).await;
            }
        }

        warn!("Container system failed its health check; every operation will be refused");
        self.gate.set(false);
        false
    }

    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    pub fn supports_custom_networks(&self) -> bool {
        self.backend.supports_custom_networks()
    }

    pub async fn resolve_image(&self, reference: &str) -> Result<ImageHandle> {
        self.gate.ensure()?;
        self.images
            .resolve(reference)
            .await
            .map_err(|e| EngineError::ImageNotFound(format!("{reference}: {e:#}")))
    }

    pub async fn build_image(
        &self,
        context_dir: &Path,
        build_args: &BTreeMap<String, String>,
    ) -> Result<ImageHandle> {
        self.gate.ensure()?;
        info!("Building image from {:?}", context_dir);
        self.images
            .build(context_dir, build_args)
            .await
            .map_err(EngineError::backend)
    }

    /// Backend-side view of running containers, for reconciliation.
    pub async fn list_running(&self) -> Result<Vec<BackendHandle>> {
        self.gate.ensure()?;
        self.backend.list_running().await.map_err(EngineError::backend)
    }
}
