//! Explicitly constructed engine instance: one registry plus the managers
//! that own its entries, sharing a single health gate and event bus.

use crate::domain::{HypervisorBackend, ImageProvider, Subnet};
use crate::services::{
    EngineEvent, EventBus, HealthGate, LifecycleManager, LifecycleSettings, MountResolver,
    NetworkManager, Orchestrator, ReadinessProber, Registry, SystemService,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Graceful stop budget used by deployment teardown.
    pub stop_timeout: Duration,
    pub lifecycle: LifecycleSettings,
    /// Create missing named volumes on first mount instead of failing.
    pub auto_create_volumes: bool,
    pub subnet_pool: Subnet,
    /// Prefix length of each network carved from the pool.
    pub subnet_prefix: u8,
    /// Health polls after asking the backend to start the system.
    pub start_retries: u32,
    pub start_interval: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            lifecycle: LifecycleSettings::default(),
            auto_create_volumes: true,
            subnet_pool: Subnet::DEFAULT_POOL,
            subnet_prefix: 24,
            start_retries: 5,
            start_interval: Duration::from_secs(1),
        }
    }
}

pub struct Engine {
    registry: Arc<Registry>,
    events: EventBus,
    system: Arc<SystemService>,
    networks: Arc<NetworkManager>,
    mounts: Arc<MountResolver>,
    containers: Arc<LifecycleManager>,
    prober: Arc<ReadinessProber>,
    orchestrator: Arc<Orchestrator>,
    settings: EngineSettings,
}

impl Engine {
    /// Wires every manager and runs the system health check.
    ///
    /// The engine is returned even when the check fails; every operation then
    /// fails with `SystemNotReady`.
    pub async fn boot(
        backend: Arc<dyn HypervisorBackend>,
        images: Arc<dyn ImageProvider>,
        settings: EngineSettings,
    ) -> Self {
        let gate = HealthGate::default();
        let registry = Arc::new(Registry::new());
        let events = EventBus::new();

        let system = Arc::new(SystemService::new(backend.clone(), images, gate.clone()));
        system
            .bring_up(settings.start_retries, settings.start_interval)
            .await;

        let networks = Arc::new(NetworkManager::new(
            registry.clone(),
            backend.clone(),
            events.clone(),
            gate.clone(),
            settings.subnet_pool,
            settings.subnet_prefix,
        ));
        let mounts = Arc::new(MountResolver::new(
            registry.clone(),
            backend.clone(),
            events.clone(),
            gate.clone(),
            settings.auto_create_volumes,
        ));
        let containers = LifecycleManager::new(
            registry.clone(),
            backend,
            system.clone(),
            networks.clone(),
            mounts.clone(),
            events.clone(),
            gate.clone(),
            settings.lifecycle,
        );
        let prober = Arc::new(ReadinessProber::new(
            containers.clone(),
            events.clone(),
            gate.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            containers.clone(),
            networks.clone(),
            mounts.clone(),
            prober.clone(),
            gate,
            settings.stop_timeout,
        ));

        info!(
            "Engine ready: {} (custom networks: {})",
            system.gate().is_ready(),
            networks.supports_custom_networks()
        );

        Self {
            registry,
            events,
            system,
            networks,
            mounts,
            containers,
            prober,
            orchestrator,
            settings,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.system.gate().is_ready()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn system(&self) -> &Arc<SystemService> {
        &self.system
    }

    pub fn networks(&self) -> &Arc<NetworkManager> {
        &self.networks
    }

    pub fn mounts(&self) -> &Arc<MountResolver> {
        &self.mounts
    }

    pub fn containers(&self) -> &Arc<LifecycleManager> {
        &self.containers
    }

    pub fn prober(&self) -> &Arc<ReadinessProber> {
        &self.prober
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContainerConfig, EngineError, NetworkDriver, NetworkSpec};
    use crate::test_support::{MockBackend, MockImages};

    #[tokio::test(start_paused = true)]
    async fn unhealthy_system_refuses_every_operation() {
        let mock = Arc::new(MockBackend::new());
        mock.set_healthy(false);
        let engine = Engine::boot(mock, Arc::new(MockImages::new()), EngineSettings::default()).await;

        assert!(!engine.is_ready());
        assert!(matches!(
            engine.containers().create(ContainerConfig::new("alpine")).await,
            Err(EngineError::SystemNotReady)
        ));
        assert!(matches!(
            engine
                .networks()
                .create_network(NetworkSpec::new("n", NetworkDriver::Bridge))
                .await,
            Err(EngineError::SystemNotReady)
        ));
        assert!(matches!(
            engine.orchestrator().deploy(Default::default()).await,
            Err(EngineError::SystemNotReady)
        ));
    }

    #[tokio::test]
    async fn boots_with_builtin_networks() {
        let mock = Arc::new(MockBackend::new());
        let engine = Engine::boot(mock, Arc::new(MockImages::new()), EngineSettings::default()).await;

        assert!(engine.is_ready());
        let names: Vec<String> = engine
            .networks()
            .list_networks()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["host", "none"]);
        assert_eq!(engine.registry().counts().containers, 0);
    }
}
