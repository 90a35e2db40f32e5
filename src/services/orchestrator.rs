use super::lifecycle::LifecycleManager;
use super::mount_resolver::MountResolver;
use super::network_manager::NetworkManager;
use super::prober::{ReadinessProbe, ReadinessProber};
use super::system_service::HealthGate;
use crate::domain::{
    ContainerConfig, ContainerId, EngineError, NetworkSpec, Result, VolumeSpec, validate_name,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One node of a deployment graph.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub config: ContainerConfig,
    pub depends_on: Vec<String>,
    /// Dependents wait until this probe passes.
    pub readiness: Option<ReadinessProbe>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, config: ContainerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            depends_on: Vec::new(),
            readiness: None,
        }
    }

    pub fn depends_on<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_readiness(mut self, probe: ReadinessProbe) -> Self {
        self.readiness = Some(probe);
        self
    }
}

/// Everything a multi-container deployment needs.
#[derive(Debug, Clone, Default)]
pub struct DeploymentSpec {
    /// Shared network; services without an explicit network join it.
    pub network: Option<NetworkSpec>,
    /// Volumes created up front when missing. Never deleted on teardown.
    pub volumes: Vec<VolumeSpec>,
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TeardownItem {
    Container { service: String, id: ContainerId },
    Network(String),
}

/// Resources acquired by a deployment, unwound from the top.
///
/// Containers are pushed when created and moved to the top when started, so
/// unwinding follows reverse start order.
#[derive(Debug, Default)]
struct TeardownStack {
    items: Mutex<Vec<TeardownItem>>,
}

impl TeardownStack {
    fn lock(&self) -> MutexGuard<'_, Vec<TeardownItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, item: TeardownItem) {
        self.lock().push(item);
    }

    fn mark_started(&self, id: &ContainerId) {
        let mut items = self.lock();
        if let Some(pos) = items
            .iter()
            .position(|item| matches!(item, TeardownItem::Container { id: c, .. } if c == id))
        {
            let item = items.remove(pos);
            items.push(item);
        }
    }

    fn take_all(&self) -> Vec<TeardownItem> {
        let mut items = std::mem::take(&mut *self.lock());
        items.reverse();
        items
    }
}

/// A successfully deployed set of services.
#[derive(Debug)]
pub struct Deployment {
    /// Service name to container id.
    pub services: BTreeMap<String, ContainerId>,
    /// Service names in the order their containers started.
    pub start_order: Vec<String>,
    /// Network created by this deployment, if any.
    pub network: Option<String>,
    stack: Arc<TeardownStack>,
}

impl Deployment {
    pub fn container(&self, service: &str) -> Option<&ContainerId> {
        self.services.get(service)
    }
}

/// Groups services into waves: every service only depends on services of
/// earlier waves. Rejects unknown dependencies and cycles.
pub fn deployment_order(services: &[ServiceSpec]) -> Result<Vec<Vec<usize>>> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, service) in services.iter().enumerate() {
        validate_name("service", &service.name)?;
        if index.insert(service.name.as_str(), i).is_some() {
            return Err(EngineError::InvalidConfiguration(format!(
                "service {} is declared twice",
                service.name
            )));
        }
    }

    let mut pending: Vec<usize> = vec![0; services.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); services.len()];
    for (i, service) in services.iter().enumerate() {
        let unique: HashSet<&str> = service.depends_on.iter().map(String::as_str).collect();
        for dep in unique {
            let Some(&d) = index.get(dep) else {
                return Err(EngineError::InvalidConfiguration(format!(
                    "service {} depends on unknown service {dep}",
                    service.name
                )));
            };
            if d == i {
                return Err(EngineError::InvalidConfiguration(format!(
                    "service {} depends on itself",
                    service.name
                )));
            }
            pending[i] += 1;
            dependents[d].push(i);
        }
    }

    let mut waves = Vec::new();
    let mut ready: Vec<usize> = (0..services.len()).filter(|&i| pending[i] == 0).collect();
    let mut placed = 0;

    while !ready.is_empty() {
        let mut next = Vec::new();
        for &i in &ready {
            for &dependent in &dependents[i] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    next.push(dependent);
                }
            }
        }
        placed += ready.len();
        next.sort_unstable();
        waves.push(std::mem::replace(&mut ready, next));
    }

    if placed != services.len() {
        let stuck: Vec<&str> = (0..services.len())
            .filter(|&i| pending[i] > 0)
            .map(|i| services[i].name.as_str())
            .collect();
        return Err(EngineError::InvalidConfiguration(format!(
            "dependency cycle between services: {}",
            stuck.join(", ")
        )));
    }
    Ok(waves)
}

/// Deploys dependency-ordered services and tears them down in reverse.
pub struct Orchestrator {
    containers: Arc<LifecycleManager>,
    networks: Arc<NetworkManager>,
    mounts: Arc<MountResolver>,
    prober: Arc<ReadinessProber>,
    gate: HealthGate,
    stop_timeout: Duration,
}

type StepFailure = (String, EngineError);

impl Orchestrator {
    pub fn new(
        containers: Arc<LifecycleManager>,
        networks: Arc<NetworkManager>,
        mounts: Arc<MountResolver>,
        prober: Arc<ReadinessProber>,
        gate: HealthGate,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            containers,
            networks,
            mounts,
            prober,
            gate,
            stop_timeout,
        }
    }

    /// Deploys every service wave by wave. Services of one wave start in
    /// parallel; a wave only begins once every service of the previous wave
    /// is running and ready.
    ///
    /// On the first failure nothing new is created, everything already
    /// acquired is torn down and the failure is returned together with any
    /// teardown errors.
    pub async fn deploy(&self, spec: DeploymentSpec) -> Result<Deployment> {
        self.gate.ensure()?;
        let waves = deployment_order(&spec.services)?;
        let stack = Arc::new(TeardownStack::default());

        info!(
            "Deploying {} services in {} waves",
            spec.services.len(),
            waves.len()
        );

        match self.run(&spec, &waves, &stack).await {
            Ok((services, start_order, network)) => {
                info!("Deployment complete: {}", start_order.join(" -> "));
                Ok(Deployment {
                    services,
                    start_order,
                    network,
                    stack,
                })
            }
            Err((service, cause)) => {
                error!("Deployment failed at {service}: {cause}");
                let teardown = self.unwind(&stack).await;
                Err(EngineError::Deployment {
                    service,
                    cause: Box::new(cause),
                    teardown,
                })
            }
        }
    }

    async fn run(
        &self,
        spec: &DeploymentSpec,
        waves: &[Vec<usize>],
        stack: &Arc<TeardownStack>,
    ) -> std::result::Result<(BTreeMap<String, ContainerId>, Vec<String>, Option<String>), StepFailure>
    {
        let mut created_network = None;
        if let Some(network) = &spec.network {
            if self.networks.exists(&network.name) {
                info!("Reusing existing network {}", network.name);
            } else {
                self.networks
                    .create_network(network.clone())
                    .await
                    .map_err(|e| (network.name.clone(), e))?;
                stack.push(TeardownItem::Network(network.name.clone()));
                created_network = Some(network.name.clone());
            }
        }

        for volume in &spec.volumes {
            if self.mounts.inspect_volume(&volume.name).is_ok() {
                debug!("Volume {} already exists", volume.name);
                continue;
            }
            self.mounts
                .create_volume(volume.clone())
                .await
                .map_err(|e| (volume.name.clone(), e))?;
        }

        let default_network = spec.network.as_ref().map(|n| n.name.clone());
        let mut services = BTreeMap::new();
        let mut start_order = Vec::new();

        for (n, wave) in waves.iter().enumerate() {
            let names: Vec<&str> = wave.iter().map(|&i| spec.services[i].name.as_str()).collect();
            info!("Wave {}: {}", n + 1, names.join(", "));

            // Cancelled by the first failure so siblings stop before their next step.
            let abort = CancellationToken::new();
            let mut tasks = JoinSet::new();
            for &i in wave {
                let mut service = spec.services[i].clone();
                if service.config.name.is_none() {
                    service.config.name = Some(service.name.clone());
                }
                if service.config.network.is_none() {
                    service.config.network = default_network.clone();
                }

                let containers = self.containers.clone();
                let prober = self.prober.clone();
                let stack = stack.clone();
                let abort = abort.clone();
                tasks.spawn(async move {
                    let name = service.name.clone();
                    let result = bring_up(service, &containers, &prober, &stack, &abort).await;
                    if result.is_err() {
                        abort.cancel();
                    }
                    result.map_err(|e| (name, e))
                });
            }

            let mut failure: Option<StepFailure> = None;
            while let Some(joined) = tasks.join_next().await {
                let outcome = joined.unwrap_or_else(|e| {
                    abort.cancel();
                    Err((
                        format!("wave {}", n + 1),
                        EngineError::Backend(format!("deployment task failed: {e}")),
                    ))
                });
                match outcome {
                    Ok(Some((name, id))) => {
                        start_order.push(name.clone());
                        services.insert(name, id);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }

            if let Some(failure) = failure {
                return Err(failure);
            }
        }

        Ok((services, start_order, created_network))
    }

    /// Stops and deletes every container, then deletes the deployment's network.
    pub async fn teardown(&self, deployment: Deployment) -> Result<()> {
        info!("Tearing down {} services", deployment.services.len());
        let errors = self.unwind(&deployment.stack).await;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Teardown(errors))
        }
    }

    /// Best effort: every item is attempted no matter what failed before.
    async fn unwind(&self, stack: &TeardownStack) -> Vec<EngineError> {
        let mut errors = Vec::new();

        for item in stack.take_all() {
            match item {
                TeardownItem::Container { service, id } => {
                    debug!("Tearing down {service}");
                    match self.containers.stop(&id, self.stop_timeout).await {
                        // Never-started containers only need deleting.
                        Ok(()) | Err(EngineError::InvalidState(_)) => {}
                        Err(e) => {
                            warn!("Failed to stop {service}: {e}");
                            errors.push(e);
                            continue;
                        }
                    }
                    match self.containers.delete(&id).await {
                        Ok(()) | Err(EngineError::NotFound(_)) => {}
                        Err(e) => {
                            warn!("Failed to delete {service}: {e}");
                            errors.push(e);
                        }
                    }
                }
                TeardownItem::Network(name) => {
                    if let Err(e) = self.networks.delete_network(&name).await {
                        warn!("Failed to delete network {name}: {e}");
                        errors.push(e);
                    }
                }
            }
        }

        errors
    }
}

/// Create, start and probe one service. Returns `None` when a sibling in the
/// same wave failed first; whatever was created is already on the stack.
async fn bring_up(
    service: ServiceSpec,
    containers: &LifecycleManager,
    prober: &ReadinessProber,
    stack: &TeardownStack,
    abort: &CancellationToken,
) -> Result<Option<(String, ContainerId)>> {
    if abort.is_cancelled() {
        return Ok(None);
    }
    let id = containers.create(service.config).await?;
    stack.push(TeardownItem::Container {
        service: service.name.clone(),
        id: id.clone(),
    });

    if abort.is_cancelled() {
        debug!("Not starting {}: another service in its wave failed", service.name);
        return Ok(None);
    }
    containers.start(&id).await?;
    stack.mark_started(&id);

    if let Some(probe) = &service.readiness {
        tokio::select! {
            result = prober.probe(&id, probe) => {
                result?;
            }
            _ = abort.cancelled() => {
                debug!("Abandoning readiness of {}: another service in its wave failed", service.name);
                return Ok(None);
            }
        }
    }
    info!("Service {} is up", service.name);
    Ok(Some((service.name, id)))
}
