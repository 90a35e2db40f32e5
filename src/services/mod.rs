mod events;
mod lifecycle;
mod mount_resolver;
mod network_manager;
mod orchestrator;
mod prober;
mod registry;
mod system_service;

pub use events::{EngineEvent, EventBus, ProbeAttempt, ProbeOutcome};
pub use lifecycle::{ExecHandle, ExecOutput, LifecycleManager, LifecycleSettings};
pub use mount_resolver::{MountResolver, PendingPlan};
pub use network_manager::NetworkManager;
pub use orchestrator::{Deployment, DeploymentSpec, Orchestrator, ServiceSpec, deployment_order};
pub use prober::{ProbeCheck, ProbeReport, ReadinessProbe, ReadinessProber};
pub use registry::{Registry, RegistryCounts};
pub use system_service::{HealthGate, SystemService};
