pub mod cli;
pub mod domain;
pub mod engine;
pub mod infra;
pub mod services;

// In-memory collaborators shared by unit and integration tests
pub mod test_support;

pub use domain::{
    ContainerConfig, ContainerId, ContainerState, EngineError, MountRequest, NetworkDriver,
    NetworkSpec, RestartPolicy, VolumeSpec,
};
pub use engine::{Engine, EngineSettings};
pub use infra::{PodmanBackend, PodmanImages};
pub use services::{DeploymentSpec, ReadinessProbe, ServiceSpec};
