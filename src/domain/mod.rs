mod container;
mod error;
mod mount;
mod network;
pub mod traits;
mod volume;

pub use container::{
    ContainerConfig, ContainerId, ContainerSnapshot, ContainerState, ContainerSummary,
    NetworkSettings, PortMapping, Protocol, ResourceLimits, ResourceUsage, RestartPolicy, mac_for,
    validate_name,
};
pub use error::{EngineError, Result};
pub use mount::{MountMode, MountPlan, MountRequest, MountSource, ResolvedMount};
pub use network::{
    Attachment, HOST_NETWORK, NONE_NETWORK, Network, NetworkDriver, NetworkSpec, Subnet,
};
pub use traits::{
    BackendHandle, HypervisorBackend, ImageHandle, ImageProvider, LaunchSpec, NetworkBinding,
    ProcessHandle,
};
pub use volume::{Volume, VolumeKind, VolumeSpec};
