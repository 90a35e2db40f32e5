use super::container::{PortMapping, ResourceLimits, ResourceUsage};
use super::mount::MountPlan;
use super::network::{Network, NetworkDriver};
use super::volume::Volume;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};

/// Opaque reference to a resolved or built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub reference: String,
    pub digest: Option<String>,
}

/// Backend-side identity of a launched container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendHandle {
    pub id: String,
    pub name: String,
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Network wiring handed to the backend at launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkBinding {
    pub network: String,
    pub driver: NetworkDriver,
    pub address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<String>,
    /// Hostname table of peers on the same network only.
    pub hosts: Vec<(String, Ipv4Addr)>,
    /// Other networks reachable by address through an explicit route.
    pub routes: Vec<String>,
}

/// Everything the backend needs to boot one container.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub name: String,
    pub image: ImageHandle,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub hostname: String,
    pub resources: ResourceLimits,
    pub network: Option<NetworkBinding>,
    pub mounts: MountPlan,
    pub ports: Vec<PortMapping>,
    pub labels: BTreeMap<String, String>,
    pub dns: Vec<String>,
    pub extra_hosts: BTreeMap<String, Ipv4Addr>,
}

/// Auxiliary process started inside a running container.
#[derive(Debug)]
pub struct ProcessHandle {
    /// Combined stdout/stderr chunks; closed when the process exits.
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    pub exit: oneshot::Receiver<Result<i32>>,
}

/// Hypervisor-backed container runtime. The only source of truth for
/// whether a container process is actually alive.
#[async_trait]
pub trait HypervisorBackend: Send + Sync + Debug {
    /// Process-wide health check
    async fn health_check(&self) -> bool;

    /// Boots the container system if it is not running yet
    async fn start_system(&self) -> Result<()>;

    /// Whether user-defined networks can be created at all
    fn supports_custom_networks(&self) -> bool;

    async fn prepare_network(&self, network: &Network) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn prepare_volume(&self, volume: &Volume) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Boots a container and returns once its main process is running
    async fn launch(&self, spec: &LaunchSpec) -> Result<BackendHandle>;

    /// Resolves with the exit code once the main process has exited
    async fn wait(&self, handle: &BackendHandle) -> Result<i32>;

    /// Graceful (`forced == false`) or forced termination
    async fn terminate(&self, handle: &BackendHandle, forced: bool) -> Result<()>;

    /// Releases backend resources of an exited container
    async fn cleanup(&self, handle: &BackendHandle) -> Result<()>;

    async fn exec_into(&self, handle: &BackendHandle, command: &[String]) -> Result<ProcessHandle>;

    async fn stats(&self, handle: &BackendHandle) -> Result<Option<ResourceUsage>>;

    /// Containers the backend currently runs on behalf of this engine
    async fn list_running(&self) -> Result<Vec<BackendHandle>>;
}

/// Resolves and builds images. The core only ever holds the returned handle.
#[async_trait]
pub trait ImageProvider: Send + Sync + Debug {
    async fn resolve(&self, reference: &str) -> Result<ImageHandle>;

    async fn build(
        &self,
        context_dir: &Path,
        build_args: &BTreeMap<String, String>,
    ) -> Result<ImageHandle>;
}
