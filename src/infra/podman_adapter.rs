use crate::domain::{
    BackendHandle, HypervisorBackend, ImageHandle, ImageProvider, LaunchSpec, MountSource,
    Network, NetworkDriver, ProcessHandle, ResourceUsage, Volume, VolumeKind,
};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Label put on every container launched by this engine.
pub const MANAGED_LABEL: &str = "io.stevedore.managed";

/// Hypervisor backend driving a local podman installation.
///
/// Explicit routes between networks are not forwarded: podman can only join a
/// container to the peer network, which would also expose the peer's hostnames.
/// Routed containers keep their single-network attachment.
#[derive(Debug, Clone)]
pub struct PodmanBackend {
    custom_networks: bool,
}

impl PodmanBackend {
    pub fn new() -> Self {
        Self {
            custom_networks: true,
        }
    }

    /// Rootless setups without netavark cannot create networks.
    pub fn with_custom_networks(mut self, enabled: bool) -> Self {
        self.custom_networks = enabled;
        self
    }
}

impl Default for PodmanBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorBackend for PodmanBackend {
    async fn health_check(&self) -> bool {
        podman_status(["info"], "checking podman")
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn start_system(&self) -> Result<()> {
        podman(["machine", "start"], "starting podman machine").await
    }

    fn supports_custom_networks(&self) -> bool {
        self.custom_networks
    }

    async fn prepare_network(&self, network: &Network) -> Result<()> {
        podman(
            network_create_args(network),
            &format!("creating network {}", network.name),
        )
        .await
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        podman(
            ["network", "rm", "-f", name],
            &format!("removing network {name}"),
        )
        .await
    }

    async fn prepare_volume(&self, volume: &Volume) -> Result<()> {
        podman(
            volume_create_args(volume),
            &format!("creating volume {}", volume.name),
        )
        .await
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        podman(
            ["volume", "rm", "-f", name],
            &format!("removing volume {name}"),
        )
        .await
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<BackendHandle> {
        let routes = unforwarded_routes(spec);
        if !routes.is_empty() {
            warn!(
                "podman cannot route {} to {} by address only; the routes are ignored",
                spec.name,
                routes.join(", ")
            );
        }
        let id =
            podman_output(run_args(spec), &format!("launching container {}", spec.name)).await?;
        let id = id.trim();
        if id.is_empty() {
            bail!("podman run returned no container id for {}", spec.name);
        }

        Ok(BackendHandle {
            id: id.to_string(),
            name: spec.name.clone(),
        })
    }

    async fn wait(&self, handle: &BackendHandle) -> Result<i32> {
        let output =
            podman_output(["wait", handle.id.as_str()], &format!("waiting for {handle}")).await?;
        output
            .trim()
            .parse()
            .with_context(|| format!("unexpected exit code {:?} for {handle}", output.trim()))
    }

    async fn terminate(&self, handle: &BackendHandle, forced: bool) -> Result<()> {
        let signal = if forced { "KILL" } else { "TERM" };
        podman(
            ["kill", "--signal", signal, handle.id.as_str()],
            &format!("sending SIG{signal} to {handle}"),
        )
        .await
    }

    async fn cleanup(&self, handle: &BackendHandle) -> Result<()> {
        let status =
            podman_status(["rm", "-f", handle.id.as_str()], &format!("removing {handle}")).await?;

        if !status.success() {
            warn!("Could not remove {handle} (it may already be gone)");
        }

        Ok(())
    }

    async fn exec_into(&self, handle: &BackendHandle, command: &[String]) -> Result<ProcessHandle> {
        let mut child = Command::new("podman")
            .arg("exec")
            .arg(&handle.id)
            .args(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("exec {:?} in {handle}", command))?;

        let (output_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stderr_tx = output_tx.clone();

        tokio::spawn(async move {
            let out = forward(stdout, output_tx);
            let err = forward(stderr, stderr_tx);
            let (status, _, _) = tokio::join!(child.wait(), out, err);
            let code = status
                .context("waiting for exec process")
                .map(|s| s.code().unwrap_or(-1));
            let _ = exit_tx.send(code);
        });

        Ok(ProcessHandle { output, exit })
    }

    async fn stats(&self, handle: &BackendHandle) -> Result<Option<ResourceUsage>> {
        let output = podman_output(
            [
                "stats",
                "--no-stream",
                "--format",
                "{{.CPU}} {{.MemUsage}}",
                handle.id.as_str(),
            ],
            &format!("reading stats of {handle}"),
        )
        .await?;

        Ok(parse_stats(&output))
    }

    async fn list_running(&self) -> Result<Vec<BackendHandle>> {
        let filter = format!("label={MANAGED_LABEL}=true");
        let output = podman_output(
            [
                "ps",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.ID}} {{.Names}}",
            ],
            "listing managed containers",
        )
        .await?;

        Ok(output
            .lines()
            .filter_map(|line| {
                let (id, name) = line.trim().split_once(' ')?;
                Some(BackendHandle {
                    id: id.to_string(),
                    name: name.trim().to_string(),
                })
            })
            .collect())
    }
}

/// Image provider backed by the local podman image store.
#[derive(Debug, Clone, Default)]
pub struct PodmanImages;

impl PodmanImages {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ImageProvider for PodmanImages {
    async fn resolve(&self, reference: &str) -> Result<ImageHandle> {
        let present = podman_status(
            ["image", "exists", reference],
            &format!("looking up image {reference}"),
        )
        .await?
        .success();

        if !present {
            debug!("Pulling {reference}");
            podman(["pull", "--quiet", reference], &format!("pulling {reference}")).await?;
        }

        let digest = podman_output(
            ["image", "inspect", "--format", "{{.Digest}}", reference],
            &format!("inspecting image {reference}"),
        )
        .await?;
        let digest = digest.trim();

        Ok(ImageHandle {
            reference: reference.to_string(),
            digest: (!digest.is_empty()).then(|| digest.to_string()),
        })
    }

    async fn build(
        &self,
        context_dir: &Path,
        build_args: &BTreeMap<String, String>,
    ) -> Result<ImageHandle> {
        let tag = format!("stevedore-build-{}", uuid::Uuid::new_v4().simple());

        let mut args: Vec<String> = vec!["build".into(), "-t".into(), tag.clone()];
        for (key, value) in build_args {
            args.push("--build-arg".into());
            args.push(format!("{key}={value}"));
        }
        args.push(context_dir.to_string_lossy().into_owned());

        podman(args, &format!("building image from {:?}", context_dir)).await?;

        Ok(ImageHandle {
            reference: tag,
            digest: None,
        })
    }
}

fn network_create_args(network: &Network) -> Vec<String> {
    let mut args: Vec<String> = vec!["network".into(), "create".into()];

    args.push("--driver".into());
    args.push("bridge".into());
    if network.driver == NetworkDriver::Isolated {
        args.push("--internal".into());
    }
    if let Some(subnet) = network.subnet {
        args.push("--subnet".into());
        args.push(subnet.to_string());
    }
    if let Some(gateway) = network.gateway {
        args.push("--gateway".into());
        args.push(gateway.to_string());
    }
    for server in &network.dns {
        args.push("--dns".into());
        args.push(server.clone());
    }

    args.push(network.name.clone());
    args
}

fn volume_create_args(volume: &Volume) -> Vec<String> {
    let mut args: Vec<String> = vec!["volume".into(), "create".into()];

    match &volume.kind {
        VolumeKind::Named => {}
        VolumeKind::Tmpfs => {
            args.extend(["--opt".into(), "type=tmpfs".into()]);
            args.extend(["--opt".into(), "device=tmpfs".into()]);
            if let Some(size) = volume.size_bytes {
                args.extend(["--opt".into(), format!("o=size={size}")]);
            }
        }
        VolumeKind::Host { path } => {
            args.extend(["--opt".into(), "type=none".into()]);
            args.extend(["--opt".into(), "o=bind".into()]);
            args.extend(["--opt".into(), format!("device={}", path.display())]);
        }
    }
    for (key, value) in &volume.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }

    args.push(volume.name.clone());
    args
}

fn unforwarded_routes(spec: &LaunchSpec) -> &[String] {
    spec.network
        .as_ref()
        .map(|binding| binding.routes.as_slice())
        .unwrap_or_default()
}

fn run_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        spec.name.clone(),
        "--hostname".into(),
        spec.hostname.clone(),
        "--label".into(),
        format!("{MANAGED_LABEL}=true"),
    ];

    if let Some(wd) = &spec.workdir {
        args.push("-w".into());
        args.push(wd.clone());
    }

    match &spec.network {
        Some(binding) => {
            args.push("--network".into());
            args.push(binding.network.clone());
            if let Some(address) = binding.address {
                args.push("--ip".into());
                args.push(address.to_string());
            }
            for (host, address) in &binding.hosts {
                args.push("--add-host".into());
                args.push(format!("{host}:{address}"));
            }
            for server in &binding.dns {
                args.push("--dns".into());
                args.push(server.clone());
            }
        }
        None => {
            args.push("--network".into());
            args.push("none".into());
        }
    }

    for server in &spec.dns {
        args.push("--dns".into());
        args.push(server.clone());
    }
    for (host, address) in &spec.extra_hosts {
        args.push("--add-host".into());
        args.push(format!("{host}:{address}"));
    }

    if let Some(cpus) = spec.resources.cpus {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }
    if let Some(memory) = spec.resources.memory_bytes {
        args.push("--memory".into());
        args.push(format!("{memory}b"));
    }

    for port in &spec.ports {
        args.push("-p".into());
        args.push(port.to_string());
    }

    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{key}={value}"));
    }

    for (key, value) in &spec.labels {
        args.push("--label".into());
        args.push(format!("{key}={value}"));
    }

    for mount in spec.mounts.mounts() {
        match &mount.source {
            MountSource::HostPath(path) => {
                args.push("-v".into());
                args.push(format!("{}:{}:{}", path.display(), mount.target, mount.mode));
            }
            MountSource::Volume { name, .. } => {
                args.push("-v".into());
                args.push(format!("{name}:{}:{}", mount.target, mount.mode));
            }
            MountSource::Memory { size_bytes } => {
                args.push("--tmpfs".into());
                match size_bytes {
                    Some(size) => args.push(format!("{}:size={size}", mount.target)),
                    None => args.push(mount.target.clone()),
                }
            }
        }
    }

    args.push(spec.image.reference.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn parse_stats(output: &str) -> Option<ResourceUsage> {
    let mut fields = output.split_whitespace();
    let cpu_percent = fields.next()?.trim_end_matches('%').parse().ok()?;
    let memory_bytes = fields.next()?.parse().ok()?;
    Some(ResourceUsage {
        cpu_percent,
        memory_bytes,
    })
}

async fn forward<R>(reader: Option<R>, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

async fn podman<I, S>(args: I, context: &str) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let status = podman_status(args, context).await?;
    ensure_success(status, context)
}

async fn podman_status<I, S>(args: I, context: &str) -> Result<ExitStatus>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new("podman")
        .args(args.into_iter().map(|item| item.as_ref().to_os_string()))
        .stdout(Stdio::null())
        .status()
        .await
        .with_context(|| context.to_string())
}

async fn podman_output<I, S>(args: I, context: &str) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new("podman")
        .args(args.into_iter().map(|item| item.as_ref().to_os_string()))
        .stderr(Stdio::inherit())
        .output()
        .await
        .with_context(|| context.to_string())?;

    ensure_success(output.status, context)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn ensure_success(status: ExitStatus, context: &str) -> Result<()> {
    if status.success() {
        return Ok(());
    }

    bail!("podman returned status {:?} ({context})", status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        MountMode, MountPlan, NetworkBinding, PortMapping, ResolvedMount, ResourceLimits, Subnet,
    };
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn launch_spec() -> LaunchSpec {
        LaunchSpec {
            name: "web".into(),
            image: ImageHandle {
                reference: "nginx:alpine".into(),
                digest: None,
            },
            command: vec!["nginx".into(), "-g".into(), "daemon off;".into()],
            env: BTreeMap::from([("MODE".into(), "prod".into())]),
            workdir: Some("/srv".into()),
            hostname: "web".into(),
            resources: ResourceLimits {
                cpus: Some(1.5),
                memory_bytes: Some(268_435_456),
                disk_bytes: None,
            },
            network: Some(NetworkBinding {
                network: "app".into(),
                driver: NetworkDriver::Bridge,
                address: Some(Ipv4Addr::new(10, 89, 0, 2)),
                gateway: Some(Ipv4Addr::new(10, 89, 0, 1)),
                dns: vec![],
                hosts: vec![("db".into(), Ipv4Addr::new(10, 89, 0, 3))],
                routes: vec![],
            }),
            mounts: MountPlan::new(vec![
                ResolvedMount {
                    source: MountSource::HostPath(PathBuf::from("/etc/nginx")),
                    target: "/etc/nginx".into(),
                    mode: MountMode::ReadOnly,
                },
                ResolvedMount {
                    source: MountSource::Memory {
                        size_bytes: Some(1024),
                    },
                    target: "/tmp".into(),
                    mode: MountMode::ReadWrite,
                },
            ]),
            ports: vec!["8080:80".parse::<PortMapping>().unwrap()],
            labels: BTreeMap::new(),
            dns: vec![],
            extra_hosts: BTreeMap::new(),
        }
    }

    #[test]
    fn run_args_carry_the_whole_launch_spec() {
        let args = run_args(&launch_spec()).join(" ");

        assert!(args.starts_with("run -d --name web --hostname web"));
        assert!(args.contains("--network app --ip 10.89.0.2"));
        assert!(args.contains("--add-host db:10.89.0.3"));
        assert!(args.contains("--cpus 1.5"));
        assert!(args.contains("--memory 268435456b"));
        assert!(args.contains("-p 8080:80/tcp"));
        assert!(args.contains("-e MODE=prod"));
        assert!(args.contains("-v /etc/nginx:/etc/nginx:ro"));
        assert!(args.contains("--tmpfs /tmp:size=1024"));
        assert!(args.ends_with("nginx:alpine nginx -g daemon off;"));
    }

    #[test]
    fn routes_never_join_the_peer_network() {
        let mut spec = launch_spec();
        if let Some(binding) = spec.network.as_mut() {
            binding.routes = vec!["backend".into()];
        }

        let args = run_args(&spec);
        assert_eq!(args.iter().filter(|a| *a == "--network").count(), 1);
        assert!(!args.iter().any(|a| a.contains("backend")));
        assert_eq!(unforwarded_routes(&spec), ["backend".to_string()]);

        spec.network = None;
        assert!(unforwarded_routes(&spec).is_empty());
    }

    #[test]
    fn unattached_containers_get_no_network() {
        let mut spec = launch_spec();
        spec.network = None;
        let args = run_args(&spec);
        let pos = args.iter().position(|a| a == "--network").unwrap();
        assert_eq!(args[pos + 1], "none");
    }

    #[test]
    fn isolated_networks_are_internal() {
        let subnet: Subnet = "10.89.7.0/24".parse().unwrap();
        let network = Network {
            name: "backend".into(),
            driver: NetworkDriver::Isolated,
            subnet: Some(subnet),
            gateway: None,
            dns: vec!["10.89.7.53".into()],
            attached: BTreeMap::new(),
            routes: Default::default(),
            created_at: Utc::now(),
        };

        let args = network_create_args(&network).join(" ");
        assert_eq!(
            args,
            "network create --driver bridge --internal --subnet 10.89.7.0/24 --dns 10.89.7.53 backend"
        );
    }

    #[test]
    fn host_volumes_bind_their_path() {
        let volume = Volume {
            name: "src".into(),
            kind: VolumeKind::Host {
                path: PathBuf::from("/home/dev/src"),
            },
            size_bytes: None,
            labels: BTreeMap::new(),
            created_at: Utc::now(),
            users: 0,
        };

        let args = volume_create_args(&volume).join(" ");
        assert_eq!(
            args,
            "volume create --opt type=none --opt o=bind --opt device=/home/dev/src src"
        );
    }

    #[test]
    fn parses_stats_output() {
        assert_eq!(
            parse_stats("12.5 1048576\n"),
            Some(ResourceUsage {
                cpu_percent: 12.5,
                memory_bytes: 1_048_576,
            })
        );
        assert_eq!(
            parse_stats("3.1% 42"),
            Some(ResourceUsage {
                cpu_percent: 3.1,
                memory_bytes: 42,
            })
        );
        assert_eq!(parse_stats("--"), None);
    }
}
