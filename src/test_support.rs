use crate::domain::{
    BackendHandle, HypervisorBackend, ImageHandle, ImageProvider, LaunchSpec, MountSource,
    Network, ProcessHandle, ResourceUsage, Volume, VolumeKind,
};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

const GRACEFUL_EXIT_CODE: i32 = 143;
const KILLED_EXIT_CODE: i32 = 137;
const COMMAND_NOT_FOUND: i32 = 127;

#[derive(Debug)]
struct MockInstance {
    name: String,
    spec: LaunchSpec,
    exit: Arc<watch::Sender<Option<i32>>>,
    /// Root filesystem and tmpfs contents, keyed by absolute path.
    files: HashMap<String, Vec<u8>>,
}

impl MockInstance {
    fn running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    fn handle(&self, id: &str) -> BackendHandle {
        BackendHandle {
            id: id.to_string(),
            name: self.name.clone(),
        }
    }
}

fn exit_with(exit: &watch::Sender<Option<i32>>, code: i32) {
    exit.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(code);
            true
        } else {
            false
        }
    });
}

/// Network view of a running instance, used by `ping`.
struct Peer {
    hostname: String,
    address: Ipv4Addr,
    network: String,
    routes: Vec<String>,
}

enum Outcome {
    Exit { code: i32, output: Vec<u8> },
    Sleep(Duration),
    Unknown,
}

impl Outcome {
    fn exit(code: i32) -> Self {
        Outcome::Exit {
            code,
            output: Vec::new(),
        }
    }

    fn with_output(code: i32, output: impl Into<Vec<u8>>) -> Self {
        Outcome::Exit {
            code,
            output: output.into(),
        }
    }
}

/// In-memory hypervisor backend.
///
/// Main processes and execs run through a tiny interpreter:
/// `true`, `false`, `exit N`, `echo ...`, `sleep SECS`, `write PATH TEXT...`,
/// `cat PATH` and `ping ADDR|HOST`, optionally wrapped in `sh -c "..."`.
/// Anything else runs forever as a main process and exits 127 as an exec.
#[derive(Debug)]
pub struct MockBackend {
    commands: RwLock<Vec<String>>,
    fail_on: RwLock<Vec<String>>,
    healthy: AtomicBool,
    start_brings_up: AtomicBool,
    custom_networks: AtomicBool,
    next_id: AtomicU64,
    instances: Mutex<HashMap<String, MockInstance>>,
    launches: RwLock<Vec<LaunchSpec>>,
    ignore_graceful: RwLock<HashSet<String>>,
    scripted_exits: Mutex<HashMap<String, VecDeque<i32>>>,
    scripted_execs: Mutex<HashMap<(String, String), VecDeque<i32>>>,
    volumes: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(Vec::new()),
            fail_on: RwLock::new(Vec::new()),
            healthy: AtomicBool::new(true),
            start_brings_up: AtomicBool::new(false),
            custom_networks: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            instances: Mutex::new(HashMap::new()),
            launches: RwLock::new(Vec::new()),
            ignore_graceful: RwLock::new(HashSet::new()),
            scripted_exits: Mutex::new(HashMap::new()),
            scripted_execs: Mutex::new(HashMap::new()),
            volumes: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Makes `start_system` flip the health check to healthy.
    pub fn set_start_brings_up(&self, brings_up: bool) {
        self.start_brings_up.store(brings_up, Ordering::SeqCst);
    }

    pub fn set_custom_networks(&self, supported: bool) {
        self.custom_networks.store(supported, Ordering::SeqCst);
    }

    /// Fails every call of `operation`, or only those on one target when
    /// given as `operation:target`.
    pub fn set_fail_on(&self, operation: &str) {
        self.fail_on.write().unwrap().push(operation.to_string());
    }

    pub fn clear_fail_on(&self) {
        self.fail_on.write().unwrap().clear();
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    /// The named container ignores graceful termination.
    pub fn ignore_graceful_stop(&self, name: &str) {
        self.ignore_graceful.write().unwrap().insert(name.to_string());
    }

    /// Each launch of `name` exits right away with the next code.
    pub fn script_exits(&self, name: &str, codes: impl IntoIterator<Item = i32>) {
        self.scripted_exits
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .extend(codes);
    }

    /// Each exec of `command` in `name` returns the next code; the last one sticks.
    pub fn script_exec(&self, name: &str, command: &str, codes: impl IntoIterator<Item = i32>) {
        self.scripted_execs
            .lock()
            .unwrap()
            .insert((name.to_string(), command.to_string()), codes.into_iter().collect());
    }

    /// Terminates the running main process of `name` with `code`.
    pub fn crash(&self, name: &str, code: i32) {
        let instances = self.instances.lock().unwrap();
        for instance in instances.values() {
            if instance.name == name && instance.running() {
                exit_with(&instance.exit, code);
            }
        }
    }

    pub fn launched_spec(&self, name: &str) -> Option<LaunchSpec> {
        self.launches
            .read()
            .unwrap()
            .iter()
            .rev()
            .find(|spec| spec.name == name)
            .cloned()
    }

    pub fn launch_count(&self, name: &str) -> usize {
        self.launches
            .read()
            .unwrap()
            .iter()
            .filter(|spec| spec.name == name)
            .count()
    }

    pub fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.running())
            .map(|i| i.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Contents of a file stored in a named volume.
    pub fn volume_file(&self, volume: &str, path: &str) -> Option<Vec<u8>> {
        self.volumes
            .lock()
            .unwrap()
            .get(volume)
            .and_then(|files| files.get(path.trim_start_matches('/')))
            .cloned()
    }

    fn record_command(&self, cmd: &str) {
        self.commands.write().unwrap().push(cmd.to_string());
    }

    fn check_fail(&self, operation: &str, target: &str) -> Result<()> {
        let fail_on = self.fail_on.read().unwrap();
        let targeted = format!("{operation}:{target}");
        if fail_on.iter().any(|f| f == operation || *f == targeted) {
            bail!("Mock failure on: {}", targeted);
        }
        Ok(())
    }

    fn peers(instances: &HashMap<String, MockInstance>) -> Vec<Peer> {
        instances
            .values()
            .filter(|i| i.running())
            .filter_map(|i| {
                let binding = i.spec.network.as_ref()?;
                Some(Peer {
                    hostname: i.spec.hostname.clone(),
                    address: binding.address?,
                    network: binding.network.clone(),
                    routes: binding.routes.clone(),
                })
            })
            .collect()
    }

    fn interpret(&self, instance: &mut MockInstance, peers: &[Peer], argv: &[String]) -> Outcome {
        let argv: Vec<String> = match argv {
            [shell, flag, script] if shell.ends_with("sh") && flag == "-c" => {
                script.split_whitespace().map(String::from).collect()
            }
            _ => argv.to_vec(),
        };
        let Some((program, args)) = argv.split_first() else {
            return Outcome::exit(0);
        };

        match program.as_str() {
            "true" => Outcome::exit(0),
            "false" => Outcome::exit(1),
            "exit" => Outcome::exit(args.first().and_then(|c| c.parse().ok()).unwrap_or(0)),
            "echo" => Outcome::with_output(0, format!("{}\n", args.join(" "))),
            "sleep" => Outcome::Sleep(Duration::from_secs_f64(
                args.first().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            )),
            "write" => match args {
                [path, content @ ..] => self.write_file(instance, path, content.join(" ")),
                _ => Outcome::with_output(2, "usage: write PATH CONTENT\n"),
            },
            "cat" => match args {
                [path] => self.read_file(instance, path),
                _ => Outcome::with_output(2, "usage: cat PATH\n"),
            },
            "ping" => match args {
                [target] => Self::ping(instance, peers, target),
                _ => Outcome::with_output(2, "usage: ping HOST\n"),
            },
            _ => Outcome::Unknown,
        }
    }

    fn write_file(&self, instance: &mut MockInstance, path: &str, content: String) -> Outcome {
        let path = absolute(path);
        let Some(mount) = instance.spec.mounts.mount_for(&path).cloned() else {
            instance.files.insert(path, content.into_bytes());
            return Outcome::exit(0);
        };
        if mount.mode.is_read_only() {
            return Outcome::with_output(1, format!("write: {path}: Read-only file system\n"));
        }

        let relative = relative_to(&path, &mount.target);
        match &mount.source {
            MountSource::Memory { .. } => {
                instance.files.insert(path, content.into_bytes());
                Outcome::exit(0)
            }
            MountSource::HostPath(root)
            | MountSource::Volume {
                kind: VolumeKind::Host { path: root },
                ..
            } => match std::fs::write(host_path(root, &relative), content) {
                Ok(()) => Outcome::exit(0),
                Err(e) => Outcome::with_output(1, format!("write: {path}: {e}\n")),
            },
            MountSource::Volume { name, .. } => {
                self.volumes
                    .lock()
                    .unwrap()
                    .entry(name.clone())
                    .or_default()
                    .insert(relative, content.into_bytes());
                Outcome::exit(0)
            }
        }
    }

    fn read_file(&self, instance: &MockInstance, path: &str) -> Outcome {
        let path = absolute(path);
        let missing = || Outcome::with_output(1, format!("cat: {path}: No such file or directory\n"));

        let Some(mount) = instance.spec.mounts.mount_for(&path) else {
            return instance
                .files
                .get(&path)
                .map(|c| Outcome::with_output(0, c.clone()))
                .unwrap_or_else(missing);
        };

        let relative = relative_to(&path, &mount.target);
        match &mount.source {
            MountSource::Memory { .. } => instance
                .files
                .get(&path)
                .map(|c| Outcome::with_output(0, c.clone()))
                .unwrap_or_else(missing),
            MountSource::HostPath(root)
            | MountSource::Volume {
                kind: VolumeKind::Host { path: root },
                ..
            } => std::fs::read(host_path(root, &relative))
                .map(|c| Outcome::with_output(0, c))
                .unwrap_or_else(|_| missing()),
            MountSource::Volume { name, .. } => self
                .volumes
                .lock()
                .unwrap()
                .get(name)
                .and_then(|files| files.get(&relative))
                .map(|c| Outcome::with_output(0, c.clone()))
                .unwrap_or_else(missing),
        }
    }

    fn ping(instance: &MockInstance, peers: &[Peer], target: &str) -> Outcome {
        let Some(binding) = &instance.spec.network else {
            return Outcome::with_output(1, "ping: Network is unreachable\n");
        };

        let address = target.parse::<Ipv4Addr>().ok().or_else(|| {
            instance.spec.extra_hosts.get(target).copied().or_else(|| {
                peers
                    .iter()
                    .find(|p| p.hostname == target && p.network == binding.network)
                    .map(|p| p.address)
            })
        });
        let Some(address) = address else {
            return Outcome::with_output(2, format!("ping: {target}: Name or service not known\n"));
        };

        let reachable = peers.iter().any(|p| {
            p.address == address
                && (p.network == binding.network
                    || binding.routes.contains(&p.network)
                    || p.routes.contains(&binding.network))
        });
        if reachable {
            Outcome::with_output(0, format!("64 bytes from {address}: icmp_seq=1\n"))
        } else {
            Outcome::with_output(1, format!("From {address}: Destination Host Unreachable\n"))
        }
    }
}

fn absolute(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn relative_to(path: &str, target: &str) -> String {
    path.strip_prefix(target)
        .unwrap_or(path)
        .trim_start_matches('/')
        .to_string()
}

fn host_path(root: &Path, relative: &str) -> PathBuf {
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorBackend for MockBackend {
    async fn health_check(&self) -> bool {
        self.record_command("health_check");
        self.healthy.load(Ordering::SeqCst)
    }

    async fn start_system(&self) -> Result<()> {
        self.record_command("start_system");
        self.check_fail("start_system", "")?;
        if self.start_brings_up.load(Ordering::SeqCst) {
            self.healthy.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn supports_custom_networks(&self) -> bool {
        self.custom_networks.load(Ordering::SeqCst)
    }

    async fn prepare_network(&self, network: &Network) -> Result<()> {
        self.record_command(&format!("prepare_network:{}", network.name));
        self.check_fail("prepare_network", &network.name)
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.record_command(&format!("remove_network:{}", name));
        self.check_fail("remove_network", name)
    }

    async fn prepare_volume(&self, volume: &Volume) -> Result<()> {
        self.record_command(&format!("prepare_volume:{}", volume.name));
        self.check_fail("prepare_volume", &volume.name)?;
        self.volumes
            .lock()
            .unwrap()
            .entry(volume.name.clone())
            .or_default();
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.record_command(&format!("remove_volume:{}", name));
        self.check_fail("remove_volume", name)?;
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<BackendHandle> {
        self.record_command(&format!("launch:{}", spec.name));
        self.check_fail("launch", &spec.name)?;

        let id = format!("mock-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (exit, _) = watch::channel(None);
        let mut instance = MockInstance {
            name: spec.name.clone(),
            spec: spec.clone(),
            exit: Arc::new(exit),
            files: HashMap::new(),
        };
        self.launches.write().unwrap().push(spec.clone());

        let scripted = self
            .scripted_exits
            .lock()
            .unwrap()
            .get_mut(&spec.name)
            .and_then(VecDeque::pop_front);

        let mut instances = self.instances.lock().unwrap();
        match scripted {
            Some(code) => exit_with(&instance.exit, code),
            None => {
                let peers = Self::peers(&instances);
                match self.interpret(&mut instance, &peers, &spec.command) {
                    Outcome::Exit { code, .. } if !spec.command.is_empty() => {
                        exit_with(&instance.exit, code)
                    }
                    Outcome::Sleep(duration) => {
                        let exit = instance.exit.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(duration).await;
                            exit_with(&exit, 0);
                        });
                    }
                    // Empty and unknown commands run until terminated.
                    _ => {}
                }
            }
        }

        let handle = instance.handle(&id);
        instances.insert(id, instance);
        Ok(handle)
    }

    async fn wait(&self, handle: &BackendHandle) -> Result<i32> {
        let mut exit = {
            let instances = self.instances.lock().unwrap();
            let instance = instances
                .get(&handle.id)
                .ok_or_else(|| anyhow!("no such container: {}", handle))?;
            instance.exit.subscribe()
        };
        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow!("container {} vanished", handle))?;
        code.ok_or_else(|| anyhow!("container {} has no exit code", handle))
    }

    async fn terminate(&self, handle: &BackendHandle, forced: bool) -> Result<()> {
        let mode = if forced { "forced" } else { "graceful" };
        self.record_command(&format!("terminate:{}:{}", handle.name, mode));
        self.check_fail("terminate", &handle.name)?;

        let instances = self.instances.lock().unwrap();
        let instance = instances
            .get(&handle.id)
            .ok_or_else(|| anyhow!("no such container: {}", handle))?;

        if forced {
            exit_with(&instance.exit, KILLED_EXIT_CODE);
        } else if !self.ignore_graceful.read().unwrap().contains(&handle.name) {
            exit_with(&instance.exit, GRACEFUL_EXIT_CODE);
        }
        Ok(())
    }

    async fn cleanup(&self, handle: &BackendHandle) -> Result<()> {
        self.record_command(&format!("cleanup:{}", handle.name));
        self.check_fail("cleanup", &handle.name)?;
        self.instances.lock().unwrap().remove(&handle.id);
        Ok(())
    }

    async fn exec_into(&self, handle: &BackendHandle, command: &[String]) -> Result<ProcessHandle> {
        let line = command.join(" ");
        self.record_command(&format!("exec:{}:{}", handle.name, line));
        self.check_fail("exec", &handle.name)?;

        let scripted = {
            let mut scripts = self.scripted_execs.lock().unwrap();
            scripts
                .get_mut(&(handle.name.clone(), line.clone()))
                .and_then(|codes| {
                    if codes.len() > 1 {
                        codes.pop_front()
                    } else {
                        codes.front().copied()
                    }
                })
        };

        let outcome = {
            let mut instances = self.instances.lock().unwrap();
            let peers = Self::peers(&instances);
            let instance = instances
                .get_mut(&handle.id)
                .ok_or_else(|| anyhow!("no such container: {}", handle))?;
            if !instance.running() {
                bail!("container {} is not running", handle);
            }
            match scripted {
                Some(code) => Outcome::exit(code),
                None => self.interpret(instance, &peers, command),
            }
        };

        let (output_tx, output) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        match outcome {
            Outcome::Exit { code, output } => {
                if !output.is_empty() {
                    let _ = output_tx.send(output);
                }
                let _ = exit_tx.send(Ok(code));
            }
            Outcome::Sleep(duration) => {
                tokio::spawn(async move {
                    tokio::time::sleep(duration).await;
                    drop(output_tx);
                    let _ = exit_tx.send(Ok(0));
                });
            }
            Outcome::Unknown => {
                let program = command.first().cloned().unwrap_or_default();
                let _ = output_tx.send(format!("sh: {program}: not found\n").into_bytes());
                let _ = exit_tx.send(Ok(COMMAND_NOT_FOUND));
            }
        }

        Ok(ProcessHandle { output, exit })
    }

    async fn stats(&self, handle: &BackendHandle) -> Result<Option<ResourceUsage>> {
        let instances = self.instances.lock().unwrap();
        Ok(instances
            .get(&handle.id)
            .filter(|i| i.running())
            .map(|_| ResourceUsage {
                cpu_percent: 0.5,
                memory_bytes: 64 * 1024 * 1024,
            }))
    }

    async fn list_running(&self) -> Result<Vec<BackendHandle>> {
        self.record_command("list_running");
        self.check_fail("list_running", "")?;
        let instances = self.instances.lock().unwrap();
        let mut running: Vec<BackendHandle> = instances
            .iter()
            .filter(|(_, i)| i.running())
            .map(|(id, i)| i.handle(id))
            .collect();
        running.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(running)
    }
}

/// In-memory image provider.
#[derive(Debug, Default)]
pub struct MockImages {
    commands: RwLock<Vec<String>>,
    missing: RwLock<HashSet<String>>,
    builds: AtomicU64,
}

impl MockImages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_missing(&self, reference: &str) {
        self.missing.write().unwrap().insert(reference.to_string());
    }

    pub fn get_commands(&self) -> Vec<String> {
        self.commands.read().unwrap().clone()
    }

    fn record_command(&self, cmd: &str) {
        self.commands.write().unwrap().push(cmd.to_string());
    }
}

#[async_trait]
impl ImageProvider for MockImages {
    async fn resolve(&self, reference: &str) -> Result<ImageHandle> {
        self.record_command(&format!("resolve:{}", reference));
        if self.missing.read().unwrap().contains(reference) {
            bail!("manifest unknown: {}", reference);
        }
        Ok(ImageHandle {
            reference: reference.to_string(),
            digest: Some(format!("sha256:mock-{}", reference.replace([':', '/'], "-"))),
        })
    }

    async fn build(
        &self,
        context_dir: &Path,
        _build_args: &BTreeMap<String, String>,
    ) -> Result<ImageHandle> {
        self.record_command(&format!("build:{}", context_dir.display()));
        let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ImageHandle {
            reference: format!("stevedore-build-{n}"),
            digest: None,
        })
    }
}
