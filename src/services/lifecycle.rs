//! Per-container state machine.
//!
//! Every container owns an async mutex around its record, so transitions on
//! one container are serialized while different containers proceed in
//! parallel. Exit observation is decoupled from the lock: a monitor task per
//! run waits on the backend and publishes the exit code on a watch channel
//! that `stop` can await while it holds the record.

use super::events::{EngineEvent, EventBus};
use super::mount_resolver::MountResolver;
use super::network_manager::NetworkManager;
use super::registry::Registry;
use super::system_service::{HealthGate, SystemService};
use crate::domain::{
    Attachment, BackendHandle, ContainerConfig, ContainerId, ContainerSnapshot, ContainerState,
    ContainerSummary, EngineError, HypervisorBackend, ImageHandle, LaunchSpec, MountPlan,
    NetworkSettings, Result, mac_for,
};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Exit code reported when a forced kill is never confirmed by the backend.
const KILLED_EXIT_CODE: i32 = 137;
/// Exit code reported when the backend loses track of a running process.
const LOST_EXIT_CODE: i32 = 255;

#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    /// Pause before a restart policy relaunches an exited container.
    pub restart_delay: Duration,
    /// How long to wait for the exit after a forced termination.
    pub kill_grace: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_millis(500),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Externally visible status, mirrored on a watch channel for waiters.
#[derive(Debug, Clone, Copy)]
struct Status {
    state: ContainerState,
    exit_code: Option<i32>,
    /// Number of completed runs; waiters are released when it grows.
    exits: u64,
}

struct Run {
    handle: BackendHandle,
    generation: u64,
    exit: watch::Receiver<Option<i32>>,
}

struct ContainerRecord {
    config: ContainerConfig,
    hostname: String,
    image: ImageHandle,
    mounts: MountPlan,
    state: ContainerState,
    exit_code: Option<i32>,
    attachment: Option<Attachment>,
    run: Option<Run>,
    generation: u64,
    explicit_stop: bool,
    consecutive_failures: u32,
    restart_count: u32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

pub(crate) struct ContainerEntry {
    pub(crate) id: ContainerId,
    pub(crate) name: String,
    record: Mutex<ContainerRecord>,
    status: watch::Sender<Status>,
}

impl ContainerEntry {
    fn summary(&self) -> ContainerSummary {
        let status = *self.status.borrow();
        ContainerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            state: status.state,
            exit_code: status.exit_code,
        }
    }
}

/// Handle on an auxiliary process started with [`LifecycleManager::exec`].
#[derive(Debug)]
pub struct ExecHandle {
    container: ContainerId,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    exit: oneshot::Receiver<anyhow::Result<i32>>,
}

/// Exit code and combined output of a finished exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

impl ExecHandle {
    pub fn container(&self) -> &ContainerId {
        &self.container
    }

    /// Next chunk of output, `None` once the process closed its streams.
    pub async fn next_output(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }

    /// Waits for the process and returns its exit code, discarding output.
    pub async fn wait(self) -> Result<i32> {
        match self.exit.await {
            Ok(result) => result.map_err(EngineError::backend),
            Err(_) => Err(EngineError::Backend(format!(
                "exec in {} ended without an exit status",
                self.container
            ))),
        }
    }

    /// Drains the output stream, then waits for the exit code.
    pub async fn collect_output(mut self) -> Result<ExecOutput> {
        let mut output = Vec::new();
        while let Some(chunk) = self.output.recv().await {
            output.extend_from_slice(&chunk);
        }
        let exit_code = self.wait().await?;
        Ok(ExecOutput { exit_code, output })
    }
}

async fn wait_exit(exit: &mut watch::Receiver<Option<i32>>) -> Option<i32> {
    exit.wait_for(Option::is_some).await.ok().and_then(|code| *code)
}

/// Owns every container and drives it through
/// `Created -> Running -> Stopped -> Deleted`.
pub struct LifecycleManager {
    this: Weak<LifecycleManager>,
    registry: Arc<Registry>,
    backend: Arc<dyn HypervisorBackend>,
    system: Arc<SystemService>,
    networks: Arc<NetworkManager>,
    mounts: Arc<MountResolver>,
    events: EventBus,
    gate: HealthGate,
    settings: LifecycleSettings,
}

impl LifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn HypervisorBackend>,
        system: Arc<SystemService>,
        networks: Arc<NetworkManager>,
        mounts: Arc<MountResolver>,
        events: EventBus,
        gate: HealthGate,
        settings: LifecycleSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry,
            backend,
            system,
            networks,
            mounts,
            events,
            gate,
            settings,
        })
    }

    /// Validates the configuration and registers a container in `Created`.
    ///
    /// Nothing is registered unless every check passes.
    pub async fn create(&self, config: ContainerConfig) -> Result<ContainerId> {
        self.gate.ensure()?;
        config.validate()?;

        if let Some(network) = &config.network {
            if !self.networks.exists(network) {
                return Err(EngineError::NetworkNotFound(network.clone()));
            }
        }

        let image = self.system.resolve_image(&config.image).await?;
        let pending = self.mounts.plan(&config.mounts)?;

        let id = ContainerId::new();
        let name = config.name.clone().unwrap_or_else(|| id.to_string());
        let hostname = config.hostname.clone().unwrap_or_else(|| name.clone());

        if self.registry.container_name_taken(&name) {
            return Err(EngineError::DuplicateName(name));
        }

        let mounts = self.mounts.commit(pending).await?;
        let status = Status {
            state: ContainerState::Created,
            exit_code: None,
            exits: 0,
        };
        let entry = Arc::new(ContainerEntry {
            id: id.clone(),
            name: name.clone(),
            status: watch::channel(status).0,
            record: Mutex::new(ContainerRecord {
                config,
                hostname,
                image,
                mounts,
                state: ContainerState::Created,
                exit_code: None,
                attachment: None,
                run: None,
                generation: 0,
                explicit_stop: false,
                consecutive_failures: 0,
                restart_count: 0,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
            }),
        });

        if let Err(e) = self.registry.insert_container(entry.clone()) {
            self.mounts.release(&entry.record.lock().await.mounts);
            return Err(e);
        }

        info!("Created container {name} ({id})");
        self.events.publish(EngineEvent::ContainerCreated {
            id: id.clone(),
            name,
        });
        Ok(id)
    }

    /// Resolves a container id or name to its id.
    pub fn lookup(&self, id_or_name: &str) -> Result<ContainerId> {
        self.registry
            .find_container(id_or_name)
            .map(|entry| entry.id.clone())
    }

    pub async fn start(&self, id: &ContainerId) -> Result<()> {
        self.gate.ensure()?;
        let entry = self.registry.container(id)?;
        let mut record = entry.record.lock().await;

        if record.state != ContainerState::Created {
            return Err(EngineError::InvalidState(format!(
                "container {} is {}, only created containers can be started",
                entry.name, record.state
            )));
        }

        self.launch(&entry, &mut record).await
    }

    /// Attaches the network, boots the backend process and spawns its monitor.
    /// On failure the attachment is rolled back and the state is untouched.
    async fn launch(&self, entry: &Arc<ContainerEntry>, record: &mut ContainerRecord) -> Result<()> {
        let attachment = match &record.config.network {
            Some(network) => Some(self.networks.attach(&entry.id, network, &record.hostname)?),
            None => None,
        };
        let binding = attachment
            .as_ref()
            .map(|a| self.networks.binding_for(&entry.id, a));

        let spec = LaunchSpec {
            name: entry.name.clone(),
            image: record.image.clone(),
            command: record.config.command.clone(),
            env: record.config.env.clone(),
            workdir: record.config.workdir.clone(),
            hostname: record.hostname.clone(),
            resources: record.config.resources,
            network: binding,
            mounts: record.mounts.clone(),
            ports: record.config.ports.clone(),
            labels: record.config.labels.clone(),
            dns: record.config.dns.clone(),
            extra_hosts: record.config.extra_hosts.clone(),
        };

        debug!("Launching {} from {}", entry.name, record.image.reference);
        let handle = match self.backend.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(attachment) = &attachment {
                    if let Err(detach) = self.networks.detach(&entry.id, &attachment.network) {
                        warn!("Failed to release address of {}: {detach}", entry.name);
                    }
                }
                warn!("Backend failed to start {}: {e:#}", entry.name);
                return Err(EngineError::BackendStartFailure {
                    container: entry.name.clone(),
                    reason: format!("{e:#}"),
                });
            }
        };

        record.generation += 1;
        let generation = record.generation;
        let (exit_tx, exit_rx) = watch::channel(None);
        record.run = Some(Run {
            handle: handle.clone(),
            generation,
            exit: exit_rx,
        });
        record.attachment = attachment;
        record.state = ContainerState::Running;
        record.exit_code = None;
        record.explicit_stop = false;
        record.started_at = Some(Utc::now());
        record.finished_at = None;

        entry.status.send_modify(|status| {
            status.state = ContainerState::Running;
            status.exit_code = None;
        });
        info!("Container {} is running ({handle})", entry.name);
        self.events.publish(EngineEvent::ContainerStateChanged {
            id: entry.id.clone(),
            state: ContainerState::Running,
            exit_code: None,
        });

        let this = self.this.clone();
        let backend = self.backend.clone();
        let entry = entry.clone();
        tokio::spawn(async move {
            let code = match backend.wait(&handle).await {
                Ok(code) => code,
                Err(e) => {
                    warn!("Lost track of {}: {e:#}", entry.name);
                    LOST_EXIT_CODE
                }
            };
            exit_tx.send_replace(Some(code));
            if let Some(manager) = this.upgrade() {
                manager.on_exit(entry, generation, code).await;
            }
        });

        Ok(())
    }

    /// Handles an exit nobody asked for and applies the restart policy.
    async fn on_exit(&self, entry: Arc<ContainerEntry>, generation: u64, code: i32) {
        let mut record = entry.record.lock().await;
        let current = record.run.as_ref().map(|run| run.generation);
        if current != Some(generation) || record.state != ContainerState::Running {
            return;
        }

        info!("Container {} exited with code {code}", entry.name);
        self.finish_run(&entry, &mut record, code).await;

        if code == 0 {
            record.consecutive_failures = 0;
        } else {
            record.consecutive_failures += 1;
        }

        let restart = !record.explicit_stop
            && record
                .config
                .restart_policy
                .should_restart(code, record.consecutive_failures);
        if restart {
            self.schedule_restart(entry.clone(), entry.status.borrow().exits);
        } else {
            debug!(
                "Not restarting {} (policy {}, {} consecutive failures)",
                entry.name, record.config.restart_policy, record.consecutive_failures
            );
        }
    }

    fn schedule_restart(&self, entry: Arc<ContainerEntry>, exits: u64) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        let delay = self.settings.restart_delay;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut record = entry.record.lock().await;

            // Anything that happened in the meantime cancels the restart.
            if record.state != ContainerState::Stopped
                || record.explicit_stop
                || entry.status.borrow().exits != exits
            {
                return;
            }

            record.restart_count += 1;
            info!(
                "Restarting {} (restart #{})",
                entry.name, record.restart_count
            );
            manager.events.publish(EngineEvent::ContainerRestarting {
                id: entry.id.clone(),
                restart_count: record.restart_count,
            });

            if let Err(e) = manager.launch(&entry, &mut record).await {
                warn!("Restart of {} failed: {e}", entry.name);
            }
        });
    }

    /// Releases run resources and moves the record to `Stopped`.
    async fn finish_run(&self, entry: &ContainerEntry, record: &mut ContainerRecord, code: i32) {
        if let Some(run) = record.run.take() {
            if let Err(e) = self.backend.cleanup(&run.handle).await {
                warn!("Failed to clean up {}: {e:#}", run.handle);
            }
        }
        if let Some(attachment) = record.attachment.take() {
            if let Err(e) = self.networks.detach(&entry.id, &attachment.network) {
                warn!("Failed to detach {} from {}: {e}", entry.name, attachment.network);
            }
        }

        record.state = ContainerState::Stopped;
        record.exit_code = Some(code);
        record.finished_at = Some(Utc::now());

        entry.status.send_modify(|status| {
            status.state = ContainerState::Stopped;
            status.exit_code = Some(code);
            status.exits += 1;
        });
        self.events.publish(EngineEvent::ContainerStateChanged {
            id: entry.id.clone(),
            state: ContainerState::Stopped,
            exit_code: Some(code),
        });
    }

    /// Graceful stop escalating to a forced kill after `timeout`.
    ///
    /// Stopping a stopped container is a no-op that also cancels any pending
    /// restart.
    pub async fn stop(&self, id: &ContainerId, timeout: Duration) -> Result<()> {
        self.gate.ensure()?;
        let entry = self.registry.container(id)?;
        let mut record = entry.record.lock().await;

        match record.state {
            ContainerState::Running => {}
            ContainerState::Stopped => {
                record.explicit_stop = true;
                return Ok(());
            }
            state => {
                return Err(EngineError::InvalidState(format!(
                    "container {} is {state}",
                    entry.name
                )));
            }
        }
        record.explicit_stop = true;

        let (handle, mut exit) = match &record.run {
            Some(run) => (run.handle.clone(), run.exit.clone()),
            None => {
                return Err(EngineError::InvalidState(format!(
                    "container {} has no backend process",
                    entry.name
                )));
            }
        };

        info!("Stopping {} (timeout {timeout:?})", entry.name);
        if let Err(e) = self.backend.terminate(&handle, false).await {
            warn!("Graceful stop of {} failed: {e:#}", entry.name);
        }

        let code = match tokio::time::timeout(timeout, wait_exit(&mut exit)).await {
            Ok(Some(code)) => code,
            _ => {
                warn!(
                    "{} did not exit within {timeout:?}, forcing termination",
                    entry.name
                );
                self.backend
                    .terminate(&handle, true)
                    .await
                    .map_err(EngineError::backend)?;

                match tokio::time::timeout(self.settings.kill_grace, wait_exit(&mut exit)).await {
                    Ok(Some(code)) => code,
                    _ => {
                        warn!("Backend never confirmed the exit of {}", entry.name);
                        KILLED_EXIT_CODE
                    }
                }
            }
        };

        self.finish_run(&entry, &mut record, code).await;
        info!("Container {} stopped with code {code}", entry.name);
        Ok(())
    }

    /// Suspends until the container's current or next run finishes.
    ///
    /// An already stopped container returns its last exit code immediately.
    pub async fn wait(&self, id: &ContainerId) -> Result<i32> {
        self.gate.ensure()?;
        let entry = self.registry.container(id)?;
        let mut status = entry.status.subscribe();
        let initial = *status.borrow_and_update();
        drop(entry);

        match initial.state {
            ContainerState::Stopped => {
                return initial.exit_code.ok_or_else(|| {
                    EngineError::InvalidState(format!("container {id} has no exit code"))
                });
            }
            ContainerState::Deleted => {
                return Err(EngineError::NotFound(format!("container {id}")));
            }
            _ => {}
        }

        let not_found = || EngineError::NotFound(format!("container {id}"));
        let current = *status
            .wait_for(|s| s.exits > initial.exits || s.state == ContainerState::Deleted)
            .await
            .map_err(|_| not_found())?;

        if current.exits > initial.exits {
            current.exit_code.ok_or_else(not_found)
        } else {
            Err(not_found())
        }
    }

    pub async fn exec(&self, id: &ContainerId, command: &[String]) -> Result<ExecHandle> {
        self.gate.ensure()?;
        if command.is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "exec command must not be empty".into(),
            ));
        }

        let entry = self.registry.container(id)?;
        let handle = {
            let record = entry.record.lock().await;
            match (&record.state, &record.run) {
                (ContainerState::Running, Some(run)) => run.handle.clone(),
                (state, _) => {
                    return Err(EngineError::InvalidState(format!(
                        "cannot exec in {} while it is {state}",
                        entry.name
                    )));
                }
            }
        };

        debug!("Exec in {}: {:?}", entry.name, command);
        let process = self
            .backend
            .exec_into(&handle, command)
            .await
            .map_err(EngineError::backend)?;

        Ok(ExecHandle {
            container: entry.id.clone(),
            output: process.output,
            exit: process.exit,
        })
    }

    /// Removes a created or stopped container. Volumes stay.
    pub async fn delete(&self, id: &ContainerId) -> Result<()> {
        self.gate.ensure()?;
        let entry = self.registry.container(id)?;
        let mut record = entry.record.lock().await;

        match record.state {
            ContainerState::Created | ContainerState::Stopped => {}
            ContainerState::Running => {
                return Err(EngineError::InvalidState(format!(
                    "container {} is running, stop it first",
                    entry.name
                )));
            }
            ContainerState::Deleted => {
                return Err(EngineError::NotFound(format!("container {id}")));
            }
        }

        if let Some(attachment) = record.attachment.take() {
            if let Err(e) = self.networks.detach(&entry.id, &attachment.network) {
                warn!("Failed to detach {} from {}: {e}", entry.name, attachment.network);
            }
        }
        self.mounts.release(&record.mounts);
        self.registry.remove_container(&entry.id);

        record.state = ContainerState::Deleted;
        entry.status.send_modify(|status| status.state = ContainerState::Deleted);

        info!("Deleted container {}", entry.name);
        self.events.publish(EngineEvent::ContainerStateChanged {
            id: entry.id.clone(),
            state: ContainerState::Deleted,
            exit_code: record.exit_code,
        });
        Ok(())
    }

    pub async fn inspect(&self, id: &ContainerId) -> Result<ContainerSnapshot> {
        self.gate.ensure()?;
        let entry = self.registry.container(id)?;
        let record = entry.record.lock().await;

        let usage = match (&record.state, &record.run) {
            (ContainerState::Running, Some(run)) => match self.backend.stats(&run.handle).await {
                Ok(usage) => usage,
                Err(e) => {
                    debug!("No stats for {}: {e:#}", entry.name);
                    None
                }
            },
            _ => None,
        };

        let network = record.config.network.as_ref().map(|name| {
            let attachment = record.attachment.as_ref();
            let address = attachment.and_then(|a| a.address);
            NetworkSettings {
                network: name.clone(),
                address,
                gateway: attachment.and_then(|a| a.gateway),
                mac_address: address.map(mac_for),
            }
        });

        Ok(ContainerSnapshot {
            id: entry.id.clone(),
            name: entry.name.clone(),
            image: record.image.reference.clone(),
            hostname: record.hostname.clone(),
            state: record.state,
            exit_code: record.exit_code,
            network,
            labels: record.config.labels.clone(),
            restart_policy: record.config.restart_policy,
            restart_count: record.restart_count,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            usage,
        })
    }

    pub fn list_containers(&self) -> Vec<ContainerSummary> {
        let mut containers: Vec<ContainerSummary> = self
            .registry
            .containers()
            .iter()
            .map(|entry| entry.summary())
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        containers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MountRequest, NetworkDriver, NetworkSpec, RestartPolicy};
    use crate::engine::{Engine, EngineSettings};
    use crate::test_support::{MockBackend, MockImages};

    async fn engine() -> (Engine, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend::new());
        let settings = EngineSettings {
            lifecycle: LifecycleSettings {
                restart_delay: Duration::from_millis(100),
                kill_grace: Duration::from_secs(1),
            },
            ..EngineSettings::default()
        };
        let engine = Engine::boot(mock.clone(), Arc::new(MockImages::new()), settings).await;
        (engine, mock)
    }

    fn long_running(name: &str) -> ContainerConfig {
        ContainerConfig::new("postgres:16").with_name(name)
    }

    #[tokio::test]
    async fn echo_runs_to_completion_and_wait_fails_after_delete() {
        let (engine, _mock) = engine().await;
        let containers = engine.containers();

        let id = containers
            .create(ContainerConfig::new("alpine:latest").with_command(["echo", "hi"]))
            .await
            .unwrap();
        containers.start(&id).await.unwrap();

        assert_eq!(containers.wait(&id).await.unwrap(), 0);
        containers.delete(&id).await.unwrap();

        assert!(matches!(
            containers.wait(&id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_while_running_is_rejected() {
        let (engine, _mock) = engine().await;
        let containers = engine.containers();
        let id = containers.create(long_running("db")).await.unwrap();
        containers.start(&id).await.unwrap();

        assert!(matches!(
            containers.delete(&id).await,
            Err(EngineError::InvalidState(_))
        ));
        assert_eq!(
            containers.inspect(&id).await.unwrap().state,
            ContainerState::Running
        );
    }

    #[tokio::test]
    async fn start_only_from_created() {
        let (engine, _mock) = engine().await;
        let containers = engine.containers();
        let id = containers.create(long_running("db")).await.unwrap();
        containers.start(&id).await.unwrap();

        assert!(matches!(
            containers.start(&id).await,
            Err(EngineError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (engine, mock) = engine().await;
        let containers = engine.containers();
        let id = containers.create(long_running("db")).await.unwrap();
        containers.start(&id).await.unwrap();

        containers.stop(&id, Duration::from_secs(5)).await.unwrap();
        containers.stop(&id, Duration::from_secs(5)).await.unwrap();

        let snapshot = containers.inspect(&id).await.unwrap();
        assert_eq!(snapshot.state, ContainerState::Stopped);
        assert_eq!(snapshot.exit_code, Some(143));
        let terminates = mock
            .get_commands()
            .iter()
            .filter(|c| c.starts_with("terminate:db"))
            .count();
        assert_eq!(terminates, 1);
    }

    #[tokio::test]
    async fn stop_on_created_container_is_invalid() {
        let (engine, _mock) = engine().await;
        let containers = engine.containers();
        let id = containers.create(long_running("db")).await.unwrap();

        assert!(matches!(
            containers.stop(&id, Duration::from_secs(1)).await,
            Err(EngineError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_escalates_to_forced_kill_after_timeout() {
        let (engine, mock) = engine().await;
        mock.ignore_graceful_stop("stubborn");
        let containers = engine.containers();
        let id = containers.create(long_running("stubborn")).await.unwrap();
        containers.start(&id).await.unwrap();

        containers.stop(&id, Duration::from_secs(10)).await.unwrap();

        let commands = mock.get_commands();
        assert!(commands.contains(&"terminate:stubborn:graceful".to_string()));
        assert!(commands.contains(&"terminate:stubborn:forced".to_string()));
        assert_eq!(
            containers.inspect(&id).await.unwrap().exit_code,
            Some(137)
        );
    }

    #[tokio::test]
    async fn multiple_waiters_see_the_same_exit_code() {
        let (engine, mock) = engine().await;
        let containers = engine.containers();
        let id = containers.create(long_running("worker")).await.unwrap();
        containers.start(&id).await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let containers = containers.clone();
            let id = id.clone();
            waiters.push(tokio::spawn(async move { containers.wait(&id).await }));
        }
        tokio::task::yield_now().await;

        mock.crash("worker", 42);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), 42);
        }
    }

    #[tokio::test]
    async fn failed_launch_rolls_back_the_address() {
        let (engine, mock) = engine().await;
        engine
            .networks()
            .create_network(NetworkSpec::new("app", NetworkDriver::Bridge))
            .await
            .unwrap();
        let containers = engine.containers();
        let id = containers
            .create(long_running("db").with_network("app"))
            .await
            .unwrap();

        mock.set_fail_on("launch");
        let err = containers.start(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::BackendStartFailure { .. }));

        let snapshot = containers.inspect(&id).await.unwrap();
        assert_eq!(snapshot.state, ContainerState::Created);
        assert_eq!(snapshot.address(), None);
        assert!(
            engine
                .networks()
                .inspect_network("app")
                .unwrap()
                .attached
                .is_empty()
        );

        mock.clear_fail_on();
        containers.start(&id).await.unwrap();
        let snapshot = containers.inspect(&id).await.unwrap();
        assert_eq!(snapshot.state, ContainerState::Running);
        assert!(snapshot.address().is_some());
        assert!(snapshot.network.unwrap().mac_address.unwrap().starts_with("02:42:"));
    }

    #[tokio::test]
    async fn create_validates_before_registering() {
        let (engine, _mock) = engine().await;
        let containers = engine.containers();

        assert!(matches!(
            containers.create(ContainerConfig::new("")).await,
            Err(EngineError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            containers
                .create(long_running("db").with_network("missing"))
                .await,
            Err(EngineError::NetworkNotFound(_))
        ));
        assert!(matches!(
            containers
                .create(
                    long_running("db")
                        .with_mount(MountRequest::tmpfs("/data", None))
                        .with_mount(MountRequest::tmpfs("/data/sub", None))
                )
                .await,
            Err(EngineError::MountConflict(_))
        ));
        assert!(containers.list_containers().is_empty());

        containers.create(long_running("db")).await.unwrap();
        assert!(matches!(
            containers.create(long_running("db")).await,
            Err(EngineError::DuplicateName(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn on_failure_restarts_up_to_the_limit() {
        let (engine, mock) = engine().await;
        let containers = engine.containers();
        let id = containers
            .create(
                ContainerConfig::new("alpine")
                    .with_name("flaky")
                    .with_command(["exit", "1"])
                    .with_restart_policy(RestartPolicy::OnFailure { max_retries: 2 }),
            )
            .await
            .unwrap();
        containers.start(&id).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(mock.launch_count("flaky"), 3);
        let snapshot = containers.inspect(&id).await.unwrap();
        assert_eq!(snapshot.state, ContainerState::Stopped);
        assert_eq!(snapshot.restart_count, 2);
        assert_eq!(snapshot.exit_code, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_never_triggers_a_restart() {
        let (engine, mock) = engine().await;
        let containers = engine.containers();
        let id = containers
            .create(long_running("web").with_restart_policy(RestartPolicy::Always))
            .await
            .unwrap();
        containers.start(&id).await.unwrap();
        containers.stop(&id, Duration::from_secs(1)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mock.launch_count("web"), 1);
        assert_eq!(
            containers.inspect(&id).await.unwrap().state,
            ContainerState::Stopped
        );
    }

    #[tokio::test(start_paused = true)]
    async fn always_restarts_after_a_crash() {
        let (engine, mock) = engine().await;
        let containers = engine.containers();
        let id = containers
            .create(long_running("web").with_restart_policy(RestartPolicy::UnlessStopped))
            .await
            .unwrap();
        containers.start(&id).await.unwrap();

        mock.crash("web", 0);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(mock.launch_count("web"), 2);
        let snapshot = containers.inspect(&id).await.unwrap();
        assert_eq!(snapshot.state, ContainerState::Running);
        assert_eq!(snapshot.restart_count, 1);
    }

    #[tokio::test]
    async fn exec_requires_running_container() {
        let (engine, _mock) = engine().await;
        let containers = engine.containers();
        let id = containers.create(long_running("db")).await.unwrap();
        let cmd = vec!["echo".to_string(), "hello".to_string()];

        assert!(matches!(
            containers.exec(&id, &cmd).await,
            Err(EngineError::InvalidState(_))
        ));

        containers.start(&id).await.unwrap();
        let output = containers
            .exec(&id, &cmd)
            .await
            .unwrap()
            .collect_output()
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.output_lossy(), "hello\n");
    }

    #[tokio::test]
    async fn inspect_reports_usage_only_while_running() {
        let (engine, _mock) = engine().await;
        let containers = engine.containers();
        let id = containers
            .create(long_running("db").with_label("tier", "data"))
            .await
            .unwrap();
        assert!(containers.inspect(&id).await.unwrap().usage.is_none());

        containers.start(&id).await.unwrap();
        let snapshot = containers.inspect(&id).await.unwrap();
        assert!(snapshot.usage.is_some());
        assert_eq!(snapshot.labels.get("tier").map(String::as_str), Some("data"));
        assert!(snapshot.started_at.is_some());

        assert_eq!(containers.lookup("db").unwrap(), id);
    }
}
