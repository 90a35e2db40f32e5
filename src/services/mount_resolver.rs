use super::events::{EngineEvent, EventBus};
use super::registry::Registry;
use super::system_service::HealthGate;
use crate::domain::{
    EngineError, HypervisorBackend, MountMode, MountPlan, MountRequest, MountSource,
    ResolvedMount, Result, Volume, VolumeKind, VolumeSpec, validate_name,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub(crate) struct VolumeEntry {
    state: Mutex<VolumeState>,
}

struct VolumeState {
    volume: Volume,
    deleting: bool,
}

impl VolumeEntry {
    fn new(volume: Volume) -> Self {
        Self {
            state: Mutex::new(VolumeState {
                volume,
                deleting: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VolumeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> Volume {
        self.lock().volume.clone()
    }
}

/// Validated mounts that have not acquired their volumes yet.
#[derive(Debug, Clone)]
pub struct PendingPlan {
    plan: MountPlan,
    /// Volumes to create on commit because they did not exist at plan time.
    implicit: Vec<String>,
}

impl PendingPlan {
    pub fn plan(&self) -> &MountPlan {
        &self.plan
    }
}

/// Turns mount requests into a resolved plan and owns named volumes.
///
/// Resolution is split in two: [`MountResolver::plan`] only validates, so a
/// rejected configuration never touches the registry, and
/// [`MountResolver::commit`] creates implicit volumes and takes a user
/// reference on every volume the plan mounts.
pub struct MountResolver {
    registry: Arc<Registry>,
    backend: Arc<dyn HypervisorBackend>,
    events: EventBus,
    gate: HealthGate,
    auto_create_volumes: bool,
    create_lock: tokio::sync::Mutex<()>,
}

impl MountResolver {
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn HypervisorBackend>,
        events: EventBus,
        gate: HealthGate,
        auto_create_volumes: bool,
    ) -> Self {
        Self {
            registry,
            backend,
            events,
            gate,
            auto_create_volumes,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn plan(&self, requests: &[MountRequest]) -> Result<PendingPlan> {
        let mut mounts: Vec<ResolvedMount> = Vec::with_capacity(requests.len());
        let mut volume_modes: HashMap<&str, MountMode> = HashMap::new();
        let mut implicit = Vec::new();

        for request in requests {
            let target = normalize_target(request.target())?;

            if let Some(existing) = mounts.iter().find(|m| targets_overlap(&m.target, &target)) {
                return Err(EngineError::MountConflict(format!(
                    "{} overlaps {}",
                    target, existing.target
                )));
            }

            let source = match request {
                MountRequest::Bind { source, .. } => MountSource::HostPath(resolve_host_path(source)?),
                MountRequest::Volume { name, .. } => {
                    validate_name("volume", name)?;

                    if let Some(mode) = volume_modes.insert(name.as_str(), request.mode()) {
                        if mode != request.mode() {
                            return Err(EngineError::MountConflict(format!(
                                "volume {name} is mounted both {mode} and {}",
                                request.mode()
                            )));
                        }
                    }

                    let kind = match self.registry.volume(name) {
                        Some(entry) => entry.lock().volume.kind.clone(),
                        None if self.auto_create_volumes => {
                            if !implicit.contains(name) {
                                implicit.push(name.clone());
                            }
                            VolumeKind::Named
                        }
                        None => return Err(EngineError::SourceNotFound(format!("volume {name}"))),
                    };
                    MountSource::Volume {
                        name: name.clone(),
                        kind,
                    }
                }
                MountRequest::Tmpfs { size_bytes, .. } => MountSource::Memory {
                    size_bytes: *size_bytes,
                },
            };

            mounts.push(ResolvedMount {
                source,
                target,
                mode: request.mode(),
            });
        }

        Ok(PendingPlan {
            plan: MountPlan::new(mounts),
            implicit,
        })
    }

    /// Creates implicit volumes and takes a user reference on every volume in
    /// the plan. On failure nothing stays acquired.
    pub async fn commit(&self, pending: PendingPlan) -> Result<MountPlan> {
        for name in &pending.implicit {
            match self.create_volume(VolumeSpec::named(name.clone())).await {
                Ok(_) => debug!("Implicitly created volume {name}"),
                Err(EngineError::DuplicateName(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut acquired: Vec<Arc<VolumeEntry>> = Vec::new();
        for name in pending.plan.volume_names() {
            let entry = self.registry.volume(name).filter(|entry| {
                let mut state = entry.lock();
                if state.deleting {
                    return false;
                }
                state.volume.users += 1;
                true
            });

            match entry {
                Some(entry) => acquired.push(entry),
                None => {
                    for entry in acquired {
                        let mut state = entry.lock();
                        state.volume.users = state.volume.users.saturating_sub(1);
                    }
                    return Err(EngineError::SourceNotFound(format!("volume {name}")));
                }
            }
        }

        Ok(pending.plan)
    }

    /// Drops the user references taken by [`MountResolver::commit`].
    pub fn release(&self, plan: &MountPlan) {
        for name in plan.volume_names() {
            match self.registry.volume(name) {
                Some(entry) => {
                    let mut state = entry.lock();
                    state.volume.users = state.volume.users.saturating_sub(1);
                }
                None => warn!("Releasing unknown volume {name}"),
            }
        }
    }

    pub async fn create_volume(&self, spec: VolumeSpec) -> Result<Volume> {
        self.gate.ensure()?;
        validate_name("volume", &spec.name)?;

        let kind = match spec.kind {
            VolumeKind::Host { path } => VolumeKind::Host {
                path: resolve_host_path(&path)?,
            },
            other => other,
        };
        let size_bytes = match kind {
            VolumeKind::Tmpfs => spec.size_bytes,
            _ => None,
        };

        let _guard = self.create_lock.lock().await;
        if self.registry.has_volume(&spec.name) {
            return Err(EngineError::DuplicateName(spec.name));
        }

        let volume = Volume {
            name: spec.name,
            kind,
            size_bytes,
            labels: spec.labels,
            created_at: Utc::now(),
            users: 0,
        };

        self.backend
            .prepare_volume(&volume)
            .await
            .map_err(EngineError::backend)?;
        self.registry
            .insert_volume(&volume.name, Arc::new(VolumeEntry::new(volume.clone())))?;

        info!("Created volume {} ({:?})", volume.name, volume.kind);
        self.events.publish(EngineEvent::VolumeCreated {
            name: volume.name.clone(),
        });
        Ok(volume)
    }

    /// Deletes a volume nobody mounts. Data is discarded by the backend.
    pub async fn delete_volume(&self, name: &str) -> Result<()> {
        self.gate.ensure()?;

        let entry = self
            .registry
            .volume(name)
            .ok_or_else(|| EngineError::NotFound(format!("volume {name}")))?;

        {
            let mut state = entry.lock();
            if state.deleting {
                return Err(EngineError::NotFound(format!("volume {name}")));
            }
            if state.volume.users > 0 {
                return Err(EngineError::VolumeInUse(name.to_string()));
            }
            state.deleting = true;
        }

        if let Err(e) = self.backend.remove_volume(name).await {
            entry.lock().deleting = false;
            return Err(EngineError::backend(e));
        }
        self.registry.remove_volume(name);

        info!("Deleted volume {name}");
        self.events.publish(EngineEvent::VolumeDeleted {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn inspect_volume(&self, name: &str) -> Result<Volume> {
        self.registry
            .volume(name)
            .map(|entry| entry.snapshot())
            .ok_or_else(|| EngineError::NotFound(format!("volume {name}")))
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        let mut volumes: Vec<Volume> = self
            .registry
            .volumes()
            .iter()
            .map(|entry| entry.snapshot())
            .collect();
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        volumes
    }
}

/// Absolute, `.`-free, `..`-free form of a container path.
fn normalize_target(target: &str) -> Result<String> {
    if !target.starts_with('/') {
        return Err(EngineError::InvalidConfiguration(format!(
            "mount target '{target}' must be absolute"
        )));
    }

    let mut parts = Vec::new();
    for component in target.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                return Err(EngineError::InvalidConfiguration(format!(
                    "mount target '{target}' must not contain '..'"
                )));
            }
            part => parts.push(part),
        }
    }

    if parts.is_empty() {
        return Err(EngineError::InvalidConfiguration(
            "cannot mount over the container root".into(),
        ));
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Equal or nested by whole path components: `/data` and `/data/sub`
/// overlap, `/data` and `/database` do not.
fn targets_overlap(a: &str, b: &str) -> bool {
    a == b || b.starts_with(&format!("{a}/")) || a.starts_with(&format!("{b}/"))
}

fn resolve_host_path(source: &Path) -> Result<PathBuf> {
    let raw = source.to_string_lossy();
    let expanded = shellexpand::tilde(&raw);
    std::fs::canonicalize(expanded.as_ref())
        .map_err(|e| EngineError::SourceNotFound(format!("{}: {e}", source.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockBackend;
    use tempfile::TempDir;

    fn resolver(auto_create: bool) -> (MountResolver, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend::new());
        let resolver = MountResolver::new(
            Arc::new(Registry::new()),
            mock.clone(),
            EventBus::new(),
            HealthGate::new(true),
            auto_create,
        );
        (resolver, mock)
    }

    #[test]
    fn rejects_nested_targets() {
        let (resolver, _) = resolver(true);
        let result = resolver.plan(&[
            MountRequest::tmpfs("/data", None),
            MountRequest::tmpfs("/data/sub", None),
        ]);
        assert!(matches!(result, Err(EngineError::MountConflict(_))));

        let result = resolver.plan(&[
            MountRequest::tmpfs("/data/", None),
            MountRequest::tmpfs("/./data", None),
        ]);
        assert!(matches!(result, Err(EngineError::MountConflict(_))));
    }

    #[test]
    fn sibling_prefixes_do_not_conflict() {
        let (resolver, _) = resolver(true);
        let pending = resolver
            .plan(&[
                MountRequest::tmpfs("/data", None),
                MountRequest::tmpfs("/database", Some(1024)),
            ])
            .unwrap();
        let targets: Vec<&str> = pending
            .plan()
            .mounts()
            .iter()
            .map(|m| m.target.as_str())
            .collect();
        assert_eq!(targets, vec!["/data", "/database"]);
    }

    #[test]
    fn rejects_relative_and_escaping_targets() {
        let (resolver, _) = resolver(true);
        for target in ["data", "/data/../etc", "/"] {
            assert!(
                matches!(
                    resolver.plan(&[MountRequest::tmpfs(target, None)]),
                    Err(EngineError::InvalidConfiguration(_))
                ),
                "{target} should be rejected"
            );
        }
    }

    #[test]
    fn bind_sources_must_exist() {
        let (resolver, _) = resolver(true);
        let dir = TempDir::new().unwrap();

        let pending = resolver
            .plan(&[MountRequest::bind(dir.path(), "/app", true)])
            .unwrap();
        let mount = &pending.plan().mounts()[0];
        assert_eq!(
            mount.source,
            MountSource::HostPath(dir.path().canonicalize().unwrap())
        );
        assert_eq!(mount.mode, MountMode::ReadOnly);

        let missing = dir.path().join("missing");
        assert!(matches!(
            resolver.plan(&[MountRequest::bind(missing, "/app", false)]),
            Err(EngineError::SourceNotFound(_))
        ));
    }

    #[test]
    fn missing_volume_without_auto_create_is_not_found() {
        let (resolver, _) = resolver(false);
        assert!(matches!(
            resolver.plan(&[MountRequest::volume("pgdata", "/var/lib/postgresql/data", false)]),
            Err(EngineError::SourceNotFound(_))
        ));
    }

    #[test]
    fn same_volume_with_conflicting_modes_is_rejected() {
        let (resolver, _) = resolver(true);
        let result = resolver.plan(&[
            MountRequest::volume("shared", "/a", false),
            MountRequest::volume("shared", "/b", true),
        ]);
        assert!(matches!(result, Err(EngineError::MountConflict(_))));

        assert!(
            resolver
                .plan(&[
                    MountRequest::volume("shared", "/a", true),
                    MountRequest::volume("shared", "/b", true),
                ])
                .is_ok()
        );
    }

    #[tokio::test]
    async fn commit_creates_implicit_volumes_and_counts_users() {
        let (resolver, mock) = resolver(true);

        let pending = resolver
            .plan(&[MountRequest::volume("cache", "/cache", false)])
            .unwrap();
        assert!(resolver.list_volumes().is_empty());

        let plan = resolver.commit(pending).await.unwrap();
        assert_eq!(resolver.inspect_volume("cache").unwrap().users, 1);
        assert!(mock.get_commands().contains(&"prepare_volume:cache".to_string()));

        assert!(matches!(
            resolver.delete_volume("cache").await,
            Err(EngineError::VolumeInUse(_))
        ));

        resolver.release(&plan);
        assert_eq!(resolver.inspect_volume("cache").unwrap().users, 0);
        resolver.delete_volume("cache").await.unwrap();
        assert!(matches!(
            resolver.inspect_volume("cache"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn volume_deleted_between_plan_and_commit_is_not_found() {
        let (resolver, _) = resolver(false);
        resolver
            .create_volume(VolumeSpec::named("data"))
            .await
            .unwrap();

        let pending = resolver
            .plan(&[MountRequest::volume("data", "/data", false)])
            .unwrap();
        resolver.delete_volume("data").await.unwrap();

        assert!(matches!(
            resolver.commit(pending).await,
            Err(EngineError::SourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn volume_crud() {
        let (resolver, _) = resolver(false);
        let dir = TempDir::new().unwrap();

        resolver
            .create_volume(VolumeSpec::tmpfs("scratch", Some(64 * 1024 * 1024)))
            .await
            .unwrap();
        resolver
            .create_volume(VolumeSpec::host("site", dir.path()))
            .await
            .unwrap();

        assert!(matches!(
            resolver.create_volume(VolumeSpec::named("site")).await,
            Err(EngineError::DuplicateName(_))
        ));
        assert!(matches!(
            resolver
                .create_volume(VolumeSpec::host("ghost", dir.path().join("nope")))
                .await,
            Err(EngineError::SourceNotFound(_))
        ));

        let names: Vec<String> = resolver
            .list_volumes()
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["scratch", "site"]);
        assert_eq!(
            resolver.inspect_volume("scratch").unwrap().size_bytes,
            Some(64 * 1024 * 1024)
        );
    }
}
