//! In-memory index of live containers, networks and volumes.
//!
//! The registry only holds shared references; every mutation goes through
//! the owning manager, which keeps the index consistent with its own state.

use super::lifecycle::ContainerEntry;
use super::mount_resolver::VolumeEntry;
use super::network_manager::NetworkEntry;
use crate::domain::{ContainerId, EngineError, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Default)]
struct ContainerIndex {
    by_id: HashMap<ContainerId, Arc<ContainerEntry>>,
    by_name: HashMap<String, ContainerId>,
}

#[derive(Default)]
pub struct Registry {
    containers: RwLock<ContainerIndex>,
    networks: RwLock<HashMap<String, Arc<NetworkEntry>>>,
    volumes: RwLock<HashMap<String, Arc<VolumeEntry>>>,
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_container(&self, entry: Arc<ContainerEntry>) -> Result<()> {
        let mut index = write(&self.containers);
        if index.by_name.contains_key(&entry.name) {
            return Err(EngineError::DuplicateName(entry.name.clone()));
        }
        index.by_name.insert(entry.name.clone(), entry.id.clone());
        index.by_id.insert(entry.id.clone(), entry);
        Ok(())
    }

    pub(crate) fn container(&self, id: &ContainerId) -> Result<Arc<ContainerEntry>> {
        read(&self.containers)
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("container {id}")))
    }

    /// Looks a container up by id first, then by name.
    pub(crate) fn find_container(&self, id_or_name: &str) -> Result<Arc<ContainerEntry>> {
        let index = read(&self.containers);
        let id = ContainerId::from_string(id_or_name);
        index
            .by_id
            .get(&id)
            .or_else(|| {
                index
                    .by_name
                    .get(id_or_name)
                    .and_then(|id| index.by_id.get(id))
            })
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("container {id_or_name}")))
    }

    pub fn container_name_taken(&self, name: &str) -> bool {
        read(&self.containers).by_name.contains_key(name)
    }

    pub(crate) fn remove_container(&self, id: &ContainerId) -> Option<Arc<ContainerEntry>> {
        let mut index = write(&self.containers);
        let entry = index.by_id.remove(id)?;
        index.by_name.remove(&entry.name);
        Some(entry)
    }

    pub(crate) fn containers(&self) -> Vec<Arc<ContainerEntry>> {
        read(&self.containers).by_id.values().cloned().collect()
    }

    pub(crate) fn insert_network(&self, name: &str, entry: Arc<NetworkEntry>) -> Result<()> {
        let mut networks = write(&self.networks);
        if networks.contains_key(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        networks.insert(name.to_string(), entry);
        Ok(())
    }

    pub(crate) fn network(&self, name: &str) -> Option<Arc<NetworkEntry>> {
        read(&self.networks).get(name).cloned()
    }

    pub fn has_network(&self, name: &str) -> bool {
        read(&self.networks).contains_key(name)
    }

    pub(crate) fn remove_network(&self, name: &str) -> Option<Arc<NetworkEntry>> {
        write(&self.networks).remove(name)
    }

    pub(crate) fn networks(&self) -> Vec<Arc<NetworkEntry>> {
        read(&self.networks).values().cloned().collect()
    }

    pub(crate) fn insert_volume(&self, name: &str, entry: Arc<VolumeEntry>) -> Result<()> {
        let mut volumes = write(&self.volumes);
        if volumes.contains_key(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        volumes.insert(name.to_string(), entry);
        Ok(())
    }

    pub(crate) fn volume(&self, name: &str) -> Option<Arc<VolumeEntry>> {
        read(&self.volumes).get(name).cloned()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        read(&self.volumes).contains_key(name)
    }

    pub(crate) fn remove_volume(&self, name: &str) -> Option<Arc<VolumeEntry>> {
        write(&self.volumes).remove(name)
    }

    pub(crate) fn volumes(&self) -> Vec<Arc<VolumeEntry>> {
        read(&self.volumes).values().cloned().collect()
    }

    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            containers: read(&self.containers).by_id.len(),
            networks: read(&self.networks).len(),
            volumes: read(&self.volumes).len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryCounts {
    pub containers: usize,
    pub networks: usize,
    pub volumes: usize,
}
