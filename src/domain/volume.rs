use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Backing storage of a named volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeKind {
    /// Persistent volume managed by the backend.
    Named,
    /// Memory-backed volume discarded when the backend releases it.
    Tmpfs,
    /// Volume backed by an existing host directory.
    Host { path: PathBuf },
}

/// Request to create a named volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub kind: VolumeKind,
    pub size_bytes: Option<u64>,
    pub labels: BTreeMap<String, String>,
}

impl VolumeSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VolumeKind::Named,
            size_bytes: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn host(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: VolumeKind::Host { path: path.into() },
            size_bytes: None,
            labels: BTreeMap::new(),
        }
    }

    pub fn tmpfs(name: impl Into<String>, size_bytes: Option<u64>) -> Self {
        Self {
            name: name.into(),
            kind: VolumeKind::Tmpfs,
            size_bytes,
            labels: BTreeMap::new(),
        }
    }
}

/// A volume known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub kind: VolumeKind,
    /// Only meaningful for quota-bound kinds.
    pub size_bytes: Option<u64>,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Number of live containers whose configuration mounts this volume.
    pub users: usize,
}
