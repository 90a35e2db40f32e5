use super::volume::VolumeKind;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;

/// A mount as requested in a container configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MountRequest {
    /// Host directory or file mapped into the container.
    Bind {
        source: PathBuf,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
    /// Named volume from the registry.
    Volume {
        #[serde(rename = "source")]
        name: String,
        target: String,
        #[serde(default)]
        read_only: bool,
    },
    /// Ephemeral memory-backed filesystem.
    Tmpfs {
        target: String,
        #[serde(default)]
        size_bytes: Option<u64>,
    },
}

impl MountRequest {
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<String>, read_only: bool) -> Self {
        MountRequest::Bind {
            source: source.into(),
            target: target.into(),
            read_only,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        MountRequest::Volume {
            name: name.into(),
            target: target.into(),
            read_only,
        }
    }

    pub fn tmpfs(target: impl Into<String>, size_bytes: Option<u64>) -> Self {
        MountRequest::Tmpfs {
            target: target.into(),
            size_bytes,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            MountRequest::Bind { target, .. }
            | MountRequest::Volume { target, .. }
            | MountRequest::Tmpfs { target, .. } => target,
        }
    }

    pub fn mode(&self) -> MountMode {
        match self {
            MountRequest::Bind { read_only, .. } | MountRequest::Volume { read_only, .. } => {
                if *read_only {
                    MountMode::ReadOnly
                } else {
                    MountMode::ReadWrite
                }
            }
            MountRequest::Tmpfs { .. } => MountMode::ReadWrite,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    pub fn is_read_only(self) -> bool {
        self == MountMode::ReadOnly
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountMode::ReadOnly => write!(f, "ro"),
            MountMode::ReadWrite => write!(f, "rw"),
        }
    }
}

/// Where the mounted data actually lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    HostPath(PathBuf),
    Volume { name: String, kind: VolumeKind },
    Memory { size_bytes: Option<u64> },
}

/// A validated mount with a normalized target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    pub source: MountSource,
    pub target: String,
    pub mode: MountMode,
}

impl ResolvedMount {
    pub fn volume_name(&self) -> Option<&str> {
        match &self.source {
            MountSource::Volume { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// Order-preserving list of resolved mounts handed to the backend at launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan {
    mounts: Vec<ResolvedMount>,
}

impl MountPlan {
    pub fn new(mounts: Vec<ResolvedMount>) -> Self {
        Self { mounts }
    }

    pub fn mounts(&self) -> &[ResolvedMount] {
        &self.mounts
    }

    /// Named volumes referenced by the plan, once each.
    pub fn volume_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for name in self.mounts.iter().filter_map(ResolvedMount::volume_name) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// The mount serving `path`, picking the deepest target.
    pub fn mount_for(&self, path: &str) -> Option<&ResolvedMount> {
        self.mounts
            .iter()
            .filter(|m| path == m.target || path.starts_with(&format!("{}/", m.target)))
            .max_by_key(|m| m.target.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_mounts() {
        #[derive(Deserialize)]
        struct Wrapper {
            mounts: Vec<MountRequest>,
        }

        let parsed: Wrapper = toml::from_str(
            r#"
mounts = [
  { type = "volume", source = "pgdata", target = "/var/lib/postgresql/data" },
  { type = "bind", source = "/srv/app", target = "/app", read_only = true },
  { type = "tmpfs", target = "/tmp", size_bytes = 536870912 },
]
"#,
        )
        .unwrap();

        assert_eq!(
            parsed.mounts[0],
            MountRequest::volume("pgdata", "/var/lib/postgresql/data", false)
        );
        assert_eq!(parsed.mounts[1].mode(), MountMode::ReadOnly);
        assert_eq!(
            parsed.mounts[2],
            MountRequest::tmpfs("/tmp", Some(536_870_912))
        );
    }

    #[test]
    fn mount_for_picks_the_matching_target() {
        let plan = MountPlan::new(vec![
            ResolvedMount {
                source: MountSource::Memory { size_bytes: None },
                target: "/tmp".into(),
                mode: MountMode::ReadWrite,
            },
            ResolvedMount {
                source: MountSource::HostPath("/srv".into()),
                target: "/data".into(),
                mode: MountMode::ReadOnly,
            },
        ]);

        assert_eq!(plan.mount_for("/data/file").unwrap().target, "/data");
        assert_eq!(plan.mount_for("/data").unwrap().target, "/data");
        assert!(plan.mount_for("/database/file").is_none());
        assert!(plan.mount_for("/etc/hosts").is_none());
    }
}
