use super::error::{EngineError, Result};
use super::mount::MountRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use uuid::Uuid;

/// Container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new random 12 character id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..12].to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
    Deleted,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// What to do when the main process exits without an explicit stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum RestartPolicy {
    #[default]
    Never,
    Always,
    UnlessStopped,
    OnFailure { max_retries: u32 },
}

impl RestartPolicy {
    /// Retry budget used by a bare `on-failure`.
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Decides whether an unexpected exit should be followed by a restart.
    ///
    /// `consecutive_failures` must already include the exit being evaluated.
    pub fn should_restart(&self, exit_code: i32, consecutive_failures: u32) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure { max_retries } => {
                exit_code != 0 && consecutive_failures <= *max_retries
            }
        }
    }
}

impl FromStr for RestartPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s {
            "no" | "never" => Ok(RestartPolicy::Never),
            "always" => Ok(RestartPolicy::Always),
            "unless-stopped" => Ok(RestartPolicy::UnlessStopped),
            "on-failure" => Ok(RestartPolicy::OnFailure {
                max_retries: Self::DEFAULT_MAX_RETRIES,
            }),
            other => {
                let max = other
                    .strip_prefix("on-failure:")
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| {
                        EngineError::InvalidConfiguration(format!(
                            "unknown restart policy '{other}'"
                        ))
                    })?;
                Ok(RestartPolicy::OnFailure { max_retries: max })
            }
        }
    }
}

impl TryFrom<String> for RestartPolicy {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "no"),
            Self::Always => write!(f, "always"),
            Self::UnlessStopped => write!(f, "unless-stopped"),
            Self::OnFailure { max_retries } => write!(f, "on-failure:{max_retries}"),
        }
    }
}

/// Advisory limits forwarded verbatim to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU share, fractional values allowed.
    pub cpus: Option<f64>,
    pub memory_bytes: Option<u64>,
    pub disk_bytes: Option<u64>,
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if let Some(cpus) = self.cpus {
            if !cpus.is_finite() || cpus < 0.0 {
                return Err(EngineError::InvalidConfiguration(format!(
                    "cpu share must be a non-negative number, got {cpus}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Host port published to a container port, parsed from `8080:3000[/udp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl FromStr for PortMapping {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidConfiguration(format!("invalid port mapping '{s}'"));

        let (ports, protocol) = match s.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (s, Protocol::Tcp),
        };
        let (host, container) = ports.split_once(':').ok_or_else(invalid)?;

        Ok(PortMapping {
            host_port: host.trim().parse().map_err(|_| invalid())?,
            container_port: container.trim().parse().map_err(|_| invalid())?,
            protocol,
        })
    }
}

impl TryFrom<String> for PortMapping {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}:{}/{}", self.host_port, self.container_port, proto)
    }
}

/// Desired configuration of a container.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub hostname: Option<String>,
    pub resources: ResourceLimits,
    #[serde(rename = "restart")]
    pub restart_policy: RestartPolicy,
    pub network: Option<String>,
    pub mounts: Vec<MountRequest>,
    pub ports: Vec<PortMapping>,
    pub labels: BTreeMap<String, String>,
    pub dns: Vec<String>,
    pub extra_hosts: BTreeMap<String, Ipv4Addr>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    pub fn with_mount(mut self, mount: MountRequest) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_dns<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dns = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extra_host(mut self, host: impl Into<String>, addr: Ipv4Addr) -> Self {
        self.extra_hosts.insert(host.into(), addr);
        self
    }

    /// Checks everything that can be checked without consulting the registry.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(EngineError::InvalidConfiguration(
                "image reference must not be empty".into(),
            ));
        }
        if let Some(name) = &self.name {
            validate_name("container", name)?;
        }
        if let Some(hostname) = &self.hostname {
            validate_hostname(hostname)?;
        }
        if self.command.iter().any(|arg| arg.contains('\0')) {
            return Err(EngineError::InvalidConfiguration(
                "command arguments must not contain NUL bytes".into(),
            ));
        }
        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(EngineError::InvalidConfiguration(format!(
                    "invalid environment variable name '{key}'"
                )));
            }
        }
        if let Some(workdir) = &self.workdir {
            if !workdir.starts_with('/') {
                return Err(EngineError::InvalidConfiguration(format!(
                    "working directory must be absolute, got '{workdir}'"
                )));
            }
        }
        for host in self.extra_hosts.keys() {
            validate_hostname(host)?;
        }
        self.resources.validate()
    }
}

/// Names may start with a letter or digit and contain `[A-Za-z0-9_.-]`.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(EngineError::InvalidConfiguration(format!(
            "{kind} name must not be empty"
        )));
    };
    if !first.is_ascii_alphanumeric() {
        return Err(EngineError::InvalidConfiguration(format!(
            "{kind} name '{name}' must start with a letter or digit"
        )));
    }
    if let Some(c) = chars.find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '.' | '-')) {
        return Err(EngineError::InvalidConfiguration(format!(
            "{kind} name '{name}' contains invalid character '{c}'"
        )));
    }
    Ok(())
}

fn validate_hostname(hostname: &str) -> Result<()> {
    let valid = !hostname.is_empty()
        && hostname.len() <= 253
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidConfiguration(format!(
            "invalid hostname '{hostname}'"
        )))
    }
}

/// Resource usage as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Network view of a container inside an inspection snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSettings {
    pub network: String,
    pub address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub mac_address: Option<String>,
}

/// Read-only snapshot returned by `inspect`.
#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub state: ContainerState,
    pub exit_code: Option<i32>,
    pub network: Option<NetworkSettings>,
    pub labels: BTreeMap<String, String>,
    pub restart_policy: RestartPolicy,
    pub restart_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub usage: Option<ResourceUsage>,
}

impl ContainerSnapshot {
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.network.as_ref().and_then(|n| n.address)
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub name: String,
    pub state: ContainerState,
    pub exit_code: Option<i32>,
}

/// Locally administered MAC derived from an IPv4 address.
pub fn mac_for(addr: Ipv4Addr) -> String {
    let [a, b, c, d] = addr.octets();
    format!("02:42:{a:02x}:{b:02x}:{c:02x}:{d:02x}")
}
