use crate::domain::{ContainerConfig, NetworkSpec, Subnet, VolumeSpec, validate_name};
use crate::engine::EngineSettings;
use crate::services::{DeploymentSpec, ProbeCheck, ReadinessProbe, ServiceSpec};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_STEVEDORE_TOML_NAME: &str = "stevedore.toml";
pub const DEFAULT_STEVEDORE_TOML: &str = include_str!("../../config/default_stevedore.toml");

pub fn default_config_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/root"))
        .join(".config/stevedore")
}

pub fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    fs::create_dir_all(config_dir).with_context(|| format!("creating {:?}", config_dir))
}

#[derive(Deserialize, Debug, Default)]
pub struct LifecycleConfig {
    pub stop_timeout: Option<String>,
    pub restart_delay: Option<String>,
    pub kill_grace: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct StorageConfig {
    pub auto_create_volumes: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
pub struct NetworkConfig {
    pub subnet_pool: Option<Subnet>,
    pub subnet_prefix: Option<u8>,
}

#[derive(Deserialize, Debug, Default)]
pub struct SystemConfig {
    pub start_retries: Option<u32>,
    pub start_interval: Option<String>,
}

/// Engine-wide defaults read from `stevedore.toml`.
#[derive(Deserialize, Debug, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

impl EngineConfig {
    /// Merges another EngineConfig into self.
    /// Values from `other` overwrite values in `self` if present.
    pub fn merge(&mut self, other: EngineConfig) {
        if let Some(t) = other.lifecycle.stop_timeout {
            self.lifecycle.stop_timeout = Some(t);
        }
        if let Some(d) = other.lifecycle.restart_delay {
            self.lifecycle.restart_delay = Some(d);
        }
        if let Some(g) = other.lifecycle.kill_grace {
            self.lifecycle.kill_grace = Some(g);
        }
        if let Some(a) = other.storage.auto_create_volumes {
            self.storage.auto_create_volumes = Some(a);
        }
        if let Some(p) = other.network.subnet_pool {
            self.network.subnet_pool = Some(p);
        }
        if let Some(p) = other.network.subnet_prefix {
            self.network.subnet_prefix = Some(p);
        }
        if let Some(r) = other.system.start_retries {
            self.system.start_retries = Some(r);
        }
        if let Some(i) = other.system.start_interval {
            self.system.start_interval = Some(i);
        }
    }

    /// Fills every unset value from [`EngineSettings::default`].
    pub fn into_settings(self) -> Result<EngineSettings> {
        let mut settings = EngineSettings::default();

        if let Some(t) = self.lifecycle.stop_timeout {
            settings.stop_timeout = parse_duration(&t).context("lifecycle.stop_timeout")?;
        }
        if let Some(d) = self.lifecycle.restart_delay {
            settings.lifecycle.restart_delay =
                parse_duration(&d).context("lifecycle.restart_delay")?;
        }
        if let Some(g) = self.lifecycle.kill_grace {
            settings.lifecycle.kill_grace = parse_duration(&g).context("lifecycle.kill_grace")?;
        }
        if let Some(a) = self.storage.auto_create_volumes {
            settings.auto_create_volumes = a;
        }
        if let Some(p) = self.network.subnet_pool {
            settings.subnet_pool = p;
        }
        if let Some(p) = self.network.subnet_prefix {
            settings.subnet_prefix = p;
        }
        if settings.subnet_prefix < settings.subnet_pool.prefix() || settings.subnet_prefix > 30 {
            bail!(
                "network.subnet_prefix /{} does not fit inside pool {}",
                settings.subnet_prefix,
                settings.subnet_pool
            );
        }
        if let Some(r) = self.system.start_retries {
            settings.start_retries = r;
        }
        if let Some(i) = self.system.start_interval {
            settings.start_interval = parse_duration(&i).context("system.start_interval")?;
        }

        Ok(settings)
    }
}

/// Parses `"500ms"`, `"10s"` or `"2m"`. A bare number is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() {
        bail!("invalid duration {:?}", value);
    }
    let amount: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration {:?}", value))?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(amount)),
        "" | "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount * 60)),
        other => bail!("unknown duration unit {:?} in {:?}", other, value),
    }
}

pub fn load_engine_config(config_dir: &Path) -> Result<EngineConfig> {
    let global_config_path = config_dir.join(DEFAULT_STEVEDORE_TOML_NAME);
    let mut engine_config = EngineConfig::default();

    if global_config_path.exists() {
        let content = fs::read_to_string(&global_config_path)
            .with_context(|| format!("reading global config at {:?}", global_config_path))?;
        engine_config = toml::from_str(&content)
            .with_context(|| format!("parsing global config at {:?}", global_config_path))?;
        debug!("Loaded global config from {:?}", global_config_path);
    }

    let local_config_path = PathBuf::from("./").join(DEFAULT_STEVEDORE_TOML_NAME);
    if local_config_path.exists() {
        let content = fs::read_to_string(&local_config_path)
            .with_context(|| format!("reading local config at {:?}", local_config_path))?;
        let local_config: EngineConfig = toml::from_str(&content)
            .with_context(|| format!("parsing local config at {:?}", local_config_path))?;
        engine_config.merge(local_config);
        debug!("Merged local config from {:?}", local_config_path);
    }

    Ok(engine_config)
}

pub fn install_default_config(target_dir: &Path) -> Result<()> {
    ensure_config_dir(target_dir)?;

    let target = target_dir.join(DEFAULT_STEVEDORE_TOML_NAME);
    if target.exists() {
        info!("Keeping existing {:?}", target);
        return Ok(());
    }

    fs::write(&target, DEFAULT_STEVEDORE_TOML)
        .with_context(|| format!("writing template to {:?}", target))?;
    info!("Wrote {:?}", target);
    Ok(())
}

#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CheckDefinition {
    Exec {
        command: Vec<String>,
    },
    Tcp {
        port: u16,
    },
    Http {
        port: u16,
        #[serde(default = "default_http_path")]
        path: String,
    },
}

fn default_http_path() -> String {
    "/".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct ReadinessDefinition {
    #[serde(flatten)]
    pub check: CheckDefinition,
    pub interval: Option<String>,
    pub retries: Option<u32>,
    pub timeout: Option<String>,
}

impl ReadinessDefinition {
    pub fn into_probe(self) -> Result<ReadinessProbe> {
        let check = match self.check {
            CheckDefinition::Exec { command } => {
                if command.is_empty() {
                    bail!("exec readiness probe needs a command");
                }
                ProbeCheck::Exec { command }
            }
            CheckDefinition::Tcp { port } => ProbeCheck::Tcp { port },
            CheckDefinition::Http { port, path } => ProbeCheck::Http { port, path },
        };

        let mut probe = ReadinessProbe::new(check);
        if let Some(i) = self.interval {
            probe.interval = parse_duration(&i).context("readiness.interval")?;
        }
        if let Some(r) = self.retries {
            if r == 0 {
                bail!("readiness.retries must be at least 1");
            }
            probe.max_retries = r;
        }
        if let Some(t) = self.timeout {
            probe.attempt_timeout = parse_duration(&t).context("readiness.timeout")?;
        }
        Ok(probe)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServiceDefinition {
    #[serde(flatten)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub readiness: Option<ReadinessDefinition>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeDriver {
    #[default]
    Named,
    Tmpfs,
    Host,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct VolumeDefinition {
    #[serde(default)]
    pub driver: VolumeDriver,
    /// Required for host volumes.
    pub path: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl VolumeDefinition {
    fn into_spec(self, name: &str) -> Result<VolumeSpec> {
        let mut spec = match self.driver {
            VolumeDriver::Named => VolumeSpec::named(name),
            VolumeDriver::Tmpfs => VolumeSpec::tmpfs(name, self.size_bytes),
            VolumeDriver::Host => {
                let Some(path) = self.path else {
                    bail!("host volume '{}' needs a path", name);
                };
                let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
                VolumeSpec::host(name, expanded)
            }
        };
        spec.labels = self.labels;
        if spec.size_bytes.is_none() {
            spec.size_bytes = self.size_bytes;
        }
        Ok(spec)
    }
}

/// Declarative multi-container deployment read from TOML or YAML.
#[derive(Deserialize, Debug, Default)]
pub struct StackFile {
    pub network: Option<NetworkSpec>,
    #[serde(default)]
    pub volumes: BTreeMap<String, VolumeDefinition>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDefinition>,
}

impl StackFile {
    pub fn parse(content: &str, format: StackFormat) -> Result<Self> {
        match format {
            StackFormat::Toml => toml::from_str(content).context("parsing TOML stack"),
            StackFormat::Yaml => serde_yml::from_str(content).context("parsing YAML stack"),
        }
    }

    pub fn into_deployment(self) -> Result<DeploymentSpec> {
        if self.services.is_empty() {
            bail!("stack declares no services");
        }

        let mut volumes = Vec::with_capacity(self.volumes.len());
        for (name, definition) in self.volumes {
            validate_name("volume", &name)?;
            volumes.push(definition.into_spec(&name)?);
        }

        let mut container_names = HashSet::new();
        let mut services = Vec::with_capacity(self.services.len());
        for (name, definition) in self.services {
            validate_name("service", &name)
                .with_context(|| format!("invalid service name {:?}", name))?;

            let mut config = definition.config;
            if config.image.trim().is_empty() {
                bail!("service '{}' has no image", name);
            }
            let container = config.name.get_or_insert_with(|| name.clone());
            if !container_names.insert(container.clone()) {
                bail!("container name '{}' is used by more than one service", container);
            }

            let mut service = ServiceSpec::new(&name, config).depends_on(definition.depends_on);
            if let Some(readiness) = definition.readiness {
                service = service.with_readiness(
                    readiness
                        .into_probe()
                        .with_context(|| format!("readiness probe of '{}'", name))?,
                );
            }
            services.push(service);
        }

        Ok(DeploymentSpec {
            network: self.network,
            volumes,
            services,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFormat {
    Toml,
    Yaml,
}

impl StackFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(StackFormat::Toml),
            Some("yml") | Some("yaml") => Ok(StackFormat::Yaml),
            _ => bail!("unsupported stack file {:?} (expected .toml, .yml or .yaml)", path),
        }
    }
}

pub fn load_stack(path: &Path) -> Result<DeploymentSpec> {
    let format = StackFormat::from_path(path)?;
    let content = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let stack =
        StackFile::parse(&content, format).with_context(|| format!("parse of {:?}", path))?;
    stack
        .into_deployment()
        .with_context(|| format!("validating {:?}", path))
}
