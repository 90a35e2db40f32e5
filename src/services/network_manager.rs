use super::events::{EngineEvent, EventBus};
use super::registry::Registry;
use super::system_service::HealthGate;
use crate::domain::{
    Attachment, ContainerId, EngineError, HOST_NETWORK, HypervisorBackend, NONE_NETWORK, Network,
    NetworkBinding, NetworkDriver, NetworkSpec, Result, Subnet, validate_name,
};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub(crate) struct NetworkEntry {
    state: Mutex<NetworkState>,
}

struct NetworkState {
    network: Network,
    /// Set while the backend removes the network; attaches fail cleanly.
    deleting: bool,
}

impl NetworkEntry {
    fn new(network: Network) -> Self {
        Self {
            state: Mutex::new(NetworkState {
                network,
                deleting: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn snapshot(&self) -> Network {
        self.lock().network.clone()
    }
}

/// Creates and deletes network domains, attaches containers and hands out
/// addresses. Containers on different networks never see each other unless
/// an explicit route connects the two networks, and even then only by address.
pub struct NetworkManager {
    registry: Arc<Registry>,
    backend: Arc<dyn HypervisorBackend>,
    events: EventBus,
    gate: HealthGate,
    custom_networks: bool,
    pool: Subnet,
    prefix: u8,
    /// Serializes subnet selection with registry insertion.
    create_lock: tokio::sync::Mutex<()>,
}

impl NetworkManager {
    pub fn new(
        registry: Arc<Registry>,
        backend: Arc<dyn HypervisorBackend>,
        events: EventBus,
        gate: HealthGate,
        pool: Subnet,
        prefix: u8,
    ) -> Self {
        let custom_networks = backend.supports_custom_networks();
        debug!("Backend custom network support: {custom_networks}");

        for (name, driver) in [
            (HOST_NETWORK, NetworkDriver::Host),
            (NONE_NETWORK, NetworkDriver::None),
        ] {
            let builtin = Network {
                name: name.to_string(),
                driver,
                subnet: None,
                gateway: None,
                dns: Vec::new(),
                attached: BTreeMap::new(),
                routes: BTreeSet::new(),
                created_at: Utc::now(),
            };
            if registry
                .insert_network(name, Arc::new(NetworkEntry::new(builtin)))
                .is_err()
            {
                debug!("Builtin network {name} already registered");
            }
        }

        Self {
            registry,
            backend,
            events,
            gate,
            custom_networks,
            pool,
            prefix,
            create_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Capability flag queried once at construction.
    pub fn supports_custom_networks(&self) -> bool {
        self.custom_networks
    }

    pub async fn create_network(&self, spec: NetworkSpec) -> Result<Network> {
        self.gate.ensure()?;
        validate_name("network", &spec.name)?;

        if !spec.driver.is_user_defined() {
            return Err(EngineError::InvalidConfiguration(format!(
                "driver '{}' is reserved for the builtin {} network",
                spec.driver, spec.driver
            )));
        }
        if !self.custom_networks {
            return Err(EngineError::InvalidConfiguration(
                "backend does not support custom networks".into(),
            ));
        }

        let _guard = self.create_lock.lock().await;

        if self.registry.has_network(&spec.name) {
            return Err(EngineError::DuplicateName(spec.name));
        }

        let taken: Vec<Subnet> = self
            .registry
            .networks()
            .iter()
            .filter_map(|entry| entry.lock().network.subnet)
            .collect();

        let subnet = match spec.subnet {
            Some(subnet) => {
                if let Some(clash) = taken.iter().find(|t| t.overlaps(&subnet)) {
                    return Err(EngineError::InvalidConfiguration(format!(
                        "subnet {subnet} overlaps existing subnet {clash}"
                    )));
                }
                subnet
            }
            None => self.next_free_subnet(&taken)?,
        };

        let gateway = match spec.driver {
            NetworkDriver::Bridge => Some(subnet.gateway()),
            _ => None,
        };

        let network = Network {
            name: spec.name.clone(),
            driver: spec.driver,
            subnet: Some(subnet),
            gateway,
            dns: spec.dns,
            attached: BTreeMap::new(),
            routes: BTreeSet::new(),
            created_at: Utc::now(),
        };

        self.backend
            .prepare_network(&network)
            .await
            .map_err(EngineError::backend)?;

        if let Err(e) = self
            .registry
            .insert_network(&network.name, Arc::new(NetworkEntry::new(network.clone())))
        {
            if let Err(cleanup) = self.backend.remove_network(&network.name).await {
                warn!("Failed to roll back network {}: {cleanup:#}", network.name);
            }
            return Err(e);
        }

        info!(
            "Created network {} ({}, {})",
            network.name, network.driver, subnet
        );
        self.events.publish(EngineEvent::NetworkCreated {
            name: network.name.clone(),
        });
        Ok(network)
    }

    fn next_free_subnet(&self, taken: &[Subnet]) -> Result<Subnet> {
        (0..)
            .map_while(|i| self.pool.nth_child(self.prefix, i))
            .find(|candidate| !taken.iter().any(|t| t.overlaps(candidate)))
            .ok_or_else(|| EngineError::AddressExhausted(format!("subnet pool {}", self.pool)))
    }

    pub async fn delete_network(&self, name: &str) -> Result<()> {
        self.gate.ensure()?;

        if name == HOST_NETWORK || name == NONE_NETWORK {
            return Err(EngineError::InvalidConfiguration(format!(
                "builtin network {name} cannot be deleted"
            )));
        }

        let entry = self
            .registry
            .network(name)
            .ok_or_else(|| EngineError::NotFound(format!("network {name}")))?;

        {
            let mut state = entry.lock();
            if state.deleting {
                return Err(EngineError::NotFound(format!("network {name}")));
            }
            if !state.network.attached.is_empty() {
                return Err(EngineError::NetworkInUse(name.to_string()));
            }
            state.deleting = true;
        }

        if let Err(e) = self.backend.remove_network(name).await {
            entry.lock().deleting = false;
            return Err(EngineError::backend(e));
        }

        self.registry.remove_network(name);
        for other in self.registry.networks() {
            other.lock().network.routes.remove(name);
        }

        info!("Deleted network {name}");
        self.events.publish(EngineEvent::NetworkDeleted {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Adds the container to the network and assigns the lowest free address.
    ///
    /// When two attaches race for the last address the first to take the
    /// network lock wins and the other fails with `AddressExhausted`.
    pub fn attach(
        &self,
        container: &ContainerId,
        network: &str,
        hostname: &str,
    ) -> Result<Attachment> {
        let entry = self
            .registry
            .network(network)
            .ok_or_else(|| EngineError::NetworkNotFound(network.to_string()))?;

        // Checked before taking this network's lock: `network_of` locks every entry.
        if let Some(current) = self.network_of(container).filter(|n| n != network) {
            return Err(EngineError::InvalidState(format!(
                "container {container} is already attached to network {current}"
            )));
        }

        let mut state = entry.lock();
        if state.deleting {
            return Err(EngineError::NetworkNotFound(network.to_string()));
        }
        if let Some(existing) = state.network.attached.get(container) {
            return Ok(existing.clone());
        }

        let attachment = match state.network.subnet {
            Some(subnet) if state.network.driver.is_user_defined() => {
                if state
                    .network
                    .attached
                    .values()
                    .any(|a| a.hostname == hostname)
                {
                    return Err(EngineError::DuplicateName(format!(
                        "hostname {hostname} on network {network}"
                    )));
                }

                let used: HashSet<Ipv4Addr> = state
                    .network
                    .attached
                    .values()
                    .filter_map(|a| a.address)
                    .collect();
                let address = subnet
                    .hosts()
                    .find(|candidate| !used.contains(candidate))
                    .ok_or_else(|| EngineError::AddressExhausted(network.to_string()))?;

                Attachment {
                    network: network.to_string(),
                    hostname: hostname.to_string(),
                    address: Some(address),
                    gateway: state.network.gateway,
                }
            }
            _ => Attachment {
                network: network.to_string(),
                hostname: hostname.to_string(),
                address: None,
                gateway: None,
            },
        };

        state
            .network
            .attached
            .insert(container.clone(), attachment.clone());
        drop(state);

        debug!(
            "Attached {container} to {network} with address {:?}",
            attachment.address
        );
        self.events.publish(EngineEvent::ContainerAttached {
            id: container.clone(),
            network: network.to_string(),
            address: attachment.address,
        });
        Ok(attachment)
    }

    /// Removes the container from the network; its address becomes reusable.
    pub fn detach(&self, container: &ContainerId, network: &str) -> Result<()> {
        let entry = self
            .registry
            .network(network)
            .ok_or_else(|| EngineError::NetworkNotFound(network.to_string()))?;

        let removed = entry.lock().network.attached.remove(container);
        if removed.is_none() {
            return Err(EngineError::NotFound(format!(
                "container {container} on network {network}"
            )));
        }

        debug!("Detached {container} from {network}");
        self.events.publish(EngineEvent::ContainerDetached {
            id: container.clone(),
            network: network.to_string(),
        });
        Ok(())
    }

    /// Installs a bidirectional route so members of `a` and `b` can reach
    /// each other by address. Hostname resolution stays network-local.
    pub fn connect_routes(&self, a: &str, b: &str) -> Result<()> {
        self.gate.ensure()?;
        if a == b {
            return Err(EngineError::InvalidConfiguration(format!(
                "cannot route network {a} to itself"
            )));
        }
        let left = self.user_network(a)?;
        let right = self.user_network(b)?;

        left.lock().network.routes.insert(b.to_string());
        right.lock().network.routes.insert(a.to_string());
        info!("Connected routes between {a} and {b}");
        Ok(())
    }

    pub fn disconnect_routes(&self, a: &str, b: &str) -> Result<()> {
        self.gate.ensure()?;
        let left = self.user_network(a)?;
        let right = self.user_network(b)?;

        left.lock().network.routes.remove(b);
        right.lock().network.routes.remove(a);
        Ok(())
    }

    fn user_network(&self, name: &str) -> Result<Arc<NetworkEntry>> {
        let entry = self
            .registry
            .network(name)
            .ok_or_else(|| EngineError::NetworkNotFound(name.to_string()))?;
        if entry.lock().network.is_builtin() {
            return Err(EngineError::InvalidConfiguration(format!(
                "builtin network {name} cannot carry routes"
            )));
        }
        Ok(entry)
    }

    /// Network the container is currently attached to, if any.
    pub fn network_of(&self, container: &ContainerId) -> Option<String> {
        self.registry.networks().iter().find_map(|entry| {
            let state = entry.lock();
            state
                .network
                .attached
                .contains_key(container)
                .then(|| state.network.name.clone())
        })
    }

    /// Resolves a hostname as seen from inside `from`. Only members of the
    /// same user-defined network are visible.
    pub fn resolve(&self, from: &ContainerId, hostname: &str) -> Option<Ipv4Addr> {
        let name = self.network_of(from)?;
        let entry = self.registry.network(&name)?;
        let state = entry.lock();
        if state.network.is_builtin() {
            return None;
        }
        state
            .network
            .attached
            .values()
            .find(|a| a.hostname == hostname)
            .and_then(|a| a.address)
    }

    /// Whether traffic from `from` can reach `target`.
    pub fn can_reach(&self, from: &ContainerId, target: Ipv4Addr) -> bool {
        let Some(name) = self.network_of(from) else {
            return false;
        };
        let Some(entry) = self.registry.network(&name) else {
            return false;
        };

        let routes = {
            let state = entry.lock();
            if state.network.is_builtin() {
                return false;
            }
            if state
                .network
                .attached
                .values()
                .any(|a| a.address == Some(target))
            {
                return true;
            }
            state.network.routes.clone()
        };

        routes.iter().any(|peer| {
            self.registry.network(peer).is_some_and(|entry| {
                entry
                    .lock()
                    .network
                    .attached
                    .values()
                    .any(|a| a.address == Some(target))
            })
        })
    }

    /// Wiring for the backend: peer hosts table, DNS and routes.
    pub fn binding_for(&self, container: &ContainerId, attachment: &Attachment) -> NetworkBinding {
        let Some(entry) = self.registry.network(&attachment.network) else {
            return NetworkBinding {
                network: attachment.network.clone(),
                driver: NetworkDriver::None,
                address: None,
                gateway: None,
                dns: Vec::new(),
                hosts: Vec::new(),
                routes: Vec::new(),
            };
        };

        let state = entry.lock();
        let hosts = if state.network.is_builtin() {
            Vec::new()
        } else {
            state
                .network
                .attached
                .iter()
                .filter(|(id, _)| *id != container)
                .filter_map(|(_, a)| a.address.map(|addr| (a.hostname.clone(), addr)))
                .collect()
        };

        NetworkBinding {
            network: state.network.name.clone(),
            driver: state.network.driver,
            address: attachment.address,
            gateway: attachment.gateway,
            dns: state.network.dns.clone(),
            hosts,
            routes: state.network.routes.iter().cloned().collect(),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.registry
            .network(name)
            .is_some_and(|entry| !entry.lock().deleting)
    }

    pub fn inspect_network(&self, name: &str) -> Result<Network> {
        self.registry
            .network(name)
            .map(|entry| entry.snapshot())
            .ok_or_else(|| EngineError::NotFound(format!("network {name}")))
    }

    pub fn list_networks(&self) -> Vec<Network> {
        let mut networks: Vec<Network> = self
            .registry
            .networks()
            .iter()
            .map(|entry| entry.snapshot())
            .collect();
        networks.sort_by(|a, b| a.name.cmp(&b.name));
        networks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockBackend;

    fn manager_with(mock: Arc<MockBackend>) -> NetworkManager {
        NetworkManager::new(
            Arc::new(Registry::new()),
            mock,
            EventBus::new(),
            HealthGate::new(true),
            "10.89.0.0/16".parse().unwrap(),
            24,
        )
    }

    fn manager() -> (NetworkManager, Arc<MockBackend>) {
        let mock = Arc::new(MockBackend::new());
        (manager_with(mock.clone()), mock)
    }

    fn id(s: &str) -> ContainerId {
        ContainerId::from_string(s)
    }

    #[tokio::test]
    async fn creates_networks_with_distinct_subnets() {
        let (manager, mock) = manager();

        let a = manager
            .create_network(NetworkSpec::new("app", NetworkDriver::Bridge))
            .await
            .unwrap();
        let b = manager
            .create_network(NetworkSpec::new("backend", NetworkDriver::Isolated))
            .await
            .unwrap();

        assert_eq!(a.subnet.unwrap().to_string(), "10.89.0.0/24");
        assert_eq!(b.subnet.unwrap().to_string(), "10.89.1.0/24");
        assert_eq!(a.gateway, Some(Ipv4Addr::new(10, 89, 0, 1)));
        assert_eq!(b.gateway, None);
        assert!(mock.get_commands().contains(&"prepare_network:app".to_string()));
    }

    #[tokio::test]
    async fn rejects_duplicate_names_and_overlapping_subnets() {
        let (manager, _mock) = manager();
        manager
            .create_network(
                NetworkSpec::new("app", NetworkDriver::Bridge)
                    .with_subnet("172.30.0.0/16".parse().unwrap()),
            )
            .await
            .unwrap();

        let dup = manager
            .create_network(NetworkSpec::new("app", NetworkDriver::Bridge))
            .await;
        assert!(matches!(dup, Err(EngineError::DuplicateName(_))));

        let overlap = manager
            .create_network(
                NetworkSpec::new("other", NetworkDriver::Bridge)
                    .with_subnet("172.30.5.0/24".parse().unwrap()),
            )
            .await;
        assert!(matches!(overlap, Err(EngineError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn builtin_drivers_and_networks_are_reserved() {
        let (manager, _mock) = manager();

        let host = manager
            .create_network(NetworkSpec::new("mine", NetworkDriver::Host))
            .await;
        assert!(matches!(host, Err(EngineError::InvalidConfiguration(_))));

        let delete = manager.delete_network(HOST_NETWORK).await;
        assert!(matches!(delete, Err(EngineError::InvalidConfiguration(_))));
        assert!(manager.exists(NONE_NETWORK));
    }

    #[tokio::test]
    async fn custom_networks_require_backend_support() {
        let mock = Arc::new(MockBackend::new());
        mock.set_custom_networks(false);
        let manager = manager_with(mock);

        assert!(!manager.supports_custom_networks());
        let result = manager
            .create_network(NetworkSpec::new("app", NetworkDriver::Bridge))
            .await;
        assert!(matches!(result, Err(EngineError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn allocates_sequentially_and_reuses_after_detach() {
        let (manager, _mock) = manager();
        manager
            .create_network(NetworkSpec::new("app", NetworkDriver::Bridge))
            .await
            .unwrap();

        let a = manager.attach(&id("a"), "app", "a").unwrap();
        let b = manager.attach(&id("b"), "app", "b").unwrap();
        assert_eq!(a.address, Some(Ipv4Addr::new(10, 89, 0, 2)));
        assert_eq!(b.address, Some(Ipv4Addr::new(10, 89, 0, 3)));

        // Re-attaching is idempotent.
        assert_eq!(manager.attach(&id("a"), "app", "a").unwrap(), a);

        manager.detach(&id("a"), "app").unwrap();
        let c = manager.attach(&id("c"), "app", "c").unwrap();
        assert_eq!(c.address, Some(Ipv4Addr::new(10, 89, 0, 2)));

        assert!(matches!(
            manager.detach(&id("a"), "app"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn a_container_joins_at_most_one_network() {
        let (manager, _mock) = manager();
        for name in ["a", "b"] {
            manager
                .create_network(NetworkSpec::new(name, NetworkDriver::Bridge))
                .await
                .unwrap();
        }

        manager.attach(&id("c1"), "a", "c1").unwrap();
        assert!(matches!(
            manager.attach(&id("c1"), "b", "c1"),
            Err(EngineError::InvalidState(_))
        ));
        assert_eq!(manager.inspect_network("b").unwrap().attached.len(), 0);

        manager.detach(&id("c1"), "a").unwrap();
        manager.attach(&id("c1"), "b", "c1").unwrap();
        assert_eq!(manager.network_of(&id("c1")).as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn rejects_duplicate_hostnames_within_a_network() {
        let (manager, _mock) = manager();
        manager
            .create_network(NetworkSpec::new("app", NetworkDriver::Bridge))
            .await
            .unwrap();

        manager.attach(&id("a"), "app", "db").unwrap();
        assert!(matches!(
            manager.attach(&id("b"), "app", "db"),
            Err(EngineError::DuplicateName(_))
        ));
    }

    #[tokio::test]
    async fn exhausted_subnet_fails_the_late_attach() {
        let (manager, _mock) = manager();
        manager
            .create_network(
                NetworkSpec::new("tiny", NetworkDriver::Bridge)
                    .with_subnet("192.168.77.0/30".parse().unwrap()),
            )
            .await
            .unwrap();

        let manager = Arc::new(manager);
        let mut tasks = Vec::new();
        for name in ["first", "second"] {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.attach(&ContainerId::from_string(name), "tiny", name)
            }));
        }

        let mut ok = 0;
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(EngineError::AddressExhausted(_)) => exhausted += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!((ok, exhausted), (1, 1));
    }

    #[tokio::test]
    async fn delete_fails_while_containers_are_attached() {
        let (manager, mock) = manager();
        manager
            .create_network(NetworkSpec::new("app", NetworkDriver::Bridge))
            .await
            .unwrap();
        manager.attach(&id("a"), "app", "a").unwrap();

        assert!(matches!(
            manager.delete_network("app").await,
            Err(EngineError::NetworkInUse(_))
        ));

        manager.detach(&id("a"), "app").unwrap();
        manager.delete_network("app").await.unwrap();
        assert!(!manager.exists("app"));
        assert!(mock.get_commands().contains(&"remove_network:app".to_string()));

        assert!(matches!(
            manager.attach(&id("a"), "app", "a"),
            Err(EngineError::NetworkNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_backend_removal_keeps_the_network() {
        let (manager, mock) = manager();
        manager
            .create_network(NetworkSpec::new("app", NetworkDriver::Bridge))
            .await
            .unwrap();
        mock.set_fail_on("remove_network");

        assert!(matches!(
            manager.delete_network("app").await,
            Err(EngineError::Backend(_))
        ));
        assert!(manager.exists("app"));
        assert!(manager.attach(&id("a"), "app", "a").is_ok());
    }

    #[tokio::test]
    async fn isolates_members_of_distinct_networks() {
        let (manager, _mock) = manager();
        for name in ["isolated-1", "isolated-2"] {
            manager
                .create_network(NetworkSpec::new(name, NetworkDriver::Bridge))
                .await
                .unwrap();
        }

        let one = manager.attach(&id("c1"), "isolated-1", "container1").unwrap();
        let two = manager.attach(&id("c2"), "isolated-2", "container2").unwrap();
        let peer = manager.attach(&id("c3"), "isolated-1", "peer").unwrap();

        assert!(!manager.can_reach(&id("c1"), two.address.unwrap()));
        assert!(!manager.can_reach(&id("c2"), one.address.unwrap()));
        assert_eq!(manager.resolve(&id("c1"), "container2"), None);

        assert!(manager.can_reach(&id("c1"), peer.address.unwrap()));
        assert_eq!(manager.resolve(&id("c1"), "peer"), peer.address);
    }

    #[tokio::test]
    async fn explicit_routes_allow_address_but_not_hostname_reachability() {
        let (manager, _mock) = manager();
        for name in ["front", "back"] {
            manager
                .create_network(NetworkSpec::new(name, NetworkDriver::Bridge))
                .await
                .unwrap();
        }
        manager.attach(&id("web"), "front", "web").unwrap();
        let db = manager.attach(&id("db"), "back", "db").unwrap();

        manager.connect_routes("front", "back").unwrap();
        assert!(manager.can_reach(&id("web"), db.address.unwrap()));
        assert_eq!(manager.resolve(&id("web"), "db"), None);

        manager.disconnect_routes("front", "back").unwrap();
        assert!(!manager.can_reach(&id("web"), db.address.unwrap()));
    }

    #[tokio::test]
    async fn binding_lists_only_same_network_peers() {
        let (manager, _mock) = manager();
        for name in ["a", "b"] {
            manager
                .create_network(
                    NetworkSpec::new(name, NetworkDriver::Bridge).with_dns(["1.1.1.1"]),
                )
                .await
                .unwrap();
        }
        let me = manager.attach(&id("me"), "a", "me").unwrap();
        manager.attach(&id("friend"), "a", "friend").unwrap();
        manager.attach(&id("stranger"), "b", "stranger").unwrap();

        let binding = manager.binding_for(&id("me"), &me);
        let names: Vec<&str> = binding.hosts.iter().map(|(h, _)| h.as_str()).collect();
        assert_eq!(names, vec!["friend"]);
        assert_eq!(binding.dns, vec!["1.1.1.1".to_string()]);
    }

    #[tokio::test]
    async fn refuses_everything_when_system_not_ready() {
        let manager = NetworkManager::new(
            Arc::new(Registry::new()),
            Arc::new(MockBackend::new()),
            EventBus::new(),
            HealthGate::new(false),
            "10.89.0.0/16".parse().unwrap(),
            24,
        );
        assert!(matches!(
            manager
                .create_network(NetworkSpec::new("app", NetworkDriver::Bridge))
                .await,
            Err(EngineError::SystemNotReady)
        ));
    }
}
