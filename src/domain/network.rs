use super::container::ContainerId;
use super::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Name of the builtin network sharing the host stack.
pub const HOST_NETWORK: &str = "host";
/// Name of the builtin network with no connectivity at all.
pub const NONE_NETWORK: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// Members reach each other and egress through the gateway.
    #[default]
    Bridge,
    /// Members reach each other only; no gateway route.
    Isolated,
    Host,
    None,
}

impl NetworkDriver {
    /// Bridge and isolated networks are user-defined and allocate addresses.
    pub fn is_user_defined(self) -> bool {
        matches!(self, NetworkDriver::Bridge | NetworkDriver::Isolated)
    }
}

impl fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bridge => write!(f, "bridge"),
            Self::Isolated => write!(f, "isolated"),
            Self::Host => write!(f, "host"),
            Self::None => write!(f, "none"),
        }
    }
}

/// IPv4 subnet in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct Subnet {
    base: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Pool user-defined networks are carved from unless configured otherwise.
    pub const DEFAULT_POOL: Subnet = Subnet {
        base: Ipv4Addr::new(10, 89, 0, 0),
        prefix: 16,
    };

    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if !(8..=30).contains(&prefix) {
            return Err(EngineError::InvalidConfiguration(format!(
                "subnet prefix /{prefix} must be between /8 and /30"
            )));
        }
        let mask = Self::mask_for(prefix);
        Ok(Self {
            base: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    fn mask_for(prefix: u8) -> u32 {
        u32::MAX << (32 - u32::from(prefix))
    }

    pub fn base(&self) -> Ipv4Addr {
        self.base
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    fn size(&self) -> u32 {
        1u32 << (32 - u32::from(self.prefix))
    }

    /// First usable address, reserved for the gateway.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) + 1)
    }

    /// Addresses handed to containers: everything between gateway and broadcast.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let start = u32::from(self.base) + 2;
        let broadcast = u32::from(self.base) + (self.size() - 1);
        (start..broadcast).map(Ipv4Addr::from)
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask_for(self.prefix) == u32::from(self.base)
    }

    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.contains(other.base) || other.contains(self.base)
    }

    /// The `index`-th subnet of length `prefix` carved out of `self`.
    pub fn nth_child(&self, prefix: u8, index: u32) -> Option<Subnet> {
        if prefix < self.prefix || prefix > 30 {
            return None;
        }
        let count = 1u64 << (prefix - self.prefix);
        if u64::from(index) >= count {
            return None;
        }
        let child_size = 1u32 << (32 - u32::from(prefix));
        let base = u32::from(self.base) + index * child_size;
        Subnet::new(Ipv4Addr::from(base), prefix).ok()
    }
}

impl FromStr for Subnet {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || EngineError::InvalidConfiguration(format!("invalid subnet '{s}'"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Subnet::new(addr, prefix)
    }
}

impl TryFrom<String> for Subnet {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.prefix)
    }
}

/// Request to create a user-defined network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default)]
    pub driver: NetworkDriver,
    /// Picked from the engine's pool when absent.
    #[serde(default)]
    pub subnet: Option<Subnet>,
    #[serde(default)]
    pub dns: Vec<String>,
}

impl NetworkSpec {
    pub fn new(name: impl Into<String>, driver: NetworkDriver) -> Self {
        Self {
            name: name.into(),
            driver,
            subnet: None,
            dns: Vec::new(),
        }
    }

    pub fn with_subnet(mut self, subnet: Subnet) -> Self {
        self.subnet = Some(subnet);
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
}

/// A container's membership in a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub network: String,
    pub hostname: String,
    pub address: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
}

/// Snapshot of a network domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub driver: NetworkDriver,
    pub subnet: Option<Subnet>,
    pub gateway: Option<Ipv4Addr>,
    pub dns: Vec<String>,
    pub attached: BTreeMap<ContainerId, Attachment>,
    /// Networks whose members may be reached by address.
    pub routes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Network {
    pub fn is_builtin(&self) -> bool {
        !self.driver.is_user_defined()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnets_at_the_top_of_the_address_space_have_hosts() {
        let subnet: Subnet = "255.255.255.0/24".parse().unwrap();
        assert_eq!(subnet.gateway(), Ipv4Addr::new(255, 255, 255, 1));
        assert_eq!(subnet.hosts().count(), 253);
        assert_eq!(subnet.hosts().last(), Some(Ipv4Addr::new(255, 255, 255, 254)));

        let pool: Subnet = "255.0.0.0/8".parse().unwrap();
        let last = pool.nth_child(24, 65535).unwrap();
        assert_eq!(last.to_string(), "255.255.255.0/24");
        assert_eq!(last.hosts().next(), Some(Ipv4Addr::new(255, 255, 255, 2)));
    }

    #[test]
    fn parses_and_normalizes_subnets() {
        let subnet: Subnet = "10.89.3.17/24".parse().unwrap();
        assert_eq!(subnet.to_string(), "10.89.3.0/24");
        assert_eq!(subnet.gateway(), Ipv4Addr::new(10, 89, 3, 1));
        assert!(subnet.contains(Ipv4Addr::new(10, 89, 3, 200)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 89, 4, 1)));

        assert!("10.0.0.0".parse::<Subnet>().is_err());
        assert!("10.0.0.0/31".parse::<Subnet>().is_err());
        assert!("10.0.0.300/24".parse::<Subnet>().is_err());
    }

    #[test]
    fn host_range_excludes_network_gateway_and_broadcast() {
        let subnet: Subnet = "192.168.5.0/29".parse().unwrap();
        let hosts: Vec<_> = subnet.hosts().collect();
        assert_eq!(hosts.first(), Some(&Ipv4Addr::new(192, 168, 5, 2)));
        assert_eq!(hosts.last(), Some(&Ipv4Addr::new(192, 168, 5, 6)));
        assert_eq!(hosts.len(), 5);
    }

    #[test]
    fn carves_child_subnets_from_a_pool() {
        let pool: Subnet = "10.89.0.0/16".parse().unwrap();
        assert_eq!(pool.nth_child(24, 0).unwrap().to_string(), "10.89.0.0/24");
        assert_eq!(pool.nth_child(24, 7).unwrap().to_string(), "10.89.7.0/24");
        assert!(pool.nth_child(24, 256).is_none());
        assert!(pool.nth_child(12, 0).is_none());

        let a: Subnet = "10.89.0.0/16".parse().unwrap();
        let b: Subnet = "10.89.7.0/24".parse().unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }
}
