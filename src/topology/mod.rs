/// Topology data model: immutable snapshots of the known deployment
pub mod coordinator;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

/// Network address of a server node, identity independent of its role
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressParseError(s.to_string()));
        }
        let port: u16 = port.parse().map_err(|_| AddressParseError(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Error parsing a "host:port" address string
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid server address: {0}")]
pub struct AddressParseError(pub String);

/// Role a server reported in its last status probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Primary,
    Secondary,
    Arbiter,
    Standalone,
    /// Sharded-cluster router
    Router,
    /// Replica set member not yet initialized
    Ghost,
    Unknown,
}

impl Default for ServerRole {
    fn default() -> Self {
        ServerRole::Unknown
    }
}

impl ServerRole {
    /// Whether this role holds data and can serve reads
    pub fn is_data_bearing(&self) -> bool {
        matches!(
            self,
            ServerRole::Primary | ServerRole::Secondary | ServerRole::Standalone | ServerRole::Router
        )
    }

    /// Whether this role belongs to a replica set
    pub fn is_replica_member(&self) -> bool {
        matches!(
            self,
            ServerRole::Primary | ServerRole::Secondary | ServerRole::Arbiter | ServerRole::Ghost
        )
    }
}

/// Immutable snapshot of one server, replaced wholesale on every probe
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    pub address: ServerAddress,
    pub role: ServerRole,
    /// Smoothed round-trip latency of the status probe
    pub round_trip_time: Option<Duration>,
    /// Wall-clock time of the last successful probe
    pub last_probe: Option<SystemTime>,
    /// Error from the last failed probe or operation, if any
    pub error: Option<String>,
    /// Replica set name the server reported
    pub set_name: Option<String>,
    /// Election ordinal reported by a primary, used to break primary conflicts
    pub election_ordinal: Option<u64>,
    /// Membership list reported by a primary or secondary
    pub hosts: Vec<ServerAddress>,
    /// Arbitrary key-value labels used for selection
    pub tags: HashMap<String, String>,
    /// Timestamp of the server's last observed write, used for staleness
    pub last_write: Option<SystemTime>,
    /// Logical session idle timeout advertised by the server
    pub logical_session_timeout: Option<Duration>,
}

impl ServerDescription {
    /// Placeholder description for a server that has not been probed yet
    pub fn unknown(address: ServerAddress) -> Self {
        Self {
            address,
            role: ServerRole::Unknown,
            round_trip_time: None,
            last_probe: None,
            error: None,
            set_name: None,
            election_ordinal: None,
            hosts: Vec::new(),
            tags: HashMap::new(),
            last_write: None,
            logical_session_timeout: None,
        }
    }

    /// Description for a server whose probe failed; the error is retained so
    /// callers can see why the server is ineligible
    pub fn unreachable<S: Into<String>>(address: ServerAddress, error: S) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::unknown(address)
        }
    }

    /// Whether the last probe succeeded
    pub fn is_available(&self) -> bool {
        self.error.is_none() && self.role != ServerRole::Unknown
    }
}

/// Overall shape of the deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyType {
    Single,
    ReplicaSetWithPrimary,
    ReplicaSetNoPrimary,
    Sharded,
    LoadBalanced,
    Unknown,
}

/// Immutable snapshot of the whole deployment
///
/// A new instance replaces the old one on every applied monitor report; any
/// reader still holding a previous snapshot observes it unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    pub servers: HashMap<ServerAddress, ServerDescription>,
    /// Strictly increasing across applied updates; detects stale reads
    pub revision: u64,
    /// Replica set name, once known
    pub set_name: Option<String>,
    /// Highest election ordinal observed from any primary
    pub max_election_ordinal: Option<u64>,
    /// Minimum session timeout advertised across data-bearing servers
    pub logical_session_timeout: Option<Duration>,
}

impl TopologyDescription {
    /// Initial snapshot seeded from configuration, all servers unknown
    pub fn seeded(
        seeds: Vec<ServerAddress>,
        set_name: Option<String>,
        load_balanced: bool,
    ) -> Self {
        let topology_type = if load_balanced {
            TopologyType::LoadBalanced
        } else if set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers = seeds
            .into_iter()
            .map(|addr| (addr.clone(), ServerDescription::unknown(addr)))
            .collect();

        Self {
            topology_type,
            servers,
            revision: 0,
            set_name,
            max_election_ordinal: None,
            logical_session_timeout: None,
        }
    }

    /// The current primary, if one is recorded
    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|s| s.role == ServerRole::Primary)
    }

    /// All known addresses, sorted for deterministic iteration
    pub fn addresses(&self) -> Vec<ServerAddress> {
        let mut addrs: Vec<_> = self.servers.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Whether the snapshot contains the given address
    pub fn contains(&self, address: &ServerAddress) -> bool {
        self.servers.contains_key(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        let addr: ServerAddress = "db0.example.com:27017".parse().unwrap();
        assert_eq!(addr.host, "db0.example.com");
        assert_eq!(addr.port, 27017);
        assert_eq!(addr.to_string(), "db0.example.com:27017");

        assert!("no-port".parse::<ServerAddress>().is_err());
        assert!(":27017".parse::<ServerAddress>().is_err());
        assert!("host:notaport".parse::<ServerAddress>().is_err());
    }

    #[test]
    fn test_address_equality_by_value() {
        let a: ServerAddress = "db0:27017".parse().unwrap();
        let b = ServerAddress::new("db0", 27017);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unknown_description() {
        let desc = ServerDescription::unknown("db0:27017".parse().unwrap());
        assert_eq!(desc.role, ServerRole::Unknown);
        assert!(!desc.is_available());
        assert!(desc.error.is_none());
    }

    #[test]
    fn test_unreachable_description_keeps_error() {
        let desc = ServerDescription::unreachable("db0:27017".parse().unwrap(), "refused");
        assert_eq!(desc.error.as_deref(), Some("refused"));
        assert!(!desc.is_available());
    }

    #[test]
    fn test_seeded_topology() {
        let seeds = vec!["a:1".parse().unwrap(), "b:2".parse().unwrap()];
        let topology = TopologyDescription::seeded(seeds, Some("rs0".to_string()), false);
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
        assert_eq!(topology.revision, 0);
        assert_eq!(topology.servers.len(), 2);
        assert!(topology.primary().is_none());

        let single = TopologyDescription::seeded(vec!["a:1".parse().unwrap()], None, true);
        assert_eq!(single.topology_type, TopologyType::LoadBalanced);
    }
}
