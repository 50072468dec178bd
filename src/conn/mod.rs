/// Consumed boundaries: per-server connections and the optional crypt client
///
/// Connection pooling, authentication and TLS live entirely behind
/// [`ServerConnection`]; the cluster core only issues status probes and
/// commands through it.
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::topology::{ServerAddress, ServerRole};

/// Result of a status probe against one server
#[derive(Debug, Clone, Default)]
pub struct ProbeReply {
    pub role: ServerRole,
    pub set_name: Option<String>,
    pub hosts: Vec<ServerAddress>,
    pub tags: HashMap<String, String>,
    pub election_ordinal: Option<u64>,
    pub last_write: Option<SystemTime>,
    pub logical_session_timeout: Option<Duration>,
}

/// A logical connection to one server
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// Issue a lightweight status probe
    async fn probe(&mut self) -> Result<ProbeReply>;

    /// Send an opaque command document and return the opaque reply
    async fn send_command(&mut self, command: Bytes) -> Result<Bytes>;
}

/// Creates connections on demand, one per monitored address
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, address: &ServerAddress) -> Result<Box<dyn ServerConnection>>;
}

/// Opaque field-level-encryption capability, present in some deployments.
/// The cluster passes the handle through; it performs no encryption itself.
pub trait CryptClient: Send + Sync + fmt::Debug {}
