//! Rumbo - cluster topology tracking and server selection for distributed
//! database clients
//!
//! The crate continuously discovers which server nodes exist and their roles
//! (one monitor task per node), folds every probe result into an immutable
//! topology snapshot, and selects a server satisfying caller-supplied
//! criteria within a bounded time. It also pools the logical sessions used
//! for causal consistency and transactions.
//!
//! Wire framing, authentication and connection pooling live behind the
//! [`conn::ServerConnection`] boundary supplied by the embedding driver.

pub mod cluster;
pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
mod monitor;
pub mod selection;
pub mod session;
pub mod topology;

pub use cluster::{CancellationToken, Cluster, ClusterId};
pub use config::ClusterConfig;
pub use error::{Error, Result};
pub use selection::{ReadMode, SelectionCriteria};
pub use session::{SessionHandle, SessionOptions};
pub use topology::{
    ServerAddress, ServerDescription, ServerRole, TopologyDescription, TopologyType,
};
