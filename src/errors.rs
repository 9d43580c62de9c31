use ipnet::Ipv4Net;
use thiserror::Error;

use crate::topology::{LinkGroup, NodeId};

/// Errors that can occur while building or running the DMZ network
#[derive(Error, Debug)]
pub enum DmzError {
    /// Node counts or the topology description are invalid
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A link group needs more addresses than its block provides
    #[error("Address block {block} for group {group} is exhausted: {required} addresses required, {available} available")]
    AddressExhaustion {
        /// Group being numbered
        group: LinkGroup,
        /// Block configured for that group
        block: Ipv4Net,
        /// Number of interfaces in the group
        required: usize,
        /// Usable host addresses in the block
        available: usize,
    },

    /// Node is not part of the topology
    #[error("Node not found: {0:?}")]
    UnknownNode(NodeId),

    /// No forwarding entry leads from `from` to `to`
    #[error("No route from {from} to {to}")]
    NoRoute {
        /// Name of the node where forwarding stopped
        from: String,
        /// Name of the destination node
        to: String,
    },

    /// No gateway is allowed to forward into the server segment
    #[error("Network partitioned: server segment {prefix} is unreachable from {from}")]
    NetworkPartitioned {
        /// Name of the node that has no route
        from: String,
        /// Server segment prefix
        prefix: Ipv4Net,
    },

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration file: {0}")]
    ConfigFile(String),

    /// IO error
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),

    /// Unknown error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Shorthand result type for DMZ network operations
pub type DmzResult<T> = Result<T, DmzError>;

/// Convert anyhow errors to DmzError
impl From<anyhow::Error> for DmzError {
    fn from(err: anyhow::Error) -> Self {
        DmzError::Unknown(err.to_string())
    }
}

impl From<toml::de::Error> for DmzError {
    fn from(err: toml::de::Error) -> Self {
        DmzError::ConfigFile(err.to_string())
    }
}
