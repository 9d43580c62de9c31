//! # DMZ Failover
//!
//! A simulated DMZ network with a primary and a backup gateway router in front of a firewalled
//! server segment. Wireless stations reach the server through an access point, a first switch,
//! one of the two gateways, a second switch and the firewall. A load-based failover controller
//! watches both gateways and moves the server-segment route to the backup while the primary is
//! overloaded, then hands it back once the primary has been quiet for long enough.
//!
//! This library provides the topology builder, the address plan, learning bridges, route
//! computation, the failover controller and a discrete-event timeline that ties them together.

pub mod addressing;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod errors;
pub mod routing;
pub mod simulation;
pub mod topology;

// Re-export commonly used types and functions
pub use addressing::{AddressPlan, Assignment};
pub use config::{load_file, FileConfig, SimulationConfig};
pub use controller::{
    ControllerEvent, FailoverController, FailoverSettings, FailoverState, GatewayPair, GatewayRole,
    GatewayStatus, LoadSnapshot,
};
pub use errors::{DmzError, DmzResult};
pub use routing::{compute_routes, trace_path, ForwardingTable, NextHop, PathTrace, RouteEntry, RouteSet};
pub use simulation::{
    EchoTraffic, NodeCounters, Simulation, Traffic, TrafficSettings, TrafficSource, TrafficStats,
};
pub use topology::{
    validate_station_count, LinkGroup, NodeId, Role, SpineNode, Topology, TopologySpec,
    MAX_STATIONS,
};
