//! # Topology arena
//!
//! Owns every node, interface and link of the DMZ network. Everything is created once by
//! [`Topology::build`] and referenced afterwards by stable identifiers; only interface addresses
//! (set by the address plan) and interface load counters (set by the simulation) change later.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use log::{debug, info};
use petgraph::algo::connected_components;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;

use crate::errors::{DmzError, DmzResult};

/// Upper bound on the number of wireless stations
pub const MAX_STATIONS: u32 = 250;

/// Node identification (and index into the graph)
pub type NodeId = NodeIndex<u32>;

/// Index of an interface in the topology arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(pub usize);

/// Index of a link in the topology arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub usize);

/// Role a node plays in the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    AccessPoint,
    Station,
    Switch,
    Router,
    Firewall,
    Server,
}

/// How a node forwards traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Learning L2 bridge, invisible to routing
    Bridge,
    /// Forwards IP traffic between its interfaces
    Router,
    /// Sources and sinks traffic, never forwards
    Host,
}

impl Role {
    /// Forwarding capability of this role
    pub fn capability(self) -> Capability {
        match self {
            Role::Switch => Capability::Bridge,
            Role::AccessPoint | Role::Router | Role::Firewall => Capability::Router,
            Role::Station | Role::Server => Capability::Host,
        }
    }
}

/// Medium kind of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    PointToPoint,
    Shared,
}

/// Broadcast domain a link belongs to. Each group is numbered out of its own address block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkGroup {
    /// Wireless stations and the access point
    Access,
    /// Switch1 segment: access point uplink and both routers
    UpperDmz,
    /// Switch2 segment: both routers and the firewall
    LowerDmz,
    /// Firewall to server
    Server,
}

impl LinkGroup {
    pub const ALL: [LinkGroup; 4] = [
        LinkGroup::Access,
        LinkGroup::UpperDmz,
        LinkGroup::LowerDmz,
        LinkGroup::Server,
    ];
}

impl fmt::Display for LinkGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkGroup::Access => "access",
            LinkGroup::UpperDmz => "upper-dmz",
            LinkGroup::LowerDmz => "lower-dmz",
            LinkGroup::Server => "server",
        };
        f.write_str(name)
    }
}

/// Locally administered MAC address derived from the interface index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    fn for_interface(id: InterfaceId) -> Self {
        let n = id.0 as u32;
        MacAddr([0x02, 0x00, (n >> 24) as u8, (n >> 16) as u8, (n >> 8) as u8, n as u8])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Capacity and propagation delay of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAttributes {
    /// Capacity in bits per second
    pub data_rate_bps: u64,
    /// Propagation delay
    pub delay: Duration,
}

impl LinkAttributes {
    pub fn new(data_rate_bps: u64, delay: Duration) -> Self {
        Self { data_rate_bps, delay }
    }

    /// Build attributes from an ns-3 style rate string ("5Mbps") and a delay in milliseconds
    pub fn parse(data_rate: &str, delay_ms: u64) -> DmzResult<Self> {
        Ok(Self::new(parse_data_rate(data_rate)?, Duration::from_millis(delay_ms)))
    }
}

/// Parse a data rate like `5Mbps`, `100Mbps`, `1Gbps`, `512kbps` or `800bps` into bits per second
pub fn parse_data_rate(rate: &str) -> DmzResult<u64> {
    let rate = rate.trim();
    let digits_end = rate
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rate.len());
    let (value, unit) = rate.split_at(digits_end);
    let value: u64 = value
        .parse()
        .map_err(|_| DmzError::Configuration(format!("invalid data rate: {:?}", rate)))?;
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "bps" | "b/s" => 1,
        "kbps" | "kb/s" => 1_000,
        "mbps" | "mb/s" => 1_000_000,
        "gbps" | "gb/s" => 1_000_000_000,
        _ => {
            return Err(DmzError::Configuration(format!(
                "invalid data rate unit in {:?}",
                rate
            )))
        }
    };
    value
        .checked_mul(multiplier)
        .ok_or_else(|| DmzError::Configuration(format!("data rate {:?} is too large", rate)))
}

/// Node of the topology
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub role: Role,
    /// Attached interfaces, in creation order
    pub interfaces: Vec<InterfaceId>,
}

/// Interface owned by exactly one node
#[derive(Debug, Clone)]
pub struct Interface {
    pub id: InterfaceId,
    pub node: NodeId,
    pub link: LinkId,
    pub mac: MacAddr,
    /// Address with the prefix length of its group; `None` until the address plan runs and
    /// always `None` on bridge ports
    pub address: Option<Ipv4Net>,
    /// Bytes forwarded out of this interface since the last sampling boundary
    pub load_bytes: u64,
}

impl Interface {
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.address.map(|a| a.addr())
    }
}

/// Link between interfaces
#[derive(Debug, Clone)]
pub struct Link {
    pub id: LinkId,
    /// Attached interfaces. Point-to-point links have exactly two.
    pub endpoints: Vec<InterfaceId>,
    /// On a shared channel, the endpoint every other endpoint reaches the others through
    pub hub: Option<InterfaceId>,
    pub medium: Medium,
    pub attributes: LinkAttributes,
    pub group: LinkGroup,
}

/// Role-designated node on the DMZ spine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpineNode {
    AccessPoint,
    Switch1,
    PrimaryRouter,
    BackupRouter,
    Switch2,
    Firewall,
    Server,
}

impl SpineNode {
    pub const ALL: [SpineNode; 7] = [
        SpineNode::AccessPoint,
        SpineNode::Switch1,
        SpineNode::PrimaryRouter,
        SpineNode::BackupRouter,
        SpineNode::Switch2,
        SpineNode::Firewall,
        SpineNode::Server,
    ];

    pub fn role(self) -> Role {
        match self {
            SpineNode::AccessPoint => Role::AccessPoint,
            SpineNode::Switch1 | SpineNode::Switch2 => Role::Switch,
            SpineNode::PrimaryRouter | SpineNode::BackupRouter => Role::Router,
            SpineNode::Firewall => Role::Firewall,
            SpineNode::Server => Role::Server,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpineNode::AccessPoint => "ap",
            SpineNode::Switch1 => "Fst",
            SpineNode::PrimaryRouter => "tr",
            SpineNode::BackupRouter => "br",
            SpineNode::Switch2 => "Lst",
            SpineNode::Firewall => "fw",
            SpineNode::Server => "server",
        }
    }
}

/// Kind of wired link on the spine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    PointToPoint,
    Csma,
}

/// One edge of the role-to-role adjacency specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpineLink {
    pub a: SpineNode,
    pub b: SpineNode,
    pub kind: LinkKind,
    pub group: LinkGroup,
}

impl SpineLink {
    pub fn new(a: SpineNode, b: SpineNode, kind: LinkKind, group: LinkGroup) -> Self {
        Self { a, b, kind, group }
    }
}

/// The DMZ spine: access point, two switches, both gateways, firewall and server
pub fn dmz_spine() -> Vec<SpineLink> {
    use LinkKind::*;
    use SpineNode::*;
    let (upper, lower) = (LinkGroup::UpperDmz, LinkGroup::LowerDmz);
    vec![
        SpineLink::new(AccessPoint, Switch1, PointToPoint, upper),
        SpineLink::new(Switch1, PrimaryRouter, Csma, upper),
        SpineLink::new(Switch1, BackupRouter, Csma, upper),
        SpineLink::new(PrimaryRouter, Switch2, Csma, lower),
        SpineLink::new(BackupRouter, Switch2, Csma, lower),
        SpineLink::new(Switch2, Firewall, Csma, lower),
        SpineLink::new(Firewall, Server, Csma, LinkGroup::Server),
    ]
}

/// Input of the topology builder
#[derive(Debug, Clone)]
pub struct TopologySpec {
    /// Number of wireless stations, at most [`MAX_STATIONS`]
    pub n_wifi: u32,
    pub spine: Vec<SpineLink>,
    pub wireless: LinkAttributes,
    pub p2p: LinkAttributes,
    pub csma: LinkAttributes,
}

impl Default for TopologySpec {
    fn default() -> Self {
        TopologySpec {
            n_wifi: 5,
            spine: dmz_spine(),
            wireless: LinkAttributes::new(54_000_000, Duration::ZERO),
            p2p: LinkAttributes::new(5_000_000, Duration::from_millis(2)),
            csma: LinkAttributes::new(100_000_000, Duration::from_millis(6560)),
        }
    }
}

impl TopologySpec {
    pub fn with_stations(n_wifi: u32) -> Self {
        TopologySpec { n_wifi, ..Default::default() }
    }
}

/// Check the station count against the supported range
pub fn validate_station_count(n_wifi: u32) -> DmzResult<()> {
    if n_wifi == 0 {
        return Err(DmzError::Configuration(
            "at least one wifi station is required".to_string(),
        ));
    }
    if n_wifi > MAX_STATIONS {
        return Err(DmzError::Configuration(format!(
            "Too many wifi nodes ({}), no more than {} each.",
            n_wifi, MAX_STATIONS
        )));
    }
    Ok(())
}

/// Arena holding the whole network
#[derive(Debug, Clone)]
pub struct Topology {
    graph: UnGraph<Role, LinkId>,
    nodes: Vec<Node>,
    interfaces: Vec<Interface>,
    links: Vec<Link>,
    spine: BTreeMap<SpineNode, NodeId>,
    stations: Vec<NodeId>,
}

impl Topology {
    /// Build the node/edge graph described by `spec`. Addresses are not assigned and routes are
    /// not computed.
    pub fn build(spec: &TopologySpec) -> DmzResult<Self> {
        validate_station_count(spec.n_wifi)?;
        validate_spine(&spec.spine)?;

        let mut topo = Topology {
            graph: UnGraph::default(),
            nodes: Vec::new(),
            interfaces: Vec::new(),
            links: Vec::new(),
            spine: BTreeMap::new(),
            stations: Vec::new(),
        };

        for spine_node in SpineNode::ALL {
            let id = topo.add_node(spine_node.name(), spine_node.role());
            topo.spine.insert(spine_node, id);
        }

        for link in &spec.spine {
            let attributes = match link.kind {
                LinkKind::PointToPoint => spec.p2p,
                LinkKind::Csma => spec.csma,
            };
            let a = topo.spine[&link.a];
            let b = topo.spine[&link.b];
            topo.add_link(&[a, b], None, Medium::PointToPoint, attributes, link.group);
        }

        for i in 0..spec.n_wifi {
            let id = topo.add_node(format!("sta{}", i), Role::Station);
            topo.stations.push(id);
        }
        let ap = topo.spine[&SpineNode::AccessPoint];
        let mut members = topo.stations.clone();
        members.push(ap);
        topo.add_link(&members, Some(ap), Medium::Shared, spec.wireless, LinkGroup::Access);

        topo.check_bridge_groups()?;
        topo.check_connected()?;

        info!(
            "Built topology: {} nodes, {} links, {} stations",
            topo.nodes.len(),
            topo.links.len(),
            topo.stations.len()
        );
        Ok(topo)
    }

    fn add_node<S: Into<String>>(&mut self, name: S, role: Role) -> NodeId {
        let id = self.graph.add_node(role);
        let name = name.into();
        debug!("Created node {} ({:?}) as {:?}", name, role, id);
        self.nodes.push(Node { id, name, role, interfaces: Vec::new() });
        id
    }

    fn add_interface(&mut self, node: NodeId, link: LinkId) -> InterfaceId {
        let id = InterfaceId(self.interfaces.len());
        self.interfaces.push(Interface {
            id,
            node,
            link,
            mac: MacAddr::for_interface(id),
            address: None,
            load_bytes: 0,
        });
        self.nodes[node.index()].interfaces.push(id);
        id
    }

    /// Attach one new interface per member node and join them with a link. When `hub` is given,
    /// graph edges fan out from the hub to every other member.
    fn add_link(
        &mut self,
        members: &[NodeId],
        hub: Option<NodeId>,
        medium: Medium,
        attributes: LinkAttributes,
        group: LinkGroup,
    ) -> LinkId {
        let id = LinkId(self.links.len());
        let endpoints: Vec<InterfaceId> =
            members.iter().map(|n| self.add_interface(*n, id)).collect();
        let hub_iface = hub.and_then(|h| {
            members
                .iter()
                .position(|n| *n == h)
                .map(|pos| endpoints[pos])
        });

        match hub {
            Some(h) => {
                for m in members.iter().filter(|m| **m != h) {
                    self.graph.add_edge(h, *m, id);
                }
            }
            None => {
                for (i, a) in members.iter().enumerate() {
                    for b in &members[i + 1..] {
                        self.graph.add_edge(*a, *b, id);
                    }
                }
            }
        }

        self.links.push(Link { id, endpoints, hub: hub_iface, medium, attributes, group });
        id
    }

    /// All links attached to a switch form one broadcast domain, so they must share a group.
    fn check_bridge_groups(&self) -> DmzResult<()> {
        for node in self.nodes.iter().filter(|n| n.role == Role::Switch) {
            let groups: HashSet<LinkGroup> = node
                .interfaces
                .iter()
                .map(|i| self.link(self.interface(*i).link).group)
                .collect();
            if groups.len() > 1 {
                return Err(DmzError::Configuration(format!(
                    "switch {} joins links of different groups: {:?}",
                    node.name, groups
                )));
            }
        }
        Ok(())
    }

    fn check_connected(&self) -> DmzResult<()> {
        if let Some(isolated) = self.nodes.iter().find(|n| n.interfaces.is_empty()) {
            return Err(DmzError::Configuration(format!(
                "node {} is isolated",
                isolated.name
            )));
        }
        let components = connected_components(&self.graph);
        if components != 1 {
            return Err(DmzError::Configuration(format!(
                "topology is split into {} disconnected parts",
                components
            )));
        }
        Ok(())
    }

    pub fn graph(&self) -> &UnGraph<Role, LinkId> {
        &self.graph
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.interfaces.iter()
    }

    pub fn node(&self, id: NodeId) -> DmzResult<&Node> {
        self.nodes.get(id.index()).ok_or(DmzError::UnknownNode(id))
    }

    /// Name of the node, or `"?"` for identifiers not minted by this topology
    pub fn name(&self, id: NodeId) -> &str {
        self.nodes.get(id.index()).map(|n| n.name.as_str()).unwrap_or("?")
    }

    pub fn role(&self, id: NodeId) -> Option<Role> {
        self.nodes.get(id.index()).map(|n| n.role)
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn interface(&self, id: InterfaceId) -> &Interface {
        &self.interfaces[id.0]
    }

    pub fn interface_mut(&mut self, id: InterfaceId) -> &mut Interface {
        &mut self.interfaces[id.0]
    }

    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.0]
    }

    pub fn spine_node(&self, node: SpineNode) -> NodeId {
        self.spine[&node]
    }

    pub fn stations(&self) -> &[NodeId] {
        &self.stations
    }

    /// Neighbors of `node` in the graph together with the link joining them, ordered by
    /// neighbor id so that traversals are deterministic.
    pub fn adjacent(&self, node: NodeId) -> Vec<(LinkId, NodeId)> {
        let mut adjacent: Vec<(LinkId, NodeId)> = self
            .graph
            .edges(node)
            .map(|e| {
                let other = if e.source() == node { e.target() } else { e.source() };
                (*e.weight(), other)
            })
            .collect();
        adjacent.sort_by_key(|(link, n)| (n.index(), link.0));
        adjacent
    }

    /// Interface of `node` attached to `link`
    pub fn interface_on_link(&self, node: NodeId, link: LinkId) -> Option<InterfaceId> {
        self.nodes
            .get(node.index())?
            .interfaces
            .iter()
            .copied()
            .find(|i| self.interface(*i).link == link)
    }

    /// First interface of `node` attached to a link of `group`
    pub fn interface_in_group(&self, node: NodeId, group: LinkGroup) -> Option<InterfaceId> {
        self.nodes
            .get(node.index())?
            .interfaces
            .iter()
            .copied()
            .find(|i| self.link(self.interface(*i).link).group == group)
    }

    /// Interface of `router` facing the server side of the DMZ
    pub fn dmz_interface(&self, router: NodeId) -> Option<InterfaceId> {
        self.interface_in_group(router, LinkGroup::LowerDmz)
    }

    /// Interface owning `addr`
    pub fn interface_by_address(&self, addr: Ipv4Addr) -> Option<InterfaceId> {
        self.interfaces
            .iter()
            .find(|i| i.ip() == Some(addr))
            .map(|i| i.id)
    }

    /// First assigned address of `node`
    pub fn primary_address(&self, node: NodeId) -> Option<Ipv4Addr> {
        self.nodes
            .get(node.index())?
            .interfaces
            .iter()
            .find_map(|i| self.interface(*i).ip())
    }

    /// Forwarded bytes since the last reset on `iface`
    pub fn add_load(&mut self, iface: InterfaceId, bytes: u64) {
        let load = &mut self.interfaces[iface.0].load_bytes;
        *load = load.saturating_add(bytes);
    }

    /// Reset every load counter at a sampling boundary
    pub fn reset_loads(&mut self) {
        for iface in self.interfaces.iter_mut() {
            iface.load_bytes = 0;
        }
    }
}

fn validate_spine(spine: &[SpineLink]) -> DmzResult<()> {
    let mut seen: HashSet<(SpineNode, SpineNode)> = HashSet::new();
    for link in spine {
        if link.a == link.b {
            return Err(DmzError::Configuration(format!(
                "spine link connects {} to itself",
                link.a.name()
            )));
        }
        let key = if link.a < link.b { (link.a, link.b) } else { (link.b, link.a) };
        if !seen.insert(key) {
            return Err(DmzError::Configuration(format!(
                "duplicate spine link between {} and {}",
                link.a.name(),
                link.b.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_rate() {
        assert_eq!(parse_data_rate("5Mbps").unwrap(), 5_000_000);
        assert_eq!(parse_data_rate("100Mbps").unwrap(), 100_000_000);
        assert_eq!(parse_data_rate("1Gbps").unwrap(), 1_000_000_000);
        assert_eq!(parse_data_rate("512kbps").unwrap(), 512_000);
        assert!(parse_data_rate("fast").is_err());
        assert!(parse_data_rate("10parsecs").is_err());
        assert!(matches!(
            parse_data_rate("20000000000Gbps"),
            Err(DmzError::Configuration(_))
        ));
        assert!(matches!(
            parse_data_rate("99999999999999999999bps"),
            Err(DmzError::Configuration(_))
        ));
    }

    #[test]
    fn test_capabilities() {
        assert_eq!(Role::Switch.capability(), Capability::Bridge);
        assert_eq!(Role::Router.capability(), Capability::Router);
        assert_eq!(Role::AccessPoint.capability(), Capability::Router);
        assert_eq!(Role::Station.capability(), Capability::Host);
        assert_eq!(Role::Server.capability(), Capability::Host);
    }

    #[test]
    fn test_mac_display() {
        let mac = MacAddr::for_interface(InterfaceId(0x1234));
        assert_eq!(mac.to_string(), "02:00:00:00:12:34");
    }

    #[test]
    fn test_wireless_channel_fans_out_from_ap() {
        let topo = Topology::build(&TopologySpec::with_stations(3)).unwrap();
        let ap = topo.spine_node(SpineNode::AccessPoint);
        let wifi = topo.interface_in_group(ap, LinkGroup::Access).unwrap();
        let link = topo.link(topo.interface(wifi).link);
        assert_eq!(link.medium, Medium::Shared);
        assert_eq!(link.hub, Some(wifi));
        assert_eq!(link.endpoints.len(), 4);
        for sta in topo.stations() {
            let adjacent = topo.adjacent(*sta);
            assert_eq!(adjacent.len(), 1);
            assert_eq!(adjacent[0].1, ap);
        }
    }

    #[test]
    fn test_load_counter_saturates() {
        let mut topo = Topology::build(&TopologySpec::with_stations(1)).unwrap();
        let tr = topo.spine_node(SpineNode::PrimaryRouter);
        let iface = topo.dmz_interface(tr).unwrap();
        topo.add_load(iface, u64::MAX - 10);
        topo.add_load(iface, 1024);
        assert_eq!(topo.interface(iface).load_bytes, u64::MAX);
        topo.reset_loads();
        assert_eq!(topo.interface(iface).load_bytes, 0);
    }
}
