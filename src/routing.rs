//! # Route computation
//!
//! Derives a forwarding table for every routed node by hop-count shortest path over the topology
//! graph. Only one gateway router may be crossed on the way into or out of the server side: the
//! Active one (see [`GatewayPair::forwarding`]). A route whose natural shortest path runs through
//! the other gateway is routed through the forwarding gateway instead, and when no gateway may
//! forward the affected destinations are reported as unreachable rather than silently left out.
//!
//! Tables are L3 views: switches are transparent, so the next hop of a route is the interface of
//! the next routed node, while the metric counts every graph hop including switches.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use log::{debug, warn};

use crate::controller::GatewayPair;
use crate::errors::{DmzError, DmzResult};
use crate::topology::{Capability, InterfaceId, LinkGroup, LinkId, NodeId, Topology};

/// Where a matching packet goes next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// Destination is on the egress interface's own subnet
    Connected,
    /// Hand the packet to this interface of the next routed node
    Via { node: NodeId, interface: InterfaceId },
}

/// One forwarding entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub prefix: Ipv4Net,
    /// Local interface the packet leaves through
    pub egress: InterfaceId,
    pub next_hop: NextHop,
    /// Graph hops to the nearest node owning the prefix
    pub metric: u32,
}

/// Forwarding table of one node, at most one entry per prefix
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingTable {
    entries: BTreeMap<Ipv4Net, RouteEntry>,
}

impl ForwardingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`, replacing any entry for the same prefix
    pub fn insert(&mut self, entry: RouteEntry) -> Option<RouteEntry> {
        self.entries.insert(entry.prefix, entry)
    }

    pub fn get(&self, prefix: &Ipv4Net) -> Option<&RouteEntry> {
        self.entries.get(prefix)
    }

    /// Longest-prefix match
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<&RouteEntry> {
        self.entries
            .values()
            .filter(|e| e.prefix.contains(&addr))
            .max_by_key(|e| e.prefix.prefix_len())
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Forwarding tables of all routed nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    tables: BTreeMap<NodeId, ForwardingTable>,
    unreachable: Vec<(NodeId, Ipv4Net)>,
}

impl RouteSet {
    pub fn table(&self, node: NodeId) -> Option<&ForwardingTable> {
        self.tables.get(&node)
    }

    pub fn tables(&self) -> impl Iterator<Item = (&NodeId, &ForwardingTable)> {
        self.tables.iter()
    }

    /// (node, prefix) pairs for which no route exists
    pub fn unreachable(&self) -> &[(NodeId, Ipv4Net)] {
        &self.unreachable
    }

    /// Nodes that cannot reach `prefix`
    pub fn cut_off_from(&self, prefix: Ipv4Net) -> Vec<NodeId> {
        self.unreachable
            .iter()
            .filter(|(_, p)| *p == prefix)
            .map(|(n, _)| *n)
            .collect()
    }
}

/// Subnets of all assigned interfaces, sorted
pub fn destination_prefixes(topo: &Topology) -> Vec<Ipv4Net> {
    let mut prefixes: Vec<Ipv4Net> = topo
        .interfaces()
        .filter_map(|i| i.address.map(|a| a.trunc()))
        .collect();
    prefixes.sort();
    prefixes.dedup();
    prefixes
}

/// Subnet of the server segment, once addresses are assigned
pub fn server_prefix(topo: &Topology) -> Option<Ipv4Net> {
    topo.interfaces()
        .filter(|i| topo.link(i.link).group == LinkGroup::Server)
        .find_map(|i| i.address.map(|a| a.trunc()))
}

fn is_routed(topo: &Topology, node: NodeId) -> bool {
    topo.role(node).map(|r| r.capability()) != Some(Capability::Bridge)
}

/// Breadth-first search from `src`, entering only nodes that may carry transit traffic.
/// Returns, per reached node, its hop distance and the (link, predecessor) it was reached by.
fn search(
    topo: &Topology,
    gateways: &GatewayPair,
    src: NodeId,
) -> BTreeMap<NodeId, (u32, Option<(LinkId, NodeId)>)> {
    let forwarding = gateways.forwarding().map(|g| g.node);
    let may_enter = |n: NodeId| !gateways.is_gateway(n) || Some(n) == forwarding;
    let may_transit = |n: NodeId| {
        n == src
            || matches!(
                topo.role(n).map(|r| r.capability()),
                Some(Capability::Bridge) | Some(Capability::Router)
            )
    };

    let mut reached = BTreeMap::new();
    reached.insert(src, (0, None));
    let mut queue = VecDeque::from([src]);
    while let Some(n) = queue.pop_front() {
        if !may_transit(n) {
            continue;
        }
        let dist = reached[&n].0;
        for (link, next) in topo.adjacent(n) {
            if reached.contains_key(&next) || !may_enter(next) {
                continue;
            }
            reached.insert(next, (dist + 1, Some((link, n))));
            queue.push_back(next);
        }
    }
    reached
}

/// Compute the forwarding table of every routed node for every assigned prefix.
pub fn compute_routes(topo: &Topology, gateways: &GatewayPair) -> RouteSet {
    let prefixes = destination_prefixes(topo);
    let mut routes = RouteSet::default();

    for src in topo.nodes().map(|n| n.id).filter(|n| is_routed(topo, *n)) {
        let reached = search(topo, gateways, src);
        let mut table = ForwardingTable::new();

        for prefix in &prefixes {
            if let Some(entry) = route_to(topo, src, *prefix, &reached) {
                table.insert(entry);
            } else {
                routes.unreachable.push((src, *prefix));
            }
        }
        routes.tables.insert(src, table);
    }

    if !routes.unreachable.is_empty() {
        warn!("{} destinations are unreachable", routes.unreachable.len());
    }
    routes
}

fn route_to(
    topo: &Topology,
    src: NodeId,
    prefix: Ipv4Net,
    reached: &BTreeMap<NodeId, (u32, Option<(LinkId, NodeId)>)>,
) -> Option<RouteEntry> {
    let in_prefix = |i: &InterfaceId| {
        topo.interface(*i)
            .address
            .map_or(false, |a| a.trunc() == prefix)
    };

    let src_node = topo.node(src).ok()?;
    if let Some(egress) = src_node.interfaces.iter().copied().find(|i| in_prefix(i)) {
        return Some(RouteEntry { prefix, egress, next_hop: NextHop::Connected, metric: 0 });
    }

    // nearest owner of the prefix; ties go to the lower node id
    let (owner, metric) = reached
        .iter()
        .filter(|(n, _)| **n != src)
        .filter(|(n, _)| {
            topo.node(**n)
                .map_or(false, |node| node.interfaces.iter().any(|i| in_prefix(i)))
        })
        .map(|(n, (dist, _))| (*n, *dist))
        .min_by_key(|(n, dist)| (*dist, n.index()))?;

    // walk back to the first hop out of src
    let mut hops = Vec::new();
    let mut current = owner;
    while current != src {
        let (link, prev) = reached[&current].1?;
        hops.push((link, current));
        current = prev;
    }
    hops.reverse();

    let (first_link, _) = hops[0];
    let egress = topo.interface_on_link(src, first_link)?;
    let (via_link, via_node) = hops
        .iter()
        .copied()
        .find(|(_, n)| is_routed(topo, *n))?;
    let interface = topo.interface_on_link(via_node, via_link)?;

    debug!(
        "{} -> {}: via {} ({} hops)",
        topo.name(src),
        prefix,
        topo.name(via_node),
        metric
    );
    Some(RouteEntry {
        prefix,
        egress,
        next_hop: NextHop::Via { node: via_node, interface },
        metric,
    })
}

/// Layer-2 hops from `egress` to `target` across bridges. Returns every link crossed together
/// with the node reached over it, ending with the owner of `target`.
pub fn l2_path(
    topo: &Topology,
    egress: InterfaceId,
    target: InterfaceId,
) -> Option<Vec<(LinkId, NodeId)>> {
    let target_link = topo.interface(target).link;
    let target_node = topo.interface(target).node;
    let start = topo.interface(egress).link;
    let mut queue: VecDeque<(LinkId, Vec<(LinkId, NodeId)>)> = VecDeque::from([(start, Vec::new())]);
    let mut visited: HashSet<LinkId> = HashSet::from([start]);

    while let Some((link, path)) = queue.pop_front() {
        if link == target_link {
            let mut path = path;
            path.push((link, target_node));
            return Some(path);
        }
        for iface in &topo.link(link).endpoints {
            let node = topo.interface(*iface).node;
            if is_routed(topo, node) {
                continue;
            }
            let Ok(bridge) = topo.node(node) else { continue };
            for port in &bridge.interfaces {
                let next = topo.interface(*port).link;
                if visited.insert(next) {
                    let mut next_path = path.clone();
                    next_path.push((link, node));
                    queue.push_back((next, next_path));
                }
            }
        }
    }
    None
}

/// Physical path of a packet following the forwarding tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTrace {
    /// Every node visited, switches included, source first
    pub nodes: Vec<NodeId>,
    /// Sum of the propagation delays of the crossed links
    pub latency: Duration,
}

impl PathTrace {
    pub fn hop_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains(&node)
    }
}

/// Error for a lookup of `dst_addr` that failed at `at`: a partition when `at` was cut off from
/// the server segment, a plain missing route otherwise.
pub(crate) fn missing_route(
    topo: &Topology,
    routes: &RouteSet,
    at: NodeId,
    dst: NodeId,
    dst_addr: Ipv4Addr,
) -> DmzError {
    let cut_off = routes
        .unreachable()
        .iter()
        .find(|(n, p)| *n == at && p.contains(&dst_addr));
    match (cut_off, server_prefix(topo)) {
        (Some((_, p)), Some(server)) if *p == server => DmzError::NetworkPartitioned {
            from: topo.name(at).to_string(),
            prefix: server,
        },
        _ => DmzError::NoRoute {
            from: topo.name(at).to_string(),
            to: topo.name(dst).to_string(),
        },
    }
}

/// Follow the forwarding tables from `src` to the first address of `dst`.
pub fn trace_path(
    topo: &Topology,
    routes: &RouteSet,
    src: NodeId,
    dst: NodeId,
) -> DmzResult<PathTrace> {
    topo.node(src)?;
    let dst_node = topo.node(dst)?;
    let no_route = |from: NodeId| DmzError::NoRoute {
        from: topo.name(from).to_string(),
        to: dst_node.name.clone(),
    };
    let dst_addr = topo.primary_address(dst).ok_or_else(|| no_route(src))?;
    let owns_dst = |n: NodeId| topo.primary_address(n) == Some(dst_addr);

    let mut trace = PathTrace { nodes: vec![src], latency: Duration::ZERO };
    let mut current = src;
    let mut visited = HashSet::from([src]);

    while !owns_dst(current) {
        let entry = match routes.table(current).and_then(|t| t.lookup(dst_addr)) {
            Some(entry) => *entry,
            None => return Err(missing_route(topo, routes, current, dst, dst_addr)),
        };
        let target = match entry.next_hop {
            NextHop::Connected => topo.interface_by_address(dst_addr).ok_or_else(|| no_route(current))?,
            NextHop::Via { interface, .. } => interface,
        };
        let segment = l2_path(topo, entry.egress, target).ok_or_else(|| no_route(current))?;
        for (link, node) in segment {
            trace.latency += topo.link(link).attributes.delay;
            trace.nodes.push(node);
            current = node;
        }
        if !visited.insert(current) {
            return Err(no_route(current));
        }
    }
    Ok(trace)
}
