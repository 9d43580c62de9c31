//! # Bridging layer
//!
//! Each switch is a learning bridge: every attached interface is a port, all ports form one
//! broadcast domain, and frames for unknown destinations are flooded until the destination's port
//! has been learned from the source address of an earlier frame. There is no loop prevention; the
//! topology builder only produces loop-free fan-outs.

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::errors::{DmzError, DmzResult};
use crate::topology::{Capability, InterfaceId, LinkGroup, LinkId, MacAddr, NodeId, Topology};

/// Broadcast MAC address
pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

/// What a bridge does with a received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Destination learned on this port
    Forward(InterfaceId),
    /// Destination unknown (or broadcast), copy to all these ports
    Flood(Vec<InterfaceId>),
    /// Destination learned on the ingress port, drop
    Filter,
}

/// Learning bridge emulating one switch node
#[derive(Debug, Clone)]
pub struct Bridge {
    node: NodeId,
    name: String,
    ports: Vec<InterfaceId>,
    mac_table: HashMap<MacAddr, InterfaceId>,
}

impl Bridge {
    /// Bridge over every interface of the switch `node`
    pub fn new(topo: &Topology, node: NodeId) -> DmzResult<Self> {
        let n = topo.node(node)?;
        Ok(Self {
            node,
            name: n.name.clone(),
            ports: n.interfaces.clone(),
            mac_table: HashMap::new(),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn ports(&self) -> &[InterfaceId] {
        &self.ports
    }

    /// Port on which `mac` was last seen as a source address
    pub fn learned_port(&self, mac: &MacAddr) -> Option<InterfaceId> {
        self.mac_table.get(mac).copied()
    }

    /// Handle a frame arriving on `in_port`: learn the source, then decide where it goes.
    pub fn receive(&mut self, in_port: InterfaceId, src: MacAddr, dst: MacAddr) -> Delivery {
        if src != BROADCAST {
            if self.mac_table.insert(src, in_port) != Some(in_port) {
                debug!("{}: learned {} on port {:?}", self.name, src, in_port);
            }
        }

        if dst != BROADCAST {
            if let Some(port) = self.mac_table.get(&dst) {
                if *port == in_port {
                    return Delivery::Filter;
                }
                return Delivery::Forward(*port);
            }
        }

        debug!("{}: flooding frame for {}", self.name, dst);
        Delivery::Flood(self.ports.iter().copied().filter(|p| *p != in_port).collect())
    }
}

/// All bridges of the topology, one per switch node
#[derive(Debug, Clone, Default)]
pub struct BridgingLayer {
    bridges: BTreeMap<NodeId, Bridge>,
}

impl BridgingLayer {
    pub fn new(topo: &Topology) -> DmzResult<Self> {
        let mut bridges = BTreeMap::new();
        for node in topo.nodes().filter(|n| n.role.capability() == Capability::Bridge) {
            bridges.insert(node.id, Bridge::new(topo, node.id)?);
        }
        Ok(Self { bridges })
    }

    pub fn bridge(&self, node: NodeId) -> Option<&Bridge> {
        self.bridges.get(&node)
    }

    pub fn bridge_mut(&mut self, node: NodeId) -> Option<&mut Bridge> {
        self.bridges.get_mut(&node)
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

/// One logical subnet: the links joined by bridges plus the addressable interfaces on them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastDomain {
    pub group: LinkGroup,
    pub links: Vec<LinkId>,
    /// Interfaces of non-bridge nodes, in link creation order
    pub interfaces: Vec<InterfaceId>,
}

/// Group links into broadcast domains. Links attached to the same switch are merged; every other
/// link is a domain of its own. Each link group must form exactly one domain.
pub fn broadcast_domains(topo: &Topology) -> DmzResult<Vec<BroadcastDomain>> {
    let links: Vec<LinkId> = topo.links().map(|l| l.id).collect();
    let mut parent: Vec<usize> = (0..links.len()).collect();

    fn find(parent: &mut Vec<usize>, i: usize) -> usize {
        let mut root = i;
        while parent[root] != root {
            root = parent[root];
        }
        parent[i] = root;
        root
    }

    for node in topo.nodes().filter(|n| n.role.capability() == Capability::Bridge) {
        let mut attached = node.interfaces.iter().map(|i| topo.interface(*i).link.0);
        if let Some(first) = attached.next() {
            for other in attached {
                let (a, b) = (find(&mut parent, first), find(&mut parent, other));
                parent[b] = a;
            }
        }
    }

    let mut domains: BTreeMap<usize, BroadcastDomain> = BTreeMap::new();
    for link in &links {
        let root = find(&mut parent, link.0);
        let l = topo.link(*link);
        let domain = domains.entry(root).or_insert_with(|| BroadcastDomain {
            group: l.group,
            links: Vec::new(),
            interfaces: Vec::new(),
        });
        domain.links.push(*link);
        for iface in &l.endpoints {
            let owner = topo.interface(*iface).node;
            let bridged = topo.role(owner).map(|r| r.capability()) == Some(Capability::Bridge);
            if !bridged && !domain.interfaces.contains(iface) {
                domain.interfaces.push(*iface);
            }
        }
    }

    let mut domains: Vec<BroadcastDomain> = domains.into_values().collect();
    domains.sort_by_key(|d| (d.group, d.links[0]));
    for pair in domains.windows(2) {
        if pair[0].group == pair[1].group {
            return Err(DmzError::Configuration(format!(
                "link group {} is split into several broadcast domains",
                pair[0].group
            )));
        }
    }
    Ok(domains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{SpineNode, TopologySpec};

    fn mac(n: u8) -> MacAddr {
        MacAddr([0x02, 0, 0, 0, 0, n])
    }

    #[test]
    fn test_flood_then_forward() {
        let topo = Topology::build(&TopologySpec::default()).unwrap();
        let fst = topo.spine_node(SpineNode::Switch1);
        let mut bridge = Bridge::new(&topo, fst).unwrap();
        let ports = bridge.ports().to_vec();
        assert_eq!(ports.len(), 3);

        // unknown destination is flooded to every other port
        match bridge.receive(ports[0], mac(1), mac(2)) {
            Delivery::Flood(out) => assert_eq!(out, vec![ports[1], ports[2]]),
            other => panic!("expected flood, got {:?}", other),
        }
        assert_eq!(bridge.learned_port(&mac(1)), Some(ports[0]));

        // the reply teaches the bridge where mac(2) lives
        assert_eq!(bridge.receive(ports[2], mac(2), mac(1)), Delivery::Forward(ports[0]));
        assert_eq!(bridge.receive(ports[0], mac(1), mac(2)), Delivery::Forward(ports[2]));
    }

    #[test]
    fn test_broadcast_always_floods() {
        let topo = Topology::build(&TopologySpec::default()).unwrap();
        let lst = topo.spine_node(SpineNode::Switch2);
        let mut bridge = Bridge::new(&topo, lst).unwrap();
        let ports = bridge.ports().to_vec();
        bridge.receive(ports[1], mac(7), mac(1));
        match bridge.receive(ports[0], mac(1), BROADCAST) {
            Delivery::Flood(out) => assert_eq!(out.len(), 2),
            other => panic!("expected flood, got {:?}", other),
        }
    }

    #[test]
    fn test_same_port_is_filtered() {
        let topo = Topology::build(&TopologySpec::default()).unwrap();
        let fst = topo.spine_node(SpineNode::Switch1);
        let mut bridge = Bridge::new(&topo, fst).unwrap();
        let ports = bridge.ports().to_vec();
        bridge.receive(ports[1], mac(3), mac(9));
        assert_eq!(bridge.receive(ports[1], mac(4), mac(3)), Delivery::Filter);
    }

    #[test]
    fn test_one_domain_per_group() {
        let topo = Topology::build(&TopologySpec::default()).unwrap();
        let domains = broadcast_domains(&topo).unwrap();
        assert_eq!(
            domains.iter().map(|d| d.group).collect::<Vec<_>>(),
            LinkGroup::ALL.to_vec()
        );

        let upper = &domains[1];
        assert_eq!(upper.links.len(), 3);
        let owners: Vec<&str> = upper
            .interfaces
            .iter()
            .map(|i| topo.name(topo.interface(*i).node))
            .collect();
        assert_eq!(owners, vec!["ap", "tr", "br"]);

        let access = &domains[0];
        assert_eq!(access.interfaces.len(), 6);
    }
}
