//! # Address plan
//!
//! Numbers every addressable interface out of the block configured for its link group. Bridge
//! ports share the subnet of their broadcast domain and never receive an address themselves.

use std::collections::BTreeMap;

use ipnet::Ipv4Net;
use log::{debug, info};

use crate::bridge::broadcast_domains;
use crate::errors::{DmzError, DmzResult};
use crate::topology::{InterfaceId, LinkGroup, NodeId, Topology};

/// One address handed out by the plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub interface: InterfaceId,
    pub node: NodeId,
    pub group: LinkGroup,
    pub address: Ipv4Net,
}

/// Disjoint address blocks, one per link group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPlan {
    blocks: BTreeMap<LinkGroup, Ipv4Net>,
}

impl Default for AddressPlan {
    fn default() -> Self {
        let blocks = [
            (LinkGroup::Access, Ipv4Net::new([10, 1, 1, 0].into(), 24)),
            (LinkGroup::UpperDmz, Ipv4Net::new([192, 168, 2, 0].into(), 24)),
            (LinkGroup::LowerDmz, Ipv4Net::new([192, 168, 3, 0].into(), 24)),
            (LinkGroup::Server, Ipv4Net::new([10, 1, 2, 0].into(), 24)),
        ]
        .into_iter()
        .filter_map(|(group, block)| block.ok().map(|b| (group, b)))
        .collect();
        AddressPlan { blocks }
    }
}

impl AddressPlan {
    /// Create a plan from a block per group. Blocks are normalized to their network address and
    /// must not overlap.
    pub fn new<I>(blocks: I) -> DmzResult<Self>
    where
        I: IntoIterator<Item = (LinkGroup, Ipv4Net)>,
    {
        let mut plan = AddressPlan { blocks: BTreeMap::new() };
        for (group, block) in blocks {
            plan.set_block(group, block)?;
        }
        Ok(plan)
    }

    /// Replace the block of one group
    pub fn set_block(&mut self, group: LinkGroup, block: Ipv4Net) -> DmzResult<()> {
        let block = block.trunc();
        for (other_group, other) in self.blocks.iter().filter(|(g, _)| **g != group) {
            if other.contains(&block.network()) || block.contains(&other.network()) {
                return Err(DmzError::Configuration(format!(
                    "address block {} of group {} overlaps {} of group {}",
                    block, group, other, other_group
                )));
            }
        }
        self.blocks.insert(group, block);
        Ok(())
    }

    pub fn block(&self, group: LinkGroup) -> Option<Ipv4Net> {
        self.blocks.get(&group).copied()
    }

    pub fn blocks(&self) -> impl Iterator<Item = (LinkGroup, Ipv4Net)> + '_ {
        self.blocks.iter().map(|(g, b)| (*g, *b))
    }

    /// Assign an address to every interface of every broadcast domain. Nothing is written to the
    /// topology unless all groups fit into their blocks.
    pub fn assign(&self, topo: &mut Topology) -> DmzResult<Vec<Assignment>> {
        let mut assignments = Vec::new();

        for domain in broadcast_domains(topo)? {
            let block = self.block(domain.group).ok_or_else(|| {
                DmzError::Configuration(format!("no address block for group {}", domain.group))
            })?;
            let available = block.hosts().count();
            if domain.interfaces.len() > available {
                return Err(DmzError::AddressExhaustion {
                    group: domain.group,
                    block,
                    required: domain.interfaces.len(),
                    available,
                });
            }
            for (iface, host) in domain.interfaces.iter().zip(block.hosts()) {
                let address = Ipv4Net::new(host, block.prefix_len()).map_err(|e| {
                    DmzError::Configuration(format!("invalid address {}: {}", host, e))
                })?;
                assignments.push(Assignment {
                    interface: *iface,
                    node: topo.interface(*iface).node,
                    group: domain.group,
                    address,
                });
            }
        }

        for a in &assignments {
            debug!("{} {:?} <- {}", topo.name(a.node), a.interface, a.address);
            topo.interface_mut(a.interface).address = Some(a.address);
        }
        info!("Assigned {} addresses in {} groups", assignments.len(), self.blocks.len());
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologySpec;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_overlapping_blocks_rejected() {
        let result = AddressPlan::new([
            (LinkGroup::Access, net("10.1.0.0/16")),
            (LinkGroup::Server, net("10.1.2.0/24")),
        ]);
        assert!(matches!(result, Err(DmzError::Configuration(_))));
    }

    #[test]
    fn test_block_is_normalized() {
        let plan = AddressPlan::new([(LinkGroup::Access, net("10.1.1.77/24"))]).unwrap();
        assert_eq!(plan.block(LinkGroup::Access), Some(net("10.1.1.0/24")));
    }

    #[test]
    fn test_stations_numbered_before_ap() {
        let mut topo = Topology::build(&TopologySpec::with_stations(2)).unwrap();
        let assignments = AddressPlan::default().assign(&mut topo).unwrap();
        let access: Vec<(String, String)> = assignments
            .iter()
            .filter(|a| a.group == LinkGroup::Access)
            .map(|a| (topo.name(a.node).to_string(), a.address.to_string()))
            .collect();
        assert_eq!(
            access,
            vec![
                ("sta0".to_string(), "10.1.1.1/24".to_string()),
                ("sta1".to_string(), "10.1.1.2/24".to_string()),
                ("ap".to_string(), "10.1.1.3/24".to_string()),
            ]
        );
    }

    #[test]
    fn test_missing_block() {
        let mut topo = Topology::build(&TopologySpec::default()).unwrap();
        let plan = AddressPlan::new([(LinkGroup::Access, net("10.1.1.0/24"))]).unwrap();
        assert!(matches!(plan.assign(&mut topo), Err(DmzError::Configuration(_))));
    }
}
