#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use dmz_failover::topology::{LinkKind, Medium, SpineLink};
    use dmz_failover::{AddressPlan, DmzError, LinkGroup, SpineNode, Topology, TopologySpec};

    fn addressed(n_wifi: u32) -> (Topology, Vec<dmz_failover::Assignment>) {
        let mut topo = Topology::build(&TopologySpec::with_stations(n_wifi)).unwrap();
        let assignments = AddressPlan::default().assign(&mut topo).unwrap();
        (topo, assignments)
    }

    #[test]
    fn test_topology_is_connected() {
        let (topo, _) = addressed(5);
        assert_eq!(petgraph::algo::connected_components(topo.graph()), 1);
        assert_eq!(topo.nodes().count(), 12);
        for node in topo.nodes() {
            assert!(!node.interfaces.is_empty(), "{} has no interface", node.name);
        }
        for name in ["ap", "Fst", "Lst", "tr", "br", "fw", "server", "sta0", "sta4"] {
            assert!(topo.node_by_name(name).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn test_addresses_distinct_and_inside_blocks() {
        let (topo, assignments) = addressed(5);
        let plan = AddressPlan::default();

        let mut seen = HashSet::new();
        for a in &assignments {
            assert!(seen.insert(a.address.addr()), "duplicate {}", a.address);
            let block = plan.block(a.group).unwrap();
            assert!(block.contains(&a.address.addr()));
            assert_eq!(a.address.prefix_len(), block.prefix_len());
        }

        // every non-switch interface got exactly one address, switch ports none
        for iface in topo.interfaces() {
            let is_switch = [SpineNode::Switch1, SpineNode::Switch2]
                .iter()
                .any(|s| topo.spine_node(*s) == iface.node);
            assert_eq!(iface.address.is_none(), is_switch);
        }
    }

    #[test]
    fn test_gateway_subnets() {
        let (topo, _) = addressed(5);
        let tr = topo.spine_node(SpineNode::PrimaryRouter);
        let br = topo.spine_node(SpineNode::BackupRouter);
        for router in [tr, br] {
            let upper = topo.interface_in_group(router, LinkGroup::UpperDmz).unwrap();
            let lower = topo.dmz_interface(router).unwrap();
            assert!(topo.interface(upper).ip().unwrap().octets().starts_with(&[192, 168, 2]));
            assert!(topo.interface(lower).ip().unwrap().octets().starts_with(&[192, 168, 3]));
        }
    }

    #[test]
    fn test_wireless_is_shared_through_ap() {
        let (topo, _) = addressed(3);
        let ap = topo.spine_node(SpineNode::AccessPoint);
        let wireless: Vec<_> = topo.links().filter(|l| l.medium == Medium::Shared).collect();
        assert_eq!(wireless.len(), 1);
        assert_eq!(wireless[0].endpoints.len(), 4);
        let hub = wireless[0].hub.unwrap();
        assert_eq!(topo.interface(hub).node, ap);
    }

    #[test]
    fn test_address_exhaustion() {
        let mut topo = Topology::build(&TopologySpec::default()).unwrap();
        let mut plan = AddressPlan::default();
        plan.set_block(LinkGroup::Access, "10.1.1.0/30".parse().unwrap()).unwrap();
        match plan.assign(&mut topo) {
            Err(DmzError::AddressExhaustion { group, required, available, .. }) => {
                assert_eq!(group, LinkGroup::Access);
                assert_eq!(required, 6);
                assert_eq!(available, 2);
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        // nothing was written
        assert!(topo.interfaces().all(|i| i.address.is_none()));
    }

    #[test]
    fn test_station_limits() {
        assert!(Topology::build(&TopologySpec::with_stations(250)).is_ok());
        assert!(matches!(
            Topology::build(&TopologySpec::with_stations(251)),
            Err(DmzError::Configuration(_))
        ));
        assert!(matches!(
            Topology::build(&TopologySpec::with_stations(0)),
            Err(DmzError::Configuration(_))
        ));
    }

    #[test]
    fn test_duplicate_spine_link_rejected() {
        let mut spec = TopologySpec::default();
        spec.spine.push(SpineLink::new(
            SpineNode::Switch1,
            SpineNode::AccessPoint,
            LinkKind::Csma,
            LinkGroup::UpperDmz,
        ));
        assert!(matches!(Topology::build(&spec), Err(DmzError::Configuration(_))));
    }

    #[test]
    fn test_missing_spine_link_isolates_server() {
        let mut spec = TopologySpec::default();
        spec.spine.retain(|l| l.b != SpineNode::Server);
        assert!(matches!(Topology::build(&spec), Err(DmzError::Configuration(_))));
    }
}
