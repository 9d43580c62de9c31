//! # Discrete-event timeline
//!
//! Everything that changes state is an event ordered by simulated time and processed one at a
//! time: packet forwarding, background load, and the periodic sampling tick that feeds the
//! failover controller. Forwarding adds the packet size to the load counter of every router
//! egress interface it leaves through; the tick turns the DMZ-facing counters of both gateways
//! into one load snapshot, resets all counters, runs the controller, and recomputes routes in the
//! same step when the active gateway changed.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::time::Duration;

use ipnet::Ipv4Net;
use log::{debug, error, info, warn};

use crate::addressing::Assignment;
use crate::bridge::{BridgingLayer, Delivery};
use crate::config::SimulationConfig;
use crate::controller::{
    ControllerEvent, FailoverController, FailoverState, GatewayPair, GatewayRole, LoadSnapshot,
};
use crate::errors::{DmzError, DmzResult};
use crate::routing::{
    compute_routes, missing_route, server_prefix, trace_path, ForwardingTable, NextHop, PathTrace,
    RouteSet,
};
use crate::topology::{Capability, InterfaceId, LinkId, NodeId, SpineNode, Topology};

/// Traffic offered to the network during one sampling interval
#[derive(Debug, Clone, PartialEq)]
pub enum Traffic {
    /// One packet from `src` to `dst`; the destination answers when `echo` is set
    Packet { src: NodeId, dst: NodeId, bytes: u64, echo: bool },
    /// Load arriving at a gateway's DMZ-facing interface from outside the modeled hosts
    Background { gateway: GatewayRole, bytes: u64 },
}

/// Application layer producing traffic
#[cfg_attr(test, mockall::automock)]
pub trait TrafficSource {
    /// Traffic for the interval `[now, now + interval)`
    fn generate(&mut self, topo: &Topology, now: Duration, interval: Duration) -> Vec<Traffic>;
}

/// Largest accepted burst rate in bytes/sec
pub const MAX_BURST_RATE: f64 = 1e12;

/// Background load applied to one gateway during a time window
#[derive(Debug, Clone, PartialEq)]
pub struct Burst {
    pub gateway: GatewayRole,
    pub start: Duration,
    pub end: Duration,
    pub bytes_per_sec: f64,
}

/// Settings of the built-in echo traffic
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficSettings {
    pub packet_size: u64,
    /// Packets each station sends to the server per sampling interval
    pub packets_per_interval: u32,
    /// Whether the server answers every packet
    pub echo: bool,
    /// How long the timeline runs
    pub duration: Duration,
    pub bursts: Vec<Burst>,
}

impl Default for TrafficSettings {
    fn default() -> Self {
        TrafficSettings {
            packet_size: 1024,
            packets_per_interval: 1,
            echo: true,
            duration: Duration::from_secs(60),
            bursts: vec![Burst {
                gateway: GatewayRole::Primary,
                start: Duration::from_secs(10),
                end: Duration::from_secs(25),
                bytes_per_sec: 2_000_000.0,
            }],
        }
    }
}

/// UDP-echo style traffic: every station talks to the server, plus configured bursts
#[derive(Debug, Clone)]
pub struct EchoTraffic {
    settings: TrafficSettings,
}

impl EchoTraffic {
    pub fn new(settings: TrafficSettings) -> Self {
        Self { settings }
    }
}

impl TrafficSource for EchoTraffic {
    fn generate(&mut self, topo: &Topology, now: Duration, interval: Duration) -> Vec<Traffic> {
        let server = topo.spine_node(SpineNode::Server);
        let mut traffic = Vec::new();
        for _ in 0..self.settings.packets_per_interval {
            for sta in topo.stations() {
                traffic.push(Traffic::Packet {
                    src: *sta,
                    dst: server,
                    bytes: self.settings.packet_size,
                    echo: self.settings.echo,
                });
            }
        }

        let window_end = now + interval;
        for burst in &self.settings.bursts {
            let start = burst.start.max(now);
            let end = burst.end.min(window_end);
            if end > start {
                let bytes = (burst.bytes_per_sec * (end - start).as_secs_f64()) as u64;
                traffic.push(Traffic::Background { gateway: burst.gateway, bytes });
            }
        }
        traffic
    }
}

/// Delivered and dropped packets sent by one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounters {
    pub delivered: u64,
    pub dropped: u64,
}

/// Packet counters of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrafficStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub bytes_delivered: u64,
    /// Frames a bridge had to flood because the destination was not learned yet
    pub flooded_frames: u64,
    /// Packets forwarded per routed node
    pub forwarded: BTreeMap<NodeId, u64>,
    /// Outcome of the packets each node sent
    pub per_source: BTreeMap<NodeId, NodeCounters>,
}

#[derive(Debug, Clone)]
enum Event {
    SampleTick,
    Packet { src: NodeId, dst: NodeId, bytes: u64, echo: bool },
    Background { gateway: GatewayRole, bytes: u64 },
}

#[derive(Debug)]
struct Scheduled {
    at: Duration,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

/// The simulation context: owns the topology arena, bridges, routes, controller and timeline.
pub struct Simulation {
    topology: Topology,
    bridges: BridgingLayer,
    assignments: Vec<Assignment>,
    controller: FailoverController,
    routes: RouteSet,
    server_prefix: Ipv4Net,
    traffic: Box<dyn TrafficSource>,
    queue: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
    now: Duration,
    events: Vec<ControllerEvent>,
    stats: TrafficStats,
    partitioned: bool,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("now", &self.now)
            .field("state", &self.controller.state())
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl Simulation {
    /// Build the network with the built-in echo traffic
    pub fn new(config: &SimulationConfig) -> DmzResult<Self> {
        Self::with_traffic(config, Box::new(EchoTraffic::new(config.traffic.clone())))
    }

    /// Build topology, bridges and addresses, compute the initial routes, and schedule the first
    /// sampling tick.
    pub fn with_traffic(
        config: &SimulationConfig,
        traffic: Box<dyn TrafficSource>,
    ) -> DmzResult<Self> {
        config.failover.validate()?;
        let mut topology = Topology::build(&config.topology)?;
        let bridges = BridgingLayer::new(&topology)?;
        let assignments = config.addressing.assign(&mut topology)?;
        let server_prefix = server_prefix(&topology).ok_or_else(|| {
            DmzError::Configuration("server segment has no addresses".to_string())
        })?;

        let gateways = GatewayPair::new(
            topology.spine_node(SpineNode::PrimaryRouter),
            topology.spine_node(SpineNode::BackupRouter),
            config.failover.overload_threshold,
        );
        let controller = FailoverController::new(config.failover.clone(), gateways)?;

        let mut sim = Simulation {
            topology,
            bridges,
            assignments,
            controller,
            routes: RouteSet::default(),
            server_prefix,
            traffic,
            queue: BinaryHeap::new(),
            seq: 0,
            now: Duration::ZERO,
            events: Vec::new(),
            stats: TrafficStats::default(),
            partitioned: false,
        };
        sim.recompute_routes();
        sim.schedule_interval();
        Ok(sim)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn state(&self) -> FailoverState {
        self.controller.state()
    }

    pub fn gateways(&self) -> &GatewayPair {
        self.controller.gateways()
    }

    pub fn routes(&self) -> &RouteSet {
        &self.routes
    }

    pub fn forwarding_table(&self, node: NodeId) -> Option<&ForwardingTable> {
        self.routes.table(node)
    }

    pub fn bridges(&self) -> &BridgingLayer {
        &self.bridges
    }

    /// Controller event feed, oldest first
    pub fn events(&self) -> &[ControllerEvent] {
        &self.events
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.stats
    }

    /// Path a packet from `src` to `dst` takes right now
    pub fn trace_path(&self, src: NodeId, dst: NodeId) -> DmzResult<PathTrace> {
        trace_path(&self.topology, &self.routes, src, dst)
    }

    /// Add background bytes to a gateway's DMZ-facing interface
    pub fn inject_background(&mut self, gateway: GatewayRole, bytes: u64) {
        let node = self.gateways().get(gateway).node;
        if let Some(iface) = self.topology.dmz_interface(node) {
            self.topology.add_load(iface, bytes);
        }
    }

    /// Process the next event. Returns `false` once the queue is empty.
    pub fn step(&mut self) -> bool {
        match self.queue.pop() {
            Some(Reverse(next)) => {
                self.process(next);
                true
            }
            None => false,
        }
    }

    /// Process events up to and including the next sampling tick
    pub fn advance_tick(&mut self) {
        while let Some(Reverse(next)) = self.queue.pop() {
            if self.process(next) {
                break;
            }
        }
    }

    /// Run until simulated time `end`
    pub fn run_until(&mut self, end: Duration) {
        self.run_while(end, || true);
    }

    /// Run until simulated time `end` or until `keep_running` returns false
    pub fn run_while<F: FnMut() -> bool>(&mut self, end: Duration, mut keep_running: F) {
        while keep_running() {
            let due = matches!(self.queue.peek(), Some(Reverse(next)) if next.at <= end);
            if !due {
                break;
            }
            self.step();
        }
    }

    /// Send one packet through the data plane right now. Returns every node the packet crossed.
    pub fn send(&mut self, src: NodeId, dst: NodeId, bytes: u64) -> DmzResult<Vec<NodeId>> {
        self.topology.node(src)?;
        let dst_name = self.topology.node(dst)?.name.clone();
        let no_route = |topo: &Topology, at: NodeId| DmzError::NoRoute {
            from: topo.name(at).to_string(),
            to: dst_name.clone(),
        };
        let dst_addr = self
            .topology
            .primary_address(dst)
            .ok_or_else(|| no_route(&self.topology, src))?;

        let max_hops = self.topology.nodes().count();
        let mut path = vec![src];
        let mut current = src;
        while self.topology.primary_address(current) != Some(dst_addr) {
            if path.len() > max_hops {
                return Err(no_route(&self.topology, current));
            }
            let entry = match self.routes.table(current).and_then(|t| t.lookup(dst_addr)) {
                Some(entry) => *entry,
                None => {
                    return Err(missing_route(&self.topology, &self.routes, current, dst, dst_addr))
                }
            };
            let target = match entry.next_hop {
                NextHop::Connected => self
                    .topology
                    .interface_by_address(dst_addr)
                    .ok_or_else(|| no_route(&self.topology, current))?,
                NextHop::Via { interface, .. } => interface,
            };

            let forwards = current != src
                && self.topology.role(current).map(|r| r.capability()) == Some(Capability::Router);
            if forwards {
                self.topology.add_load(entry.egress, bytes);
                *self.stats.forwarded.entry(current).or_default() += 1;
            }

            let segment = self
                .deliver_frame(entry.egress, target)
                .ok_or_else(|| no_route(&self.topology, current))?;
            current = *segment.last().ok_or_else(|| no_route(&self.topology, current))?;
            path.extend(segment);
        }
        debug!(
            "{} -> {}: {} hops",
            self.topology.name(src),
            dst_name,
            path.len() - 1
        );
        Ok(path)
    }

    /// Carry a frame from `egress` to `target` across any bridges in between. Returns the nodes
    /// reached, ending with the owner of `target`.
    fn deliver_frame(&mut self, egress: InterfaceId, target: InterfaceId) -> Option<Vec<NodeId>> {
        let src_mac = self.topology.interface(egress).mac;
        let dst_mac = self.topology.interface(target).mac;
        let target_link = self.topology.interface(target).link;
        let mut link = self.topology.interface(egress).link;
        let mut from_switch: Option<NodeId> = None;
        let mut hops = Vec::new();

        for _ in 0..=self.bridges.len() {
            if link == target_link {
                hops.push(self.topology.interface(target).node);
                return Some(hops);
            }
            let port = self.topology.link(link).endpoints.iter().copied().find(|i| {
                let owner = self.topology.interface(*i).node;
                Some(owner) != from_switch && self.bridges.bridge(owner).is_some()
            })?;
            let switch = self.topology.interface(port).node;
            hops.push(switch);

            let delivery = self.bridges.bridge_mut(switch)?.receive(port, src_mac, dst_mac);
            let out = match delivery {
                Delivery::Forward(out) => out,
                Delivery::Flood(ports) => {
                    self.stats.flooded_frames += 1;
                    ports.into_iter().find(|p| {
                        let next = self.topology.interface(*p).link;
                        reaches(&self.topology, &self.bridges, next, target, switch)
                    })?
                }
                Delivery::Filter => return None,
            };
            from_switch = Some(switch);
            link = self.topology.interface(out).link;
        }
        None
    }

    fn schedule(&mut self, at: Duration, event: Event) {
        self.seq += 1;
        self.queue.push(Reverse(Scheduled { at, seq: self.seq, event }));
    }

    /// Ask the traffic source for the next interval, spread it evenly inside the interval, and
    /// schedule the tick that closes it.
    fn schedule_interval(&mut self) {
        let interval = self.controller.settings().sampling_interval;
        let traffic = self.traffic.generate(&self.topology, self.now, interval);
        let slots = traffic.len() as u32 + 1;
        for (k, t) in traffic.into_iter().enumerate() {
            let at = self.now + interval * (k as u32 + 1) / slots;
            let event = match t {
                Traffic::Packet { src, dst, bytes, echo } => Event::Packet { src, dst, bytes, echo },
                Traffic::Background { gateway, bytes } => Event::Background { gateway, bytes },
            };
            self.schedule(at, event);
        }
        self.schedule(self.now + interval, Event::SampleTick);
    }

    /// Returns whether the event was a sampling tick
    fn process(&mut self, next: Scheduled) -> bool {
        self.now = next.at;
        match next.event {
            Event::SampleTick => {
                self.on_sample_tick();
                true
            }
            Event::Packet { src, dst, bytes, echo } => {
                self.on_packet(src, dst, bytes, echo);
                false
            }
            Event::Background { gateway, bytes } => {
                self.inject_background(gateway, bytes);
                false
            }
        }
    }

    fn on_packet(&mut self, src: NodeId, dst: NodeId, bytes: u64, echo: bool) {
        self.stats.sent += 1;
        let result = self.send(src, dst, bytes);
        let counters = self.stats.per_source.entry(src).or_default();
        match result {
            Ok(_) => {
                counters.delivered += 1;
                self.stats.delivered += 1;
                self.stats.bytes_delivered = self.stats.bytes_delivered.saturating_add(bytes);
                if echo {
                    self.schedule(self.now, Event::Packet { src: dst, dst: src, bytes, echo: false });
                }
            }
            Err(e) => {
                counters.dropped += 1;
                self.stats.dropped += 1;
                let (from, to) = (self.topology.name(src), self.topology.name(dst));
                if matches!(e, DmzError::NetworkPartitioned { .. }) {
                    error!("Dropped packet {} -> {}: {}", from, to, e);
                } else {
                    warn!("Dropped packet {} -> {}: {}", from, to, e);
                }
            }
        }
    }

    fn gateway_load(&self, role: GatewayRole) -> u64 {
        let node = self.gateways().get(role).node;
        self.topology
            .dmz_interface(node)
            .map(|i| self.topology.interface(i).load_bytes)
            .unwrap_or(0)
    }

    fn on_sample_tick(&mut self) {
        let secs = self.controller.settings().sampling_interval.as_secs_f64();
        let snapshot = LoadSnapshot::new(
            self.gateway_load(GatewayRole::Primary) as f64 / secs,
            self.gateway_load(GatewayRole::Backup) as f64 / secs,
        );
        self.topology.reset_loads();

        let active_before = self.controller.active_role();
        let events = self.controller.observe(self.now, snapshot);
        self.events.extend(events);
        if self.controller.active_role() != active_before {
            self.recompute_routes();
        }
        self.schedule_interval();
    }

    /// Replace all forwarding tables with ones matching the current gateway states
    fn recompute_routes(&mut self) {
        let routes = compute_routes(&self.topology, self.controller.gateways());
        let cut_off: Vec<String> = routes
            .cut_off_from(self.server_prefix)
            .into_iter()
            .map(|n| self.topology.name(n).to_string())
            .collect();

        if !cut_off.is_empty() && !self.partitioned {
            error!(
                "Network partitioned: {} unreachable from {}",
                self.server_prefix,
                cut_off.join(", ")
            );
            self.events.push(ControllerEvent::NetworkPartitioned {
                at: self.now,
                unreachable: cut_off.clone(),
            });
        }
        self.partitioned = !cut_off.is_empty();

        let via = self
            .controller
            .gateways()
            .forwarding()
            .map(|g| self.topology.name(g.node).to_string())
            .unwrap_or_else(|| "none".to_string());
        info!("Routes computed at {:?}, server segment via {}", self.now, via);
        self.routes = routes;
    }
}

/// Whether `target` sits on `link` or behind a bridge on it other than `from_switch`
fn reaches(
    topo: &Topology,
    bridges: &BridgingLayer,
    link: LinkId,
    target: InterfaceId,
    from_switch: NodeId,
) -> bool {
    let l = topo.link(link);
    if l.endpoints.contains(&target) {
        return true;
    }
    l.endpoints.iter().any(|i| {
        let owner = topo.interface(*i).node;
        owner != from_switch
            && bridges.bridge(owner).map_or(false, |b| {
                b.ports()
                    .iter()
                    .filter(|p| topo.interface(**p).link != link)
                    .any(|p| reaches(topo, bridges, topo.interface(*p).link, target, owner))
            })
    })
}
