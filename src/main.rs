use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dmz_failover::{
    load_file, validate_station_count, FileConfig, GatewayStatus, Simulation, SimulationConfig,
    SpineNode,
};

/// DMZ Failover - redundant gateway routers in front of a firewalled server
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
struct Args {
    /// Number of wifi STA devices
    #[clap(long = "nWifi")]
    n_wifi: Option<u32>,

    /// Tell echo applications to log if true
    #[clap(short = 'v', long)]
    verbose: bool,

    /// Path to configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// Simulated run time in seconds
    #[clap(short = 'd', long)]
    duration: Option<u64>,
}

fn log_with_timestamp(msg: &str) {
    info!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), msg);
}

fn print_report(sim: &Simulation) {
    let topo = sim.topology();

    println!("Failover state: {}", sim.state());
    for gw in sim.gateways().iter() {
        let marker = if gw.status == GatewayStatus::Active { "*" } else { " " };
        println!(
            "{} {:<8} {:<3} {:?} (last load {:.0} B/s)",
            marker,
            gw.role,
            topo.name(gw.node),
            gw.status,
            gw.current_load
        );
    }

    println!("Controller events:");
    if sim.events().is_empty() {
        println!("  none");
    }
    for event in sim.events() {
        println!("  {}", event);
    }

    let server = topo.spine_node(SpineNode::Server);
    if let Some(sta) = topo.stations().first() {
        match sim.trace_path(*sta, server) {
            Ok(trace) => {
                let names: Vec<&str> = trace.nodes.iter().map(|n| topo.name(*n)).collect();
                println!(
                    "Path {} -> {}: {} ({} hops, {:?})",
                    topo.name(*sta),
                    topo.name(server),
                    names.join(" -> "),
                    trace.hop_count(),
                    trace.latency
                );
            }
            Err(e) => println!("Path {} -> {}: {}", topo.name(*sta), topo.name(server), e),
        }
    }

    let stats = sim.stats();
    println!(
        "Packets: {} sent, {} delivered, {} dropped, {} bytes delivered, {} frames flooded",
        stats.sent, stats.delivered, stats.dropped, stats.bytes_delivered, stats.flooded_frames
    );
    for (node, counters) in &stats.per_source {
        println!(
            "  {:<7} delivered {:>6} dropped {:>6}",
            topo.name(*node),
            counters.delivered,
            counters.dropped
        );
    }
    for (node, count) in &stats.forwarded {
        println!("  {:<7} forwarded {:>6}", topo.name(*node), count);
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    log_with_timestamp("Logger initialized");
    debug!("Command line arguments parsed: {:?}", args);

    // reject bad station counts before anything is built
    if let Some(n) = args.n_wifi {
        validate_station_count(n).context("Invalid --nWifi")?;
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("/etc/dmz-failover/config.toml"));
    let config_file: Option<FileConfig> = if config_path.exists() {
        log_with_timestamp(&format!("Reading configuration from {:?}", config_path));
        Some(load_file(&config_path).context(format!("Failed to load config file {:?}", config_path))?)
    } else {
        if args.config.is_some() {
            warn!("Configuration file {:?} does not exist, using defaults", config_path);
        }
        None
    };

    // Precedence: Args -> Config File -> Defaults
    let mut config = SimulationConfig::from_file_config(config_file.as_ref())
        .context("Invalid configuration")?;
    if let Some(n) = args.n_wifi {
        config.topology.n_wifi = n;
    }
    if let Some(secs) = args.duration {
        if secs == 0 {
            anyhow::bail!("--duration must be positive");
        }
        config.traffic.duration = Duration::from_secs(secs);
    }
    info!(
        "Stations: {}, duration: {:?}, sampling interval: {:?}",
        config.topology.n_wifi, config.traffic.duration, config.failover.sampling_interval
    );

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl-C handler")?;

    let mut sim = Simulation::new(&config).context("Failed to build the network")?;
    log_with_timestamp("Starting simulation");
    sim.run_while(config.traffic.duration, || running.load(Ordering::SeqCst));
    if !running.load(Ordering::SeqCst) {
        warn!("Interrupted at {:?}", sim.now());
    }
    log_with_timestamp(&format!("Simulation finished at {:?}", sim.now()));

    print_report(&sim);
    Ok(())
}
