//! Configuration file handling. Every table and key is optional; missing values fall back to the
//! built-in scenario.

use std::path::Path;
use std::time::Duration;

use ipnet::Ipv4Net;
use log::debug;
use serde::Deserialize;

use crate::addressing::AddressPlan;
use crate::controller::{FailoverSettings, GatewayRole};
use crate::errors::{DmzError, DmzResult};
use crate::simulation::{Burst, TrafficSettings, MAX_BURST_RATE};
use crate::topology::{
    parse_data_rate, validate_station_count, LinkAttributes, LinkGroup, TopologySpec,
};

/// Contents of a TOML configuration file
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FileConfig {
    pub topology: Option<TopologyConfig>,
    pub links: Option<LinksConfig>,
    pub addressing: Option<AddressingConfig>,
    pub failover: Option<FailoverConfig>,
    pub traffic: Option<TrafficConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TopologyConfig {
    pub n_wifi: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LinksConfig {
    pub wireless: Option<LinkConfig>,
    pub p2p: Option<LinkConfig>,
    pub csma: Option<LinkConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LinkConfig {
    /// Rate string such as `"100Mbps"`
    pub data_rate: Option<String>,
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AddressingConfig {
    pub access: Option<Ipv4Net>,
    pub upper_dmz: Option<Ipv4Net>,
    pub lower_dmz: Option<Ipv4Net>,
    pub server: Option<Ipv4Net>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct FailoverConfig {
    pub sampling_interval_ms: Option<u64>,
    pub overload_threshold: Option<f64>,
    pub recovery_threshold: Option<f64>,
    pub overload_confirm_count: Option<u32>,
    pub stability_window: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TrafficConfig {
    pub packet_size: Option<u64>,
    pub packets_per_interval: Option<u32>,
    pub duration_s: Option<u64>,
    pub echo: Option<bool>,
    /// Replaces the default burst list when present
    pub bursts: Option<Vec<BurstConfig>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BurstConfig {
    pub gateway: GatewayRole,
    pub start_s: u64,
    pub end_s: u64,
    pub bytes_per_sec: f64,
}

/// Everything needed to build and run a simulation
#[derive(Debug, Clone, Default)]
pub struct SimulationConfig {
    pub topology: TopologySpec,
    pub addressing: AddressPlan,
    pub failover: FailoverSettings,
    pub traffic: TrafficSettings,
}

/// Read and parse a configuration file
pub fn load_file(path: &Path) -> DmzResult<FileConfig> {
    debug!("Reading configuration from {:?}", path);
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

fn link_attributes(config: Option<&LinkConfig>, default: LinkAttributes) -> DmzResult<LinkAttributes> {
    let Some(c) = config else {
        return Ok(default);
    };
    let data_rate_bps = match &c.data_rate {
        Some(rate) => parse_data_rate(rate)?,
        None => default.data_rate_bps,
    };
    let delay = c.delay_ms.map(Duration::from_millis).unwrap_or(default.delay);
    Ok(LinkAttributes::new(data_rate_bps, delay))
}

impl SimulationConfig {
    /// Apply the values present in `file` on top of the defaults and validate the result.
    pub fn from_file_config(file: Option<&FileConfig>) -> DmzResult<Self> {
        let mut config = SimulationConfig::default();
        let Some(file) = file else {
            return Ok(config);
        };

        if let Some(n) = file.topology.as_ref().and_then(|t| t.n_wifi) {
            config.topology.n_wifi = n;
        }
        validate_station_count(config.topology.n_wifi)?;

        if let Some(links) = &file.links {
            let t = &mut config.topology;
            t.wireless = link_attributes(links.wireless.as_ref(), t.wireless)?;
            t.p2p = link_attributes(links.p2p.as_ref(), t.p2p)?;
            t.csma = link_attributes(links.csma.as_ref(), t.csma)?;
        }

        if let Some(a) = &file.addressing {
            let overrides = [
                (LinkGroup::Access, a.access),
                (LinkGroup::UpperDmz, a.upper_dmz),
                (LinkGroup::LowerDmz, a.lower_dmz),
                (LinkGroup::Server, a.server),
            ];
            // start from the defaults minus the replaced groups, so swapping two blocks works
            let mut plan = AddressPlan::new(
                config
                    .addressing
                    .blocks()
                    .filter(|(g, _)| !overrides.iter().any(|(o, b)| o == g && b.is_some())),
            )?;
            for (group, block) in overrides {
                if let Some(block) = block {
                    plan.set_block(group, block)?;
                }
            }
            config.addressing = plan;
        }

        if let Some(f) = &file.failover {
            let s = &mut config.failover;
            if let Some(ms) = f.sampling_interval_ms {
                s.sampling_interval = Duration::from_millis(ms);
            }
            s.overload_threshold = f.overload_threshold.unwrap_or(s.overload_threshold);
            s.recovery_threshold = f.recovery_threshold.unwrap_or(s.recovery_threshold);
            s.overload_confirm_count = f.overload_confirm_count.unwrap_or(s.overload_confirm_count);
            s.stability_window = f.stability_window.unwrap_or(s.stability_window);
        }
        config.failover.validate()?;

        if let Some(t) = &file.traffic {
            let s = &mut config.traffic;
            s.packet_size = t.packet_size.unwrap_or(s.packet_size);
            s.packets_per_interval = t.packets_per_interval.unwrap_or(s.packets_per_interval);
            s.echo = t.echo.unwrap_or(s.echo);
            if let Some(secs) = t.duration_s {
                s.duration = Duration::from_secs(secs);
            }
            if let Some(bursts) = &t.bursts {
                s.bursts = bursts
                    .iter()
                    .map(|b| Burst {
                        gateway: b.gateway,
                        start: Duration::from_secs(b.start_s),
                        end: Duration::from_secs(b.end_s),
                        bytes_per_sec: b.bytes_per_sec,
                    })
                    .collect();
            }
        }
        config.validate_traffic()?;
        Ok(config)
    }

    fn validate_traffic(&self) -> DmzResult<()> {
        let t = &self.traffic;
        if t.packet_size == 0 {
            return Err(DmzError::Configuration("packet size must be positive".to_string()));
        }
        if t.duration.is_zero() {
            return Err(DmzError::Configuration("duration must be positive".to_string()));
        }
        for b in &t.bursts {
            let rate_ok = b.bytes_per_sec.is_finite()
                && (0.0..=MAX_BURST_RATE).contains(&b.bytes_per_sec);
            if b.end <= b.start || !rate_ok {
                return Err(DmzError::Configuration(format!(
                    "invalid {} burst {:?}..{:?} at {} bytes/sec",
                    b.gateway, b.start, b.end, b.bytes_per_sec
                )));
            }
        }
        Ok(())
    }
}
