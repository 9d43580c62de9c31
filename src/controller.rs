//! # Gateway failover controller
//!
//! Finite-state controller deciding which of the two gateway routers carries traffic into the
//! server segment. Load is sampled once per tick from both gateways at the same instant; the
//! controller debounces overload (`overload_confirm_count` consecutive samples) and delays the
//! switch-back (`stability_window` consecutive low samples) so a single spike or dip never moves
//! traffic.
//!
//! ```text
//!   BothHealthy --(overload x confirm)--> PrimaryOverloaded --(load < recovery)--> Recovering
//!        ^                                        ^                                    |
//!        |                                        +-------(load >= overload)-----------+
//!        +--------------------------(stability_window low samples)---------------------+
//! ```

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;

use crate::errors::{DmzError, DmzResult};
use crate::topology::NodeId;

/// Which of the two gateways
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayRole {
    Primary,
    Backup,
}

impl fmt::Display for GatewayRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayRole::Primary => f.write_str("primary"),
            GatewayRole::Backup => f.write_str("backup"),
        }
    }
}

/// Forwarding status of a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    /// Carries the server-segment route
    Active,
    /// Healthy, not carrying traffic
    Standby,
    /// Overloaded, must not carry traffic
    Degraded,
}

/// Runtime record of one gateway router
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayState {
    pub node: NodeId,
    pub role: GatewayRole,
    /// Last sampled load of the DMZ-facing interface, bytes/sec
    pub current_load: f64,
    pub overload_threshold: f64,
    pub status: GatewayStatus,
}

/// The primary and backup gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayPair {
    pub primary: GatewayState,
    pub backup: GatewayState,
}

impl GatewayPair {
    /// Primary Active, backup Standby, both overloaded at `overload_threshold` bytes/sec
    pub fn new(primary: NodeId, backup: NodeId, overload_threshold: f64) -> Self {
        GatewayPair {
            primary: GatewayState {
                node: primary,
                role: GatewayRole::Primary,
                current_load: 0.0,
                overload_threshold,
                status: GatewayStatus::Active,
            },
            backup: GatewayState {
                node: backup,
                role: GatewayRole::Backup,
                current_load: 0.0,
                overload_threshold,
                status: GatewayStatus::Standby,
            },
        }
    }

    pub fn get(&self, role: GatewayRole) -> &GatewayState {
        match role {
            GatewayRole::Primary => &self.primary,
            GatewayRole::Backup => &self.backup,
        }
    }

    pub fn get_mut(&mut self, role: GatewayRole) -> &mut GatewayState {
        match role {
            GatewayRole::Primary => &mut self.primary,
            GatewayRole::Backup => &mut self.backup,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &GatewayState> {
        [&self.primary, &self.backup].into_iter()
    }

    /// The gateway with status Active, if any
    pub fn active(&self) -> Option<&GatewayState> {
        self.iter().find(|g| g.status == GatewayStatus::Active)
    }

    /// Gateway allowed to forward into the server segment: the Active one, otherwise the first
    /// one that is not Degraded. `None` means the server segment is cut off.
    pub fn forwarding(&self) -> Option<&GatewayState> {
        self.active()
            .or_else(|| self.iter().find(|g| g.status != GatewayStatus::Degraded))
    }

    pub fn is_gateway(&self, node: NodeId) -> bool {
        self.primary.node == node || self.backup.node == node
    }

    fn set_status(&mut self, primary: GatewayStatus, backup: GatewayStatus) {
        self.primary.status = primary;
        self.backup.status = backup;
    }
}

/// Controller state per gateway pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    /// Primary Active, backup Standby
    BothHealthy,
    /// Primary Degraded, backup Active
    PrimaryOverloaded,
    /// Primary below the recovery threshold, backup still Active until the stability window
    /// elapses
    Recovering,
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tunables of the controller
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverSettings {
    pub sampling_interval: Duration,
    /// Load (bytes/sec) at or above which a gateway counts as overloaded
    pub overload_threshold: f64,
    /// Load (bytes/sec) below which an overloaded primary counts as recovered
    pub recovery_threshold: f64,
    pub overload_confirm_count: u32,
    pub stability_window: u32,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        FailoverSettings {
            sampling_interval: Duration::from_secs(1),
            overload_threshold: 1_000_000.0,
            recovery_threshold: 750_000.0,
            overload_confirm_count: 3,
            stability_window: 5,
        }
    }
}

impl FailoverSettings {
    pub fn validate(&self) -> DmzResult<()> {
        if self.sampling_interval.is_zero() {
            return Err(DmzError::Configuration(
                "sampling interval must be positive".to_string(),
            ));
        }
        if !(self.overload_threshold > 0.0 && self.recovery_threshold > 0.0) {
            return Err(DmzError::Configuration(
                "load thresholds must be positive".to_string(),
            ));
        }
        if self.recovery_threshold > self.overload_threshold {
            return Err(DmzError::Configuration(format!(
                "recovery threshold {} exceeds overload threshold {}",
                self.recovery_threshold, self.overload_threshold
            )));
        }
        if self.overload_confirm_count == 0 || self.stability_window == 0 {
            return Err(DmzError::Configuration(
                "overload confirm count and stability window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load of both gateways taken at one sampling instant, bytes/sec
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSnapshot {
    pub primary: f64,
    pub backup: f64,
}

impl LoadSnapshot {
    pub fn new(primary: f64, backup: f64) -> Self {
        Self { primary, backup }
    }
}

/// Observability event emitted by the controller (and by route computation for partitions)
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// State machine moved from `from` to `to`; `active` carries the server-segment route now
    Transition {
        at: Duration,
        from: FailoverState,
        to: FailoverState,
        active: GatewayRole,
    },
    /// Both gateways are at or above the overload threshold; `active` keeps forwarding
    BothOverloaded {
        at: Duration,
        primary_load: f64,
        backup_load: f64,
        active: GatewayRole,
    },
    /// No gateway may forward; the server segment is unreachable from these nodes
    NetworkPartitioned { at: Duration, unreachable: Vec<String> },
}

impl ControllerEvent {
    pub fn at(&self) -> Duration {
        match self {
            ControllerEvent::Transition { at, .. }
            | ControllerEvent::BothOverloaded { at, .. }
            | ControllerEvent::NetworkPartitioned { at, .. } => *at,
        }
    }

    pub fn is_transition(&self) -> bool {
        matches!(self, ControllerEvent::Transition { .. })
    }
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerEvent::Transition { at, from, to, active } => write!(
                f,
                "[{:>8.3}s] {} -> {} ({} gateway active)",
                at.as_secs_f64(),
                from,
                to,
                active
            ),
            ControllerEvent::BothOverloaded { at, primary_load, backup_load, active } => write!(
                f,
                "[{:>8.3}s] both gateways overloaded (primary {:.0} B/s, backup {:.0} B/s), keeping {}",
                at.as_secs_f64(),
                primary_load,
                backup_load,
                active
            ),
            ControllerEvent::NetworkPartitioned { at, unreachable } => write!(
                f,
                "[{:>8.3}s] network partitioned, server segment unreachable from {}",
                at.as_secs_f64(),
                unreachable.join(", ")
            ),
        }
    }
}

/// State machine over a [`GatewayPair`]
#[derive(Debug, Clone)]
pub struct FailoverController {
    settings: FailoverSettings,
    state: FailoverState,
    gateways: GatewayPair,
    overload_streak: u32,
    stable_streak: u32,
}

impl FailoverController {
    pub fn new(settings: FailoverSettings, gateways: GatewayPair) -> DmzResult<Self> {
        settings.validate()?;
        let mut gateways = gateways;
        for g in gateways.iter() {
            if !(g.overload_threshold.is_finite() && g.overload_threshold >= settings.recovery_threshold)
            {
                return Err(DmzError::Configuration(format!(
                    "invalid {} gateway overload threshold {} for recovery threshold {}",
                    g.role, g.overload_threshold, settings.recovery_threshold
                )));
            }
        }
        gateways.set_status(GatewayStatus::Active, GatewayStatus::Standby);
        Ok(Self {
            settings,
            state: FailoverState::BothHealthy,
            gateways,
            overload_streak: 0,
            stable_streak: 0,
        })
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn gateways(&self) -> &GatewayPair {
        &self.gateways
    }

    #[cfg(test)]
    pub(crate) fn gateways_mut(&mut self) -> &mut GatewayPair {
        &mut self.gateways
    }

    pub fn settings(&self) -> &FailoverSettings {
        &self.settings
    }

    /// Role of the gateway currently carrying the server-segment route
    pub fn active_role(&self) -> GatewayRole {
        match self.state {
            FailoverState::BothHealthy => GatewayRole::Primary,
            FailoverState::PrimaryOverloaded | FailoverState::Recovering => GatewayRole::Backup,
        }
    }

    /// Feed one sampling tick. Returns the events raised by this sample; gateway statuses are
    /// already updated when this returns.
    pub fn observe(&mut self, at: Duration, sample: LoadSnapshot) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        let recovery = self.settings.recovery_threshold;
        self.gateways.primary.current_load = sample.primary;
        self.gateways.backup.current_load = sample.backup;

        let primary_over = sample.primary >= self.gateways.primary.overload_threshold;
        let both_over = primary_over && sample.backup >= self.gateways.backup.overload_threshold;
        debug!(
            "Sample at {:?}: primary {:.0} B/s, backup {:.0} B/s in {}",
            at, sample.primary, sample.backup, self.state
        );

        if both_over {
            warn!(
                "Both gateways overloaded (primary {:.0} B/s, backup {:.0} B/s), keeping {} gateway",
                sample.primary,
                sample.backup,
                self.active_role()
            );
            events.push(ControllerEvent::BothOverloaded {
                at,
                primary_load: sample.primary,
                backup_load: sample.backup,
                active: self.active_role(),
            });
        }

        let next = match self.state {
            FailoverState::BothHealthy => {
                if primary_over && !both_over {
                    self.overload_streak += 1;
                    debug!(
                        "Primary overloaded {}/{}",
                        self.overload_streak, self.settings.overload_confirm_count
                    );
                } else {
                    self.overload_streak = 0;
                }
                (self.overload_streak >= self.settings.overload_confirm_count)
                    .then_some(FailoverState::PrimaryOverloaded)
            }
            FailoverState::PrimaryOverloaded => {
                (sample.primary < recovery).then_some(FailoverState::Recovering)
            }
            FailoverState::Recovering => {
                if primary_over {
                    info!("Primary overloaded again, cancelling switch-back");
                    Some(FailoverState::PrimaryOverloaded)
                } else if sample.primary < recovery {
                    self.stable_streak += 1;
                    debug!(
                        "Primary stable {}/{}",
                        self.stable_streak, self.settings.stability_window
                    );
                    (self.stable_streak >= self.settings.stability_window)
                        .then_some(FailoverState::BothHealthy)
                } else {
                    self.stable_streak = 0;
                    None
                }
            }
        };

        if let Some(to) = next {
            events.push(self.transition(at, to));
        }
        events
    }

    fn transition(&mut self, at: Duration, to: FailoverState) -> ControllerEvent {
        let from = self.state;
        self.state = to;
        self.overload_streak = 0;
        self.stable_streak = 0;
        match to {
            FailoverState::BothHealthy => self
                .gateways
                .set_status(GatewayStatus::Active, GatewayStatus::Standby),
            FailoverState::PrimaryOverloaded => self
                .gateways
                .set_status(GatewayStatus::Degraded, GatewayStatus::Active),
            FailoverState::Recovering => self
                .gateways
                .set_status(GatewayStatus::Standby, GatewayStatus::Active),
        }
        info!("Failover {} -> {} at {:?}, {} gateway active", from, to, at, self.active_role());
        ControllerEvent::Transition { at, from, to, active: self.active_role() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> FailoverController {
        let settings = FailoverSettings {
            overload_threshold: 100.0,
            recovery_threshold: 50.0,
            overload_confirm_count: 3,
            stability_window: 2,
            ..Default::default()
        };
        FailoverController::new(settings, GatewayPair::new(0.into(), 1.into(), 100.0)).unwrap()
    }

    fn tick(c: &mut FailoverController, n: u64, primary: f64, backup: f64) -> Vec<ControllerEvent> {
        c.observe(Duration::from_secs(n), LoadSnapshot::new(primary, backup))
    }

    #[test]
    fn test_transient_spike_ignored() {
        let mut c = controller();
        tick(&mut c, 1, 150.0, 0.0);
        tick(&mut c, 2, 150.0, 0.0);
        tick(&mut c, 3, 10.0, 0.0);
        tick(&mut c, 4, 150.0, 0.0);
        assert_eq!(c.state(), FailoverState::BothHealthy);
        assert_eq!(c.gateways().active().unwrap().role, GatewayRole::Primary);
    }

    #[test]
    fn test_hysteresis_band_resets_stability() {
        let mut c = controller();
        for n in 1..=3 {
            tick(&mut c, n, 150.0, 0.0);
        }
        assert_eq!(c.state(), FailoverState::PrimaryOverloaded);
        tick(&mut c, 4, 10.0, 0.0);
        assert_eq!(c.state(), FailoverState::Recovering);
        tick(&mut c, 5, 10.0, 0.0);
        // between recovery and overload threshold: no longer consecutive
        tick(&mut c, 6, 75.0, 0.0);
        tick(&mut c, 7, 10.0, 0.0);
        assert_eq!(c.state(), FailoverState::Recovering);
        let events = tick(&mut c, 8, 10.0, 0.0);
        assert_eq!(c.state(), FailoverState::BothHealthy);
        assert!(events.iter().any(|e| e.is_transition()));
    }

    #[test]
    fn test_invalid_settings() {
        let settings = FailoverSettings {
            recovery_threshold: 200.0,
            overload_threshold: 100.0,
            ..Default::default()
        };
        assert!(FailoverController::new(settings, GatewayPair::new(0.into(), 1.into(), 100.0)).is_err());

        // a gateway threshold below the recovery threshold could never recover
        let result = FailoverController::new(
            FailoverSettings::default(),
            GatewayPair::new(0.into(), 1.into(), 1.0),
        );
        assert!(matches!(result, Err(DmzError::Configuration(_))));

        let settings = FailoverSettings { stability_window: 0, ..Default::default() };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_per_gateway_thresholds() {
        let settings = FailoverSettings {
            overload_threshold: 100.0,
            recovery_threshold: 50.0,
            overload_confirm_count: 2,
            ..Default::default()
        };
        let mut pair = GatewayPair::new(0.into(), 1.into(), 100.0);
        pair.backup.overload_threshold = 1000.0;
        let mut c = FailoverController::new(settings, pair).unwrap();
        assert_eq!(c.gateways().backup.overload_threshold, 1000.0);

        // the backup is below its own threshold, so only the primary counts as overloaded
        let events = tick(&mut c, 1, 150.0, 500.0);
        assert!(events.is_empty());
        tick(&mut c, 2, 150.0, 500.0);
        assert_eq!(c.state(), FailoverState::PrimaryOverloaded);

        let events = tick(&mut c, 3, 150.0, 1500.0);
        assert!(matches!(events[..], [ControllerEvent::BothOverloaded { .. }]));
    }

    #[test]
    fn test_forwarding_fallback() {
        let mut pair = GatewayPair::new(0.into(), 1.into(), 1.0);
        pair.set_status(GatewayStatus::Degraded, GatewayStatus::Standby);
        assert!(pair.active().is_none());
        assert_eq!(pair.forwarding().unwrap().role, GatewayRole::Backup);
        pair.set_status(GatewayStatus::Degraded, GatewayStatus::Degraded);
        assert!(pair.forwarding().is_none());
    }
}
