#[cfg(test)]
mod tests {
    use std::time::Duration;

    use dmz_failover::{
        ControllerEvent, FailoverController, FailoverSettings, FailoverState, GatewayPair,
        GatewayRole, GatewayStatus, LoadSnapshot,
    };

    const OVER: f64 = 1_500_000.0;
    const BAND: f64 = 900_000.0;
    const QUIET: f64 = 10_000.0;

    fn controller() -> FailoverController {
        let gateways = GatewayPair::new(0.into(), 1.into(), 1_000_000.0);
        FailoverController::new(FailoverSettings::default(), gateways).unwrap()
    }

    struct Driver {
        controller: FailoverController,
        tick: u64,
        events: Vec<ControllerEvent>,
    }

    impl Driver {
        fn new() -> Self {
            Self { controller: controller(), tick: 0, events: Vec::new() }
        }

        fn feed(&mut self, primary: f64, backup: f64) -> FailoverState {
            self.tick += 1;
            let events = self
                .controller
                .observe(Duration::from_secs(self.tick), LoadSnapshot::new(primary, backup));
            self.events.extend(events);
            self.controller.state()
        }

        fn active_count(&self) -> usize {
            self.controller
                .gateways()
                .iter()
                .filter(|g| g.status == GatewayStatus::Active)
                .count()
        }

        fn transitions(&self) -> Vec<(u64, FailoverState)> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    ControllerEvent::Transition { at, to, .. } => Some((at.as_secs(), *to)),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_initial_gateways() {
        let c = controller();
        for g in c.gateways().iter() {
            assert_eq!(g.overload_threshold, 1_000_000.0);
        }
        assert_eq!(c.gateways().active().unwrap().role, GatewayRole::Primary);
    }

    #[test]
    fn test_exactly_one_active_for_any_load() {
        let mut d = Driver::new();
        // deterministic pseudo-random load sequence
        let mut x: u64 = 0x2545F4914F6CDD1D;
        for _ in 0..500 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            let primary = [QUIET, BAND, OVER][(x % 3) as usize];
            let backup = [QUIET, OVER][((x >> 8) % 2) as usize];
            d.feed(primary, backup);
            assert_eq!(d.active_count(), 1, "at tick {} in {}", d.tick, d.controller.state());
        }
    }

    #[test]
    fn test_full_cycle() {
        let mut d = Driver::new();
        d.feed(QUIET, QUIET);
        for _ in 0..3 {
            d.feed(OVER, QUIET);
        }
        assert_eq!(d.controller.state(), FailoverState::PrimaryOverloaded);
        let primary = &d.controller.gateways().primary;
        assert_eq!(primary.status, GatewayStatus::Degraded);
        assert_eq!(primary.current_load, OVER);

        d.feed(QUIET, QUIET);
        assert_eq!(d.controller.state(), FailoverState::Recovering);
        assert_eq!(d.controller.active_role(), GatewayRole::Backup);
        for _ in 0..5 {
            d.feed(QUIET, QUIET);
        }
        assert_eq!(d.controller.state(), FailoverState::BothHealthy);
        assert_eq!(
            d.transitions(),
            vec![
                (4, FailoverState::PrimaryOverloaded),
                (5, FailoverState::Recovering),
                (10, FailoverState::BothHealthy),
            ]
        );
    }

    #[test]
    fn test_alternating_overload_never_fails_over() {
        let mut d = Driver::new();
        for n in 0..100 {
            let primary = if n % 3 == 2 { QUIET } else { OVER };
            assert_eq!(d.feed(primary, QUIET), FailoverState::BothHealthy);
        }
        assert!(d.transitions().is_empty());
    }

    #[test]
    fn test_load_between_thresholds_keeps_backup() {
        let mut d = Driver::new();
        for _ in 0..3 {
            d.feed(OVER, QUIET);
        }
        for _ in 0..20 {
            assert_eq!(d.feed(BAND, QUIET), FailoverState::PrimaryOverloaded);
        }
    }

    #[test]
    fn test_both_overloaded_keeps_primary() {
        let mut d = Driver::new();
        for _ in 0..10 {
            assert_eq!(d.feed(OVER, OVER), FailoverState::BothHealthy);
        }
        let both = d
            .events
            .iter()
            .filter(|e| matches!(e, ControllerEvent::BothOverloaded { active: GatewayRole::Primary, .. }))
            .count();
        assert_eq!(both, 10);
        assert_eq!(d.controller.gateways().active().unwrap().role, GatewayRole::Primary);

        // the streak starts over once only the primary is overloaded
        d.feed(OVER, QUIET);
        d.feed(OVER, QUIET);
        assert_eq!(d.controller.state(), FailoverState::BothHealthy);
        d.feed(OVER, QUIET);
        assert_eq!(d.controller.state(), FailoverState::PrimaryOverloaded);
    }

    #[test]
    fn test_both_overloaded_after_failover_keeps_backup() {
        let mut d = Driver::new();
        for _ in 0..3 {
            d.feed(OVER, QUIET);
        }
        d.feed(OVER, OVER);
        assert_eq!(d.controller.state(), FailoverState::PrimaryOverloaded);
        assert!(matches!(
            d.events.last(),
            Some(ControllerEvent::BothOverloaded { active: GatewayRole::Backup, .. })
        ));
    }

    #[test]
    fn test_overload_during_recovery_cancels_switch_back() {
        let mut d = Driver::new();
        for _ in 0..3 {
            d.feed(OVER, QUIET);
        }
        d.feed(QUIET, QUIET);
        d.feed(QUIET, QUIET);
        assert_eq!(d.controller.state(), FailoverState::Recovering);

        assert_eq!(d.feed(OVER, QUIET), FailoverState::PrimaryOverloaded);
        assert_eq!(d.controller.gateways().backup.status, GatewayStatus::Active);

        // the stability window starts from zero again
        d.feed(QUIET, QUIET);
        for _ in 0..4 {
            assert_eq!(d.feed(QUIET, QUIET), FailoverState::Recovering);
        }
        assert_eq!(d.feed(QUIET, QUIET), FailoverState::BothHealthy);
    }
}
