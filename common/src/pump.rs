use crate::{
    command::Command,
    config::PersistedRecord,
    topics::{
        GREETING_PAYLOAD, RELAY_OFF_PAYLOAD, RELAY_OFF_PAYLOAD_NORMALIZED, RELAY_ON_PAYLOAD,
        RESET_PAYLOAD, TOPIC_COMMANDS, TOPIC_OUT, TOPIC_RELAY_STATUS,
    },
    types::{Interval, OperatingMode},
};

/// Side effect requested by the engine. Callers execute these in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpAction {
    /// Drive the physical relay output.
    SetRelay(bool),
    Publish {
        topic: &'static str,
        payload: String,
    },
    Subscribe(&'static str),
    Persist(PersistedRecord),
    /// Replace any existing ticker schedule with a periodic one.
    ArmTicker(Interval),
    Restart,
}

#[derive(Debug, Clone)]
pub struct PumpEngine {
    mode: OperatingMode,
    interval: Interval,
    relay_on: bool,

    // Boot-lifetime only; the reset marker is published once per process.
    reset_announced: bool,
    off_payload: &'static str,
}

impl PumpEngine {
    pub fn new(record: PersistedRecord) -> Self {
        Self {
            mode: record.mode,
            interval: record.interval,
            relay_on: false,
            reset_announced: false,
            off_payload: RELAY_OFF_PAYLOAD,
        }
    }

    pub fn with_normalized_off_payload(mut self, normalize: bool) -> Self {
        self.off_payload = if normalize {
            RELAY_OFF_PAYLOAD_NORMALIZED
        } else {
            RELAY_OFF_PAYLOAD
        };
        self
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn is_relay_on(&self) -> bool {
        self.relay_on
    }

    pub fn record(&self) -> PersistedRecord {
        PersistedRecord {
            interval: self.interval,
            mode: self.mode,
        }
    }

    /// Initial relay level and ticker arm. The ticker stays armed for the
    /// process lifetime; forced modes ignore its ticks instead of cancelling it.
    pub fn boot(&mut self) -> Vec<PumpAction> {
        let mut actions = Vec::new();
        self.apply_relay(self.mode.pinned_relay().unwrap_or(false), &mut actions);
        actions.push(PumpAction::ArmTicker(self.interval));
        actions
    }

    /// Called on every broker (re)connect.
    pub fn on_connected(&mut self) -> Vec<PumpAction> {
        let mut actions = self.status_snapshot();
        actions.push(PumpAction::Subscribe(TOPIC_COMMANDS));
        actions
    }

    pub fn handle(&mut self, command: Command) -> Vec<PumpAction> {
        match command {
            Command::Ping => self.status_snapshot(),
            Command::SetOff => self.force(OperatingMode::ForcedOff),
            Command::SetOn => self.force(OperatingMode::ForcedOn),
            Command::Restart => vec![PumpAction::Restart],
            Command::SetAutoInterval(secs) => self.set_auto_interval(secs),
        }
    }

    pub fn tick(&mut self) -> Vec<PumpAction> {
        let mut actions = Vec::new();
        if self.mode == OperatingMode::Auto {
            self.apply_relay(!self.relay_on, &mut actions);
        }
        actions
    }

    /// Greeting, one-time reset marker, mode code, interval in ms.
    pub fn status_snapshot(&mut self) -> Vec<PumpAction> {
        let mut actions = vec![publish_out(GREETING_PAYLOAD)];
        if !self.reset_announced {
            actions.push(publish_out(RESET_PAYLOAD));
            self.reset_announced = true;
        }
        actions.push(publish_out(self.mode.code().to_string()));
        actions.push(publish_out(self.interval.to_string()));
        actions
    }

    fn force(&mut self, mode: OperatingMode) -> Vec<PumpAction> {
        let mut actions = Vec::new();
        self.mode = mode;
        actions.push(PumpAction::Persist(self.record()));
        self.apply_relay(mode == OperatingMode::ForcedOn, &mut actions);
        actions
    }

    fn set_auto_interval(&mut self, secs: i64) -> Vec<PumpAction> {
        let Some(interval) = Interval::from_secs(secs) else {
            return Vec::new();
        };

        let mut actions = Vec::new();
        self.interval = interval;
        self.apply_relay(true, &mut actions);
        self.mode = OperatingMode::Auto;
        actions.push(PumpAction::ArmTicker(interval));
        actions.push(PumpAction::Persist(self.record()));
        actions
    }

    // Every relay write is echoed on the status topic, redundant ones included.
    fn apply_relay(&mut self, on: bool, actions: &mut Vec<PumpAction>) {
        self.relay_on = on;
        actions.push(PumpAction::SetRelay(on));
        actions.push(PumpAction::Publish {
            topic: TOPIC_RELAY_STATUS,
            payload: if on { RELAY_ON_PAYLOAD } else { self.off_payload }.to_string(),
        });
    }
}

fn publish_out(payload: impl Into<String>) -> PumpAction {
    PumpAction::Publish {
        topic: TOPIC_OUT,
        payload: payload.into(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn relay_status(payload: &str) -> PumpAction {
        PumpAction::Publish {
            topic: TOPIC_RELAY_STATUS,
            payload: payload.to_string(),
        }
    }

    fn out(payload: &str) -> PumpAction {
        publish_out(payload)
    }

    fn engine_in(mode: OperatingMode) -> PumpEngine {
        PumpEngine::new(PersistedRecord {
            interval: Interval::DEFAULT,
            mode,
        })
    }

    #[test]
    fn boots_with_default_record() {
        let mut engine = PumpEngine::new(PersistedRecord::default());

        assert_eq!(engine.mode(), OperatingMode::Auto);
        assert_eq!(engine.interval().as_millis(), 300_000);
        assert_eq!(
            engine.boot(),
            vec![
                PumpAction::SetRelay(false),
                relay_status("offS"),
                PumpAction::ArmTicker(Interval::DEFAULT),
            ]
        );
    }

    #[test]
    fn boot_in_forced_on_energizes_relay() {
        let mut engine = engine_in(OperatingMode::ForcedOn);

        assert_eq!(
            engine.boot(),
            vec![
                PumpAction::SetRelay(true),
                relay_status("on"),
                PumpAction::ArmTicker(Interval::DEFAULT),
            ]
        );
        assert!(engine.is_relay_on());
    }

    #[test]
    fn boot_in_forced_off_keeps_relay_off() {
        let mut engine = engine_in(OperatingMode::ForcedOff);

        assert_eq!(
            engine.boot(),
            vec![
                PumpAction::SetRelay(false),
                relay_status("offS"),
                PumpAction::ArmTicker(Interval::DEFAULT),
            ]
        );
        assert!(!engine.is_relay_on());
    }

    #[test]
    fn first_ping_announces_reset_once() {
        let mut engine = PumpEngine::new(PersistedRecord::default());

        assert_eq!(
            engine.handle(Command::Ping),
            vec![out("hello world"), out("reset"), out("0"), out("300000")]
        );
        assert_eq!(
            engine.handle(Command::Ping),
            vec![out("hello world"), out("0"), out("300000")]
        );
    }

    #[test]
    fn reconnect_publishes_snapshot_then_subscribes() {
        let mut engine = engine_in(OperatingMode::ForcedOff);
        let actions = engine.on_connected();

        assert_eq!(
            actions,
            vec![
                out("hello world"),
                out("reset"),
                out("1"),
                out("300000"),
                PumpAction::Subscribe("pump/#"),
            ]
        );
        assert!(!engine.on_connected().contains(&out("reset")));
    }

    #[test]
    fn set_off_persists_then_drops_relay() {
        let mut engine = PumpEngine::new(PersistedRecord::default());
        let _ = engine.tick();
        assert!(engine.is_relay_on());

        let actions = engine.handle(Command::SetOff);

        let expected_record = PersistedRecord {
            interval: Interval::DEFAULT,
            mode: OperatingMode::ForcedOff,
        };
        assert_eq!(
            actions,
            vec![
                PumpAction::Persist(expected_record),
                PumpAction::SetRelay(false),
                relay_status("offS"),
            ]
        );
        assert_eq!(engine.mode(), OperatingMode::ForcedOff);
        assert!(!engine.is_relay_on());
    }

    #[test]
    fn set_off_twice_is_idempotent() {
        let mut engine = PumpEngine::new(PersistedRecord::default());
        let first = engine.handle(Command::SetOff);
        let second = engine.handle(Command::SetOff);

        assert_eq!(first, second);
        assert_eq!(engine.mode(), OperatingMode::ForcedOff);
        assert!(!engine.is_relay_on());
    }

    #[test]
    fn set_on_persists_then_raises_relay() {
        let mut engine = PumpEngine::new(PersistedRecord::default());
        let actions = engine.handle(Command::SetOn);

        assert_eq!(
            actions,
            vec![
                PumpAction::Persist(PersistedRecord {
                    interval: Interval::DEFAULT,
                    mode: OperatingMode::ForcedOn,
                }),
                PumpAction::SetRelay(true),
                relay_status("on"),
            ]
        );
        assert!(engine.is_relay_on());
    }

    #[test]
    fn auto_interval_rearms_and_persists() {
        let mut engine = engine_in(OperatingMode::ForcedOff);
        let actions = engine.handle(Command::SetAutoInterval(60));

        let interval = Interval::from_secs(60).unwrap();
        assert_eq!(
            actions,
            vec![
                PumpAction::SetRelay(true),
                relay_status("on"),
                PumpAction::ArmTicker(interval),
                PumpAction::Persist(PersistedRecord {
                    interval,
                    mode: OperatingMode::Auto,
                }),
            ]
        );
        assert_eq!(engine.mode(), OperatingMode::Auto);
        assert_eq!(engine.interval().as_millis(), 60_000);
        assert!(engine.is_relay_on());
    }

    #[test]
    fn non_positive_auto_interval_is_ignored() {
        for secs in [0, -1, i64::MIN] {
            let mut engine = engine_in(OperatingMode::ForcedOn);
            let _ = engine.boot();

            assert!(engine.handle(Command::SetAutoInterval(secs)).is_empty());
            assert_eq!(engine.mode(), OperatingMode::ForcedOn);
            assert_eq!(engine.interval(), Interval::DEFAULT);
            assert!(engine.is_relay_on());
        }
    }

    #[test]
    fn restart_has_no_other_effect() {
        let mut engine = engine_in(OperatingMode::ForcedOn);
        assert_eq!(engine.handle(Command::Restart), vec![PumpAction::Restart]);
        assert_eq!(engine.mode(), OperatingMode::ForcedOn);
    }

    #[test]
    fn auto_ticks_alternate_relay() {
        let mut engine = PumpEngine::new(PersistedRecord::default());
        let _ = engine.boot();

        let observed: Vec<bool> = (0..6)
            .map(|_| {
                let actions = engine.tick();
                assert_eq!(actions.len(), 2);
                engine.is_relay_on()
            })
            .collect();

        assert_eq!(observed, vec![true, false, true, false, true, false]);
    }

    #[test]
    fn forced_modes_ignore_ticks() {
        for mode in [OperatingMode::ForcedOff, OperatingMode::ForcedOn] {
            let mut engine = engine_in(mode);
            let _ = engine.boot();
            let before = engine.is_relay_on();

            for _ in 0..5 {
                assert!(engine.tick().is_empty());
            }
            assert_eq!(engine.is_relay_on(), before);
        }
    }

    #[test]
    fn normalized_off_payload() {
        let mut engine =
            PumpEngine::new(PersistedRecord::default()).with_normalized_off_payload(true);
        let actions = engine.handle(Command::SetOff);

        assert!(actions.contains(&relay_status("off")));
    }

    #[test]
    fn status_snapshot_reflects_new_interval() {
        let mut engine = PumpEngine::new(PersistedRecord::default());
        let _ = engine.handle(Command::Ping);
        let _ = engine.handle(Command::SetAutoInterval(15));

        assert_eq!(
            engine.handle(Command::Ping),
            vec![out("hello world"), out("0"), out("15000")]
        );
    }
}
