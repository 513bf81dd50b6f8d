use crate::types::{Level, RelayState};

pub trait OutputPin {
    fn set_level(&mut self, level: Level);
}

// The switch output is HIGH while the relay is on; the status indicator is
// active-low and always driven to the complement of the switch.
pub struct RelayController {
    switch: Box<dyn OutputPin + Send>,
    indicator: Box<dyn OutputPin + Send>,
    state: RelayState,
}

impl RelayController {
    pub fn new(switch: Box<dyn OutputPin + Send>, indicator: Box<dyn OutputPin + Send>) -> Self {
        let mut controller = Self {
            switch,
            indicator,
            state: RelayState::Off,
        };
        controller.apply(RelayState::Off);
        controller
    }

    pub fn current_state(&self) -> RelayState {
        self.state
    }

    pub fn turn_on(&mut self) {
        self.apply(RelayState::On);
    }

    pub fn turn_off(&mut self) {
        self.apply(RelayState::Off);
    }

    pub fn toggle(&mut self) {
        match self.state {
            RelayState::On => self.turn_off(),
            RelayState::Off => self.turn_on(),
        }
    }

    pub fn set(&mut self, state: RelayState) {
        self.apply(state);
    }

    fn apply(&mut self, state: RelayState) {
        let switch_level = Level::from_high(state.is_on());
        self.switch.set_level(switch_level);
        self.indicator.set_level(Level::from_high(!switch_level.is_high()));
        self.state = state;
    }
}

impl std::fmt::Debug for RelayController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayController")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::{test_support::relay_with_pins, *};

    fn assert_complementary(
        switch: &test_support::RecordingPin,
        indicator: &test_support::RecordingPin,
    ) {
        let switch_level = switch.level().unwrap();
        let indicator_level = indicator.level().unwrap();
        assert_ne!(switch_level, indicator_level);
    }

    #[test]
    fn boots_off_with_indicator_dark() {
        let (relay, switch, indicator) = relay_with_pins();
        assert_eq!(relay.current_state(), RelayState::Off);
        assert_eq!(switch.level(), Some(Level::Low));
        assert_eq!(indicator.level(), Some(Level::High));
    }

    #[test]
    fn indicator_tracks_complement_through_every_call() {
        let (mut relay, switch, indicator) = relay_with_pins();

        relay.turn_on();
        assert_complementary(&switch, &indicator);
        relay.turn_off();
        assert_complementary(&switch, &indicator);
        for _ in 0..5 {
            relay.toggle();
            assert_complementary(&switch, &indicator);
        }
        assert_eq!(switch.writes().len(), indicator.writes().len());
    }

    #[test]
    fn turn_on_is_idempotent() {
        let (mut relay, switch, indicator) = relay_with_pins();
        relay.turn_on();
        let after_once = (relay.current_state(), switch.level(), indicator.level());
        relay.turn_on();
        let after_twice = (relay.current_state(), switch.level(), indicator.level());
        assert_eq!(after_once, after_twice);
        assert_eq!(after_twice.0, RelayState::On);
    }

    #[test]
    fn double_toggle_returns_to_start() {
        let (mut relay, _, _) = relay_with_pins();
        for start in [RelayState::Off, RelayState::On] {
            relay.set(start);
            relay.toggle();
            assert_ne!(relay.current_state(), start);
            relay.toggle();
            assert_eq!(relay.current_state(), start);
        }
    }
}
