use std::time::Duration;

use crate::types::Level;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlinkPattern {
    Connecting,
    ConfigPortal,
}

impl BlinkPattern {
    pub fn period(self) -> Duration {
        match self {
            Self::Connecting => Duration::from_millis(600),
            Self::ConfigPortal => Duration::from_millis(200),
        }
    }

    // LED level at `now_ms`. The LED is active-low and starts lit.
    pub fn level_at(self, now_ms: u64) -> Level {
        let period_ms = self.period().as_millis() as u64;
        Level::from_high((now_ms / period_ms) % 2 == 1)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Blinker {
    pattern: Option<BlinkPattern>,
    driven: Option<Level>,
}

impl Blinker {
    pub fn new(pattern: BlinkPattern) -> Self {
        Self {
            pattern: Some(pattern),
            driven: None,
        }
    }

    pub fn pattern(&self) -> Option<BlinkPattern> {
        self.pattern
    }

    pub fn set_pattern(&mut self, pattern: BlinkPattern) {
        self.pattern = Some(pattern);
    }

    pub fn stop(&mut self) {
        self.pattern = None;
        self.driven = None;
    }

    pub fn update(&mut self, now_ms: u64) -> Option<Level> {
        let level = self.pattern?.level_at(now_ms);
        if self.driven == Some(level) {
            return None;
        }
        self.driven = Some(level);
        Some(level)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn toggles_once_per_period() {
        let pattern = BlinkPattern::Connecting;
        assert_eq!(pattern.level_at(0), Level::Low);
        assert_eq!(pattern.level_at(599), Level::Low);
        assert_eq!(pattern.level_at(600), Level::High);
        assert_eq!(pattern.level_at(1_200), Level::Low);
        assert_eq!(BlinkPattern::ConfigPortal.level_at(200), Level::High);
    }

    #[test]
    fn blinker_writes_only_on_change_and_stops() {
        let mut blinker = Blinker::new(BlinkPattern::ConfigPortal);
        assert_eq!(blinker.update(0), Some(Level::Low));
        assert_eq!(blinker.update(100), None);
        assert_eq!(blinker.update(250), Some(Level::High));

        blinker.set_pattern(BlinkPattern::Connecting);
        assert_eq!(blinker.update(300), Some(Level::Low));

        blinker.stop();
        assert_eq!(blinker.update(900), None);
        assert_eq!(blinker.pattern(), None);
    }
}
