use crate::{
    config::PressThresholds,
    types::{ButtonSample, Command, Level, PressEvent, PressKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonPhase {
    Released,
    Pressed,
}

// Active-low: the line idles HIGH and reads LOW while held.
#[derive(Debug, Clone)]
pub struct DebounceTimer {
    last_level: Level,
    press_started_at_ms: u32,
}

impl Default for DebounceTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl DebounceTimer {
    pub fn new() -> Self {
        Self {
            last_level: Level::High,
            press_started_at_ms: 0,
        }
    }

    pub fn phase(&self) -> ButtonPhase {
        match self.last_level {
            Level::High => ButtonPhase::Released,
            Level::Low => ButtonPhase::Pressed,
        }
    }

    pub fn sample(&mut self, sample: ButtonSample) -> Option<PressEvent> {
        if sample.level == self.last_level {
            return None;
        }

        let event = match (self.last_level, sample.level) {
            (Level::High, Level::Low) => {
                self.press_started_at_ms = sample.timestamp_ms;
                None
            }
            (Level::Low, Level::High) => Some(PressEvent {
                started_at_ms: self.press_started_at_ms,
                duration_ms: sample.timestamp_ms.wrapping_sub(self.press_started_at_ms),
                kind: PressKind::Release,
            }),
            _ => None,
        };

        self.last_level = sample.level;
        event
    }
}

pub fn classify(duration_ms: u32, thresholds: &PressThresholds) -> Command {
    if duration_ms < thresholds.restart_ms {
        Command::Toggle
    } else if duration_ms < thresholds.factory_reset_ms {
        Command::Restart
    } else if duration_ms < thresholds.ignore_ms {
        Command::FactoryReset
    } else {
        Command::None
    }
}

#[derive(Debug, Clone)]
pub struct ButtonClassifier {
    thresholds: PressThresholds,
    timer: DebounceTimer,
    last_press: Option<PressEvent>,
}

impl Default for ButtonClassifier {
    fn default() -> Self {
        Self::new(PressThresholds::default())
    }
}

impl ButtonClassifier {
    pub fn new(mut thresholds: PressThresholds) -> Self {
        thresholds.sanitize();
        Self {
            thresholds,
            timer: DebounceTimer::new(),
            last_press: None,
        }
    }

    pub fn phase(&self) -> ButtonPhase {
        self.timer.phase()
    }

    pub fn last_press(&self) -> Option<PressEvent> {
        self.last_press
    }

    pub fn sample(&mut self, level: Level, now_ms: u32) -> Command {
        let Some(press) = self.timer.sample(ButtonSample {
            level,
            timestamp_ms: now_ms,
        }) else {
            return Command::None;
        };

        self.last_press = Some(press);
        if press.duration_ms < self.thresholds.min_stable_ms {
            return Command::None;
        }

        classify(press.duration_ms, &self.thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(classifier: &mut ButtonClassifier, start_ms: u32, held_ms: u32) -> Command {
        assert_eq!(classifier.sample(Level::Low, start_ms), Command::None);
        classifier.sample(Level::High, start_ms.wrapping_add(held_ms))
    }

    #[test]
    fn thresholds_partition_durations() {
        let thresholds = PressThresholds::default();
        let cases = [
            (0, Command::Toggle),
            (999, Command::Toggle),
            (1_000, Command::Restart),
            (4_999, Command::Restart),
            (5_000, Command::FactoryReset),
            (59_999, Command::FactoryReset),
            (60_000, Command::None),
            (u32::MAX, Command::None),
        ];

        for (duration, expected) in cases {
            assert_eq!(classify(duration, &thresholds), expected, "duration {duration}");
        }
    }

    #[test]
    fn steady_level_emits_nothing() {
        let mut classifier = ButtonClassifier::default();
        for now in (0..1_000).step_by(100) {
            assert_eq!(classifier.sample(Level::High, now), Command::None);
        }
        assert_eq!(classifier.phase(), ButtonPhase::Released);
    }

    #[test]
    fn press_edge_arms_and_release_classifies() {
        let mut classifier = ButtonClassifier::default();

        assert_eq!(classifier.sample(Level::Low, 1_000), Command::None);
        assert_eq!(classifier.phase(), ButtonPhase::Pressed);
        assert_eq!(classifier.sample(Level::Low, 1_100), Command::None);
        assert_eq!(classifier.sample(Level::High, 1_300), Command::Toggle);
        assert_eq!(classifier.phase(), ButtonPhase::Released);
        assert_eq!(
            classifier.last_press(),
            Some(PressEvent {
                started_at_ms: 1_000,
                duration_ms: 300,
                kind: PressKind::Release,
            })
        );
    }

    #[test]
    fn press_durations_map_to_commands() {
        let mut classifier = ButtonClassifier::default();
        assert_eq!(press(&mut classifier, 0, 300), Command::Toggle);
        assert_eq!(press(&mut classifier, 10_000, 2_000), Command::Restart);
        assert_eq!(press(&mut classifier, 20_000, 7_500), Command::FactoryReset);
        assert_eq!(press(&mut classifier, 40_000, 90_000), Command::None);
    }

    #[test]
    fn duration_survives_clock_wrap() {
        let mut classifier = ButtonClassifier::default();
        assert_eq!(press(&mut classifier, u32::MAX - 100, 400), Command::Toggle);
    }

    #[test]
    fn release_without_press_is_ignored() {
        let mut timer = DebounceTimer::new();
        let event = timer.sample(ButtonSample {
            level: Level::High,
            timestamp_ms: 50,
        });
        assert_eq!(event, None);
    }

    #[test]
    fn bounce_below_min_stable_is_dropped() {
        let mut classifier = ButtonClassifier::new(PressThresholds {
            min_stable_ms: 80,
            ..PressThresholds::default()
        });
        assert_eq!(press(&mut classifier, 0, 20), Command::None);
        assert_eq!(press(&mut classifier, 1_000, 120), Command::Toggle);
    }
}
