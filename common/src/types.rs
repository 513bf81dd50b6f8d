use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    On,
    Off,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    pub fn as_digit(self) -> char {
        match self {
            Self::On => '1',
            Self::Off => '0',
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    High,
    Low,
}

impl Level {
    pub fn from_high(high: bool) -> Self {
        if high {
            Self::High
        } else {
            Self::Low
        }
    }

    pub fn is_high(self) -> bool {
        self == Self::High
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonSample {
    pub level: Level,
    pub timestamp_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressKind {
    Release,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressEvent {
    pub started_at_ms: u32,
    pub duration_ms: u32,
    pub kind: PressKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    None,
    Toggle,
    Restart,
    FactoryReset,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Toggle => "TOGGLE",
            Self::Restart => "RESTART",
            Self::FactoryReset => "FACTORY_RESET",
        }
    }
}
