use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const SETTINGS_SALT: u32 = 12663;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PressThresholds {
    pub restart_ms: u32,
    pub factory_reset_ms: u32,
    pub ignore_ms: u32,
    #[serde(default)]
    pub min_stable_ms: u32,
}

impl Default for PressThresholds {
    fn default() -> Self {
        Self {
            restart_ms: 1_000,
            factory_reset_ms: 5_000,
            ignore_ms: 60_000,
            min_stable_ms: 0,
        }
    }
}

impl PressThresholds {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !(self.restart_ms < self.factory_reset_ms && self.factory_reset_ms < self.ignore_ms) {
            self.restart_ms = defaults.restart_ms;
            self.factory_reset_ms = defaults.factory_reset_ms;
            self.ignore_ms = defaults.ignore_ms;
        }
        self.min_stable_ms = self.min_stable_ms.min(self.restart_ms);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerPeriods {
    pub ota_ms: u64,
    pub network_ms: u64,
    pub button_ms: u64,
}

impl Default for TimerPeriods {
    fn default() -> Self {
        Self {
            ota_ms: 100,
            network_ms: 50,
            button_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinConfig {
    pub button: i32,
    pub relay: i32,
    pub status_led: i32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            button: 0,
            relay: 12,
            status_led: 13,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLimits {
    pub max_line_bytes: usize,
    pub max_headers: usize,
    pub max_body_bytes: usize,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_line_bytes: 512,
            max_headers: 32,
            max_body_bytes: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandMatching {
    #[default]
    Contains,
    Exact,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub hostname: String,
    pub http_port: u16,
    pub command_port: u16,
    pub tick_ms: u64,
    pub timers: TimerPeriods,
    pub connection_wait_ms: u64,
    pub io_timeout_ms: u64,
    pub config_portal_timeout_s: u32,
    #[serde(default)]
    pub command_matching: CommandMatching,
    #[serde(default)]
    pub diagnostic_echo: bool,
    #[serde(default)]
    pub press: PressThresholds,
    #[serde(default)]
    pub pins: PinConfig,
    #[serde(default)]
    pub limits: RequestLimits,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            hostname: "ESP8266".to_string(),
            http_port: 80,
            command_port: 2211,
            tick_ms: 40,
            timers: TimerPeriods::default(),
            connection_wait_ms: 250,
            io_timeout_ms: 200,
            config_portal_timeout_s: 180,
            command_matching: CommandMatching::Contains,
            diagnostic_echo: false,
            press: PressThresholds::default(),
            pins: PinConfig::default(),
            limits: RequestLimits::default(),
        }
    }
}

impl SwitchConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.hostname.trim().is_empty() {
            self.hostname = defaults.hostname;
        }
        if self.http_port == 0 {
            self.http_port = defaults.http_port;
        }
        if self.command_port == 0 {
            self.command_port = defaults.command_port;
        }
        if self.command_port == self.http_port {
            if self.http_port == defaults.command_port {
                self.http_port = defaults.http_port;
            } else {
                self.command_port = defaults.command_port;
            }
        }

        self.tick_ms = self.tick_ms.clamp(1, 1_000);
        self.timers.ota_ms = self.timers.ota_ms.clamp(1, 10_000);
        self.timers.network_ms = self.timers.network_ms.clamp(1, 10_000);
        self.timers.button_ms = self.timers.button_ms.clamp(1, 1_000);
        self.connection_wait_ms = self.connection_wait_ms.min(5_000);
        self.io_timeout_ms = self.io_timeout_ms.clamp(1, 5_000);
        self.config_portal_timeout_s = self.config_portal_timeout_s.clamp(30, 3_600);

        self.limits.max_line_bytes = self.limits.max_line_bytes.clamp(64, 8_192);
        self.limits.max_headers = self.limits.max_headers.min(128);
        self.limits.max_body_bytes = self.limits.max_body_bytes.min(65_536);

        self.press.sanitize();
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn connection_wait(&self) -> Duration {
        Duration::from_millis(self.connection_wait_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn config_portal_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.config_portal_timeout_s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub salt: u32,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            salt: SETTINGS_SALT,
        }
    }
}

impl PersistedSettings {
    pub fn is_valid(&self) -> bool {
        self.salt == SETTINGS_SALT
    }
}
