use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::{config::PersistedSettings, types::Level};

pub trait ButtonInput {
    fn level(&mut self) -> Level;
}

pub trait Clock {
    fn now_ms(&self) -> u32;
}

// On hardware neither call returns. Test doubles record the call and return.
pub trait SystemControl {
    fn restart(&mut self);

    fn factory_reset(&mut self);
}

pub type Callback = Box<dyn FnMut() + Send>;

pub trait Provisioning {
    fn set_config_portal_timeout(&mut self, timeout: Duration);
    fn on_enter_config_mode(&mut self, callback: Callback);
    fn on_credentials_saved(&mut self, callback: Callback);

    fn try_auto_connect(&mut self, hostname: &str) -> bool;
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings record is not valid JSON: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("settings storage failed: {0}")]
    Storage(String),
}

pub trait SettingsStore {
    fn load(&mut self) -> Result<Option<PersistedSettings>, SettingsError>;
    fn save(&mut self, settings: &PersistedSettings) -> Result<(), SettingsError>;
    fn clear(&mut self) -> Result<(), SettingsError>;
}

pub fn load_settings(store: &mut dyn SettingsStore) -> PersistedSettings {
    match store.load() {
        Ok(Some(settings)) if settings.is_valid() => settings,
        Ok(Some(settings)) => {
            warn!(
                "invalid settings marker {}, trying with defaults",
                settings.salt
            );
            PersistedSettings::default()
        }
        Ok(None) => PersistedSettings::default(),
        Err(err) => {
            warn!("failed to load settings, trying with defaults: {err}");
            PersistedSettings::default()
        }
    }
}
