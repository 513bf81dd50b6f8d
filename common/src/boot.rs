use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{info, warn};

use crate::{
    config::PersistedSettings,
    platform::{load_settings, Callback, Provisioning, SettingsStore, SystemControl},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    Online(PersistedSettings),
    Restarting,
}

pub fn bring_up(
    store: &mut dyn SettingsStore,
    provisioning: &mut dyn Provisioning,
    system: &mut dyn SystemControl,
    hostname: &str,
    portal_timeout: Duration,
    on_config_mode: Callback,
) -> BootOutcome {
    let settings = load_settings(store);

    let should_save = Arc::new(AtomicBool::new(false));
    provisioning.set_config_portal_timeout(portal_timeout);
    provisioning.on_enter_config_mode(on_config_mode);
    provisioning.on_credentials_saved({
        let should_save = Arc::clone(&should_save);
        Box::new(move || {
            info!("should save config");
            should_save.store(true, Ordering::Release);
        })
    });

    if !provisioning.try_auto_connect(hostname) {
        warn!("failed to connect and hit timeout, restarting");
        system.restart();
        return BootOutcome::Restarting;
    }

    if should_save.load(Ordering::Acquire) {
        info!("saving settings");
        if let Err(err) = store.save(&settings) {
            warn!("failed to save settings: {err}");
        }
    }

    info!("network connected as {hostname}");
    BootOutcome::Online(settings)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        platform::test_support::{MemorySettings, RecordingSystem},
        types::Command,
    };

    #[derive(Default)]
    struct FakeProvisioning {
        connects: bool,
        open_portal: bool,
        save_credentials: bool,
        timeout: Option<Duration>,
        hostname: Option<String>,
        config_mode: Option<Callback>,
        saved: Option<Callback>,
    }

    impl Provisioning for FakeProvisioning {
        fn set_config_portal_timeout(&mut self, timeout: Duration) {
            self.timeout = Some(timeout);
        }

        fn on_enter_config_mode(&mut self, callback: Callback) {
            self.config_mode = Some(callback);
        }

        fn on_credentials_saved(&mut self, callback: Callback) {
            self.saved = Some(callback);
        }

        fn try_auto_connect(&mut self, hostname: &str) -> bool {
            self.hostname = Some(hostname.to_string());
            if self.open_portal {
                if let Some(callback) = self.config_mode.as_mut() {
                    callback();
                }
            }
            if self.save_credentials {
                if let Some(callback) = self.saved.as_mut() {
                    callback();
                }
            }
            self.connects
        }
    }

    fn counter() -> (Arc<Mutex<u32>>, Callback) {
        let count = Arc::new(Mutex::new(0));
        let hook = Arc::clone(&count);
        (count, Box::new(move || *hook.lock().unwrap() += 1))
    }

    #[test]
    fn connects_without_saving_untouched_settings() {
        let mut store = MemorySettings::default();
        let mut provisioning = FakeProvisioning {
            connects: true,
            ..FakeProvisioning::default()
        };
        let mut system = RecordingSystem::default();
        let (_, hook) = counter();

        let outcome = bring_up(
            &mut store,
            &mut provisioning,
            &mut system,
            "ESP8266",
            Duration::from_secs(180),
            hook,
        );

        assert_eq!(outcome, BootOutcome::Online(PersistedSettings::default()));
        assert_eq!(provisioning.timeout, Some(Duration::from_secs(180)));
        assert_eq!(provisioning.hostname.as_deref(), Some("ESP8266"));
        assert_eq!(*store.saves.lock().unwrap(), 0);
        assert!(system.calls().is_empty());
    }

    #[test]
    fn portal_credentials_trigger_a_settings_save() {
        let mut store = MemorySettings::default();
        let mut provisioning = FakeProvisioning {
            connects: true,
            open_portal: true,
            save_credentials: true,
            ..FakeProvisioning::default()
        };
        let mut system = RecordingSystem::default();
        let (entered, hook) = counter();

        bring_up(
            &mut store,
            &mut provisioning,
            &mut system,
            "ESP8266",
            Duration::from_secs(180),
            hook,
        );

        assert_eq!(*entered.lock().unwrap(), 1);
        assert_eq!(*store.saves.lock().unwrap(), 1);
        assert_eq!(*store.record.lock().unwrap(), Some(PersistedSettings::default()));
    }

    #[test]
    fn failed_join_requests_restart() {
        let mut store = MemorySettings::default();
        let mut provisioning = FakeProvisioning::default();
        let mut system = RecordingSystem::default();
        let (_, hook) = counter();

        let outcome = bring_up(
            &mut store,
            &mut provisioning,
            &mut system,
            "ESP8266",
            Duration::from_secs(30),
            hook,
        );

        assert_eq!(outcome, BootOutcome::Restarting);
        assert_eq!(system.calls(), vec![Command::Restart]);
    }
}
