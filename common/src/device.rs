use log::{debug, info, warn};

use crate::{
    button::ButtonClassifier,
    command_port::{CommandOutcome, CommandServer},
    config::SwitchConfig,
    dispatcher::{DispatchOutcome, Dispatcher},
    net::Listener,
    ota::{OtaError, OtaEvent, OtaService},
    platform::{ButtonInput, Clock, SystemControl},
    relay::RelayController,
    routes::{register_routes, DeviceState},
    scheduler::Workload,
    types::{Command, RelayState},
};

pub struct DeviceParts<H, C> {
    pub relay: RelayController,
    pub button: Box<dyn ButtonInput + Send>,
    pub clock: Box<dyn Clock + Send>,
    pub http: H,
    pub commands: C,
    pub ota: Box<dyn OtaService + Send>,
    pub system: Box<dyn SystemControl + Send>,
}

pub struct Device<H: Listener, C: Listener> {
    state: DeviceState,
    classifier: ButtonClassifier,
    button: Box<dyn ButtonInput + Send>,
    clock: Box<dyn Clock + Send>,
    dispatcher: Dispatcher<DeviceState>,
    http: H,
    commands: CommandServer<C>,
    ota: Box<dyn OtaService + Send>,
    system: Box<dyn SystemControl + Send>,
}

impl<H: Listener, C: Listener> Device<H, C> {
    pub fn new(config: &SwitchConfig, parts: DeviceParts<H, C>) -> Self {
        let mut dispatcher = Dispatcher::new(config.limits, config.connection_wait());
        register_routes(&mut dispatcher, config.diagnostic_echo);

        let ota_supported = parts.ota.supported();
        Self {
            state: DeviceState::new(parts.relay, ota_supported),
            classifier: ButtonClassifier::new(config.press),
            button: parts.button,
            clock: parts.clock,
            dispatcher,
            http: parts.http,
            commands: CommandServer::new(
                parts.commands,
                config.command_matching,
                config.limits.max_line_bytes,
            ),
            ota: parts.ota,
            system: parts.system,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn relay_state(&self) -> RelayState {
        self.state.relay.current_state()
    }

    pub fn execute(&mut self, command: Command) {
        match command {
            Command::None => {}
            Command::Toggle => {
                self.state.relay.toggle();
                info!("button toggled relay {}", self.relay_state().as_str());
            }
            Command::Restart => {
                info!("button requested restart");
                self.system.restart();
            }
            Command::FactoryReset => {
                info!("button requested factory reset");
                self.system.factory_reset();
            }
        }
    }

    fn start_pending_ota(&mut self) {
        let Some(request) = self.state.pending_ota.take() else {
            return;
        };
        info!("starting OTA update from {}", request.url);
        let source_url = request.url.clone();
        match self.ota.begin(request) {
            Ok(()) => self.state.ota_status.mark_started(&source_url),
            Err(OtaError::AlreadyInProgress) => {
                warn!("OTA update from {source_url} dropped: a transfer is already running");
            }
            Err(err) => {
                warn!("OTA update could not start: {err}");
                self.state
                    .ota_status
                    .apply(&OtaEvent::Failed(err.to_string()));
            }
        }
    }
}

impl<H: Listener, C: Listener> Workload for Device<H, C> {
    fn poll_ota(&mut self) {
        self.start_pending_ota();

        let mut finished = false;
        for event in self.ota.poll() {
            match &event {
                OtaEvent::Started { source_url, .. } => info!("OTA started from {source_url}"),
                OtaEvent::Progress { written, .. } => debug!("OTA wrote {written} bytes"),
                OtaEvent::Finished { bytes, sha256 } => {
                    info!("OTA finished ({bytes} bytes, sha256 {sha256})");
                    finished = true;
                }
                OtaEvent::Failed(message) => warn!("OTA failed: {message}"),
            }
            self.state.ota_status.apply(&event);
        }

        if finished {
            self.system.restart();
        }
    }

    fn poll_network(&mut self) {
        match self
            .dispatcher
            .accept_and_dispatch(&mut self.http, &mut self.state)
        {
            Ok(DispatchOutcome::Idle) => {}
            Ok(DispatchOutcome::Served {
                path,
                status,
                routed,
            }) => debug!("http {path} -> {status} (routed: {routed})"),
            Ok(outcome) => debug!("http connection: {outcome:?}"),
            Err(err) => warn!("http poll failed: {err}"),
        }

        match self.commands.poll(&mut self.state.relay) {
            Ok(CommandOutcome::Idle) => {}
            Ok(outcome) => debug!("command port: {outcome:?}"),
            Err(err) => warn!("command poll failed: {err}"),
        }
    }

    fn poll_button(&mut self) {
        let level = self.button.level();
        let command = self.classifier.sample(level, self.clock.now_ms());
        self.execute(command);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        net::test_support::{MemoryConnection, MemoryListener},
        ota::{test_support::ScriptedOta, OtaRequest},
        platform::test_support::{HeldButton, ManualClock, RecordingSystem},
        relay::test_support::{relay_with_pins, RecordingPin},
        scheduler::{Scheduler, Task},
        types::Level,
    };

    struct Rig {
        device: Device<MemoryListener, MemoryListener>,
        scheduler: Scheduler,
        button: HeldButton,
        clock: ManualClock,
        http: MemoryListener,
        commands: MemoryListener,
        ota: ScriptedOta,
        system: RecordingSystem,
        switch: RecordingPin,
        indicator: RecordingPin,
    }

    impl Rig {
        fn new() -> Self {
            let config = SwitchConfig::default();
            let (relay, switch, indicator) = relay_with_pins();
            let button = HeldButton::default();
            let clock = ManualClock::default();
            let http = MemoryListener::default();
            let commands = MemoryListener::default();
            let ota = ScriptedOta::default();
            let system = RecordingSystem::default();

            let device = Device::new(
                &config,
                DeviceParts {
                    relay,
                    button: Box::new(button.clone()),
                    clock: Box::new(clock.clone()),
                    http: http.clone(),
                    commands: commands.clone(),
                    ota: Box::new(ota.clone()),
                    system: Box::new(system.clone()),
                },
            );

            Self {
                device,
                scheduler: Scheduler::new(config.tick(), config.timers),
                button,
                clock,
                http,
                commands,
                ota,
                system,
                switch,
                indicator,
            }
        }

        fn tick_with(&mut self, tasks: &[Task]) {
            for task in tasks {
                self.scheduler.flags().set(*task);
            }
            self.scheduler.tick(&mut self.device);
        }

        fn hold_button(&mut self, held_ms: u32) {
            self.button.press();
            self.tick_with(&[Task::Button]);
            self.clock.advance(held_ms);
            self.button.release();
            self.tick_with(&[Task::Button]);
        }
    }

    #[test]
    fn short_press_turns_relay_on_then_medium_press_restarts() {
        let mut rig = Rig::new();
        assert_eq!(rig.device.relay_state(), RelayState::Off);

        rig.clock.set(10_000);
        rig.hold_button(300);
        assert_eq!(rig.device.relay_state(), RelayState::On);
        assert_eq!(rig.switch.level(), Some(Level::High));
        assert_eq!(rig.indicator.level(), Some(Level::Low));
        assert!(rig.system.calls().is_empty());

        rig.clock.advance(1_000);
        rig.hold_button(2_000);
        assert_eq!(rig.system.calls(), vec![Command::Restart]);
        assert_eq!(rig.device.relay_state(), RelayState::On);
    }

    #[test]
    fn long_press_factory_resets_and_endless_hold_is_ignored() {
        let mut rig = Rig::new();

        rig.hold_button(7_000);
        assert_eq!(rig.system.calls(), vec![Command::FactoryReset]);

        rig.hold_button(90_000);
        assert_eq!(rig.system.calls(), vec![Command::FactoryReset]);
        assert_eq!(rig.device.relay_state(), RelayState::Off);
    }

    #[test]
    fn button_is_not_sampled_without_its_flag() {
        let mut rig = Rig::new();
        rig.button.press();
        rig.tick_with(&[Task::Network, Task::Ota]);
        rig.clock.advance(100);
        rig.button.release();
        rig.tick_with(&[Task::Button]);

        assert_eq!(rig.device.relay_state(), RelayState::Off);
    }

    #[test]
    fn command_port_switches_and_reports_state() {
        let mut rig = Rig::new();
        let client = MemoryConnection::with_input("DO0=1\n");
        rig.commands.connect(client.clone());

        rig.tick_with(&[Task::Network]);
        assert_eq!(client.take_output(), "OK\n");
        assert_eq!(rig.device.relay_state(), RelayState::On);

        client.push_input("DO0?\n");
        rig.tick_with(&[Task::Network]);
        assert_eq!(client.take_output(), "DO0=1\n");
    }

    #[test]
    fn http_and_command_port_share_one_relay() {
        let mut rig = Rig::new();
        let browser = MemoryConnection::with_input("GET /DO0=1 HTTP/1.1\r\n\r\n");
        rig.http.connect(browser.clone());
        let client = MemoryConnection::with_input("DO0?\n");
        rig.commands.connect(client.clone());

        rig.tick_with(&[Task::Network]);

        assert!(browser.output().starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(client.output(), "DO0=1\n");
    }

    #[test]
    fn unknown_http_path_gets_404() {
        let mut rig = Rig::new();
        let browser = MemoryConnection::with_input("GET /status HTTP/1.1\r\n\r\n");
        rig.http.connect(browser.clone());

        rig.tick_with(&[Task::Network]);

        assert!(browser.output().starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn queued_ota_starts_on_ota_tick_and_restarts_when_finished() {
        let mut rig = Rig::new();
        let body = "url=http://host/fw.bin";
        let request = format!(
            "POST /ota HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        rig.http.connect(MemoryConnection::with_input(&request));

        rig.tick_with(&[Task::Network]);
        assert!(rig.ota.begun.lock().unwrap().is_empty());
        assert!(rig.device.state().pending_ota.is_some());

        rig.ota.push_event(OtaEvent::Started {
            source_url: "http://host/fw.bin".into(),
            total_bytes: Some(4),
        });
        rig.tick_with(&[Task::Ota]);
        assert_eq!(
            *rig.ota.begun.lock().unwrap(),
            vec![OtaRequest::new("http://host/fw.bin", None)]
        );
        assert!(rig.device.state().ota_status.in_progress);

        rig.ota.push_event(OtaEvent::Finished {
            bytes: 4,
            sha256: "ab".into(),
        });
        rig.tick_with(&[Task::Ota]);
        assert_eq!(rig.system.calls(), vec![Command::Restart]);
        assert!(!rig.device.state().ota_status.in_progress);
    }

    fn post_ota(rig: &Rig, url: &str) -> MemoryConnection {
        let body = format!("url={url}");
        let request = format!(
            "POST /ota HTTP/1.1\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let browser = MemoryConnection::with_input(&request);
        rig.http.connect(browser.clone());
        browser
    }

    #[test]
    fn second_ota_is_refused_while_first_is_connecting() {
        let mut rig = Rig::new();
        let first = post_ota(&rig, "http://host/fw.bin");
        rig.tick_with(&[Task::Network]);
        assert!(first.output().starts_with("HTTP/1.1 202"));

        rig.tick_with(&[Task::Ota]);
        assert_eq!(rig.ota.begun.lock().unwrap().len(), 1);
        let status = &rig.device.state().ota_status;
        assert!(status.in_progress);
        assert_eq!(status.last_source_url.as_deref(), Some("http://host/fw.bin"));

        let second = post_ota(&rig, "http://host/other.bin");
        rig.tick_with(&[Task::Network]);
        assert!(second.output().starts_with("HTTP/1.1 409"));
        assert!(rig.device.state().pending_ota.is_none());
    }

    #[test]
    fn busy_transport_does_not_clear_running_status() {
        let mut rig = Rig::new();
        post_ota(&rig, "http://host/fw.bin");
        rig.tick_with(&[Task::Network]);
        rig.tick_with(&[Task::Ota]);

        rig.device.state.ota_status.in_progress = false;
        *rig.ota.busy.lock().unwrap() = true;
        post_ota(&rig, "http://host/other.bin");
        rig.tick_with(&[Task::Network]);
        rig.tick_with(&[Task::Ota]);

        let status = &rig.device.state().ota_status;
        assert_eq!(status.last_error, None);
        assert_eq!(status.last_source_url.as_deref(), Some("http://host/fw.bin"));
        assert_eq!(rig.ota.begun.lock().unwrap().len(), 1);
    }

    #[test]
    fn ota_transport_is_pumped_once_per_ota_tick() {
        let mut rig = Rig::new();
        rig.tick_with(&[Task::Ota, Task::Button]);
        rig.tick_with(&[Task::Network]);
        rig.tick_with(&[Task::Ota]);

        assert_eq!(*rig.ota.polls.lock().unwrap(), 2);
    }

    #[test]
    fn silent_http_client_does_not_block_command_port() {
        let mut rig = Rig::new();
        let idle = MemoryConnection::default();
        rig.http.connect(idle.clone());
        let client = MemoryConnection::with_input("DO0=1\n");
        rig.commands.connect(client.clone());

        rig.tick_with(&[Task::Network]);

        assert_eq!(idle.waits(), vec![Duration::from_millis(250)]);
        assert_eq!(client.output(), "OK\n");
    }

    #[test]
    fn toggle_keeps_indicator_complementary() {
        let (relay, switch, indicator) = relay_with_pins();
        let mut device: Device<MemoryListener, MemoryListener> = Device::new(
            &SwitchConfig::default(),
            DeviceParts {
                relay,
                button: Box::new(HeldButton::default()),
                clock: Box::new(ManualClock::default()),
                http: MemoryListener::default(),
                commands: MemoryListener::default(),
                ota: Box::new(ScriptedOta::default()),
                system: Box::new(RecordingSystem::default()),
            },
        );

        for _ in 0..3 {
            device.execute(Command::Toggle);
            assert_ne!(switch.level(), indicator.level());
        }
        assert_eq!(device.relay_state(), RelayState::On);
    }
}
