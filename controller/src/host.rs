use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use relay_switch_common::{
    bring_up, flag_raiser, BlinkPattern, Blinker, BootOutcome, ButtonInput, Callback, Clock,
    Device, DeviceParts, Level, OtaError, OtaEvent, OtaRequest, OtaService, OutputPin,
    PersistedSettings, Provisioning, RelayController, Scheduler, SettingsError, SettingsStore,
    SwitchConfig, SystemControl, Task, TcpPort,
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = HostStore::new();
    let mut config = store.load_config().unwrap_or_else(|err| {
        warn!("failed to load switch config from store: {err:#}");
        SwitchConfig::default()
    });
    apply_env_overrides(&mut config);
    config.sanitize();

    let blinker = Arc::new(Mutex::new(Blinker::new(BlinkPattern::Connecting)));
    spawn_blink_loop(blinker.clone(), LogPin::new("status-led"));

    let mut settings = store.settings_store();
    let mut provisioning = HostProvisioning::new(settings.exists());
    let mut system = HostSystem {
        settings: store.settings_store(),
    };
    let on_config_mode: Callback = {
        let blinker = blinker.clone();
        Box::new(move || {
            info!("entered config mode");
            if let Ok(mut blinker) = blinker.lock() {
                blinker.set_pattern(BlinkPattern::ConfigPortal);
            }
        })
    };

    let outcome = bring_up(
        &mut settings,
        &mut provisioning,
        &mut system,
        &config.hostname,
        config.config_portal_timeout(),
        on_config_mode,
    );
    if let Ok(mut blinker) = blinker.lock() {
        blinker.stop();
    }
    if outcome == BootOutcome::Restarting {
        return Ok(());
    }

    let http = TcpPort::bind(("0.0.0.0", config.http_port), config.io_timeout())
        .with_context(|| format!("failed to bind http port {}", config.http_port))?;
    let commands = TcpPort::bind(("0.0.0.0", config.command_port), config.io_timeout())
        .with_context(|| format!("failed to bind command port {}", config.command_port))?;
    info!("use this URL to connect: http://{}/", http.local_addr()?);
    info!("command port listening on {}", commands.local_addr()?);

    let button = SimulatedButton::default();
    spawn_button_console(button.clone());

    let relay = RelayController::new(
        Box::new(LogPin::new("relay")),
        Box::new(LogPin::new("status-led")),
    );
    let device = Device::new(
        &config,
        DeviceParts {
            relay,
            button: Box::new(button),
            clock: Box::new(MonotonicClock),
            http,
            commands,
            ota: Box::new(HostOta),
            system: Box::new(system),
        },
    );

    let scheduler = Scheduler::new(config.tick(), config.timers);
    for task in Task::ALL {
        spawn_timer(task, scheduler.period(task), flag_raiser(scheduler.flags(), task));
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let control = spawn_control_loop(scheduler, device, shutdown.clone());
    info!("done setup");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    shutdown.store(true, Ordering::Relaxed);
    control.await.context("control loop panicked")?;
    Ok(())
}

fn spawn_timer(task: Task, period: Duration, raise: impl Fn() + Send + 'static) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!("{} timer every {period:?}", task.as_str());

        loop {
            interval.tick().await;
            raise();
        }
    });
}

fn spawn_control_loop(
    scheduler: Scheduler,
    mut device: Device<TcpPort, TcpPort>,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(scheduler.tick_period());
            scheduler.tick(&mut device);
        }
    })
}

fn spawn_blink_loop(blinker: Arc<Mutex<Blinker>>, mut led: LogPin) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(50));
        loop {
            interval.tick().await;
            let Ok(mut blinker) = blinker.lock() else {
                return;
            };
            if blinker.pattern().is_none() {
                return;
            }
            if let Some(level) = blinker.update(monotonic_ms()) {
                led.set_level(level);
            }
        }
    });
}

// Reads `press`, `release` and `hold <ms>` lines from stdin.
fn spawn_button_console(button: SimulatedButton) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        info!("button console ready: press | release | hold <ms>");

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(err) => {
                    warn!("button console closed: {err}");
                    return;
                }
            };

            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("press"), None) => button.set(Level::Low),
                (Some("release"), None) => button.set(Level::High),
                (Some("hold"), Some(ms)) => match ms.parse::<u64>() {
                    Ok(ms) => {
                        button.set(Level::Low);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        button.set(Level::High);
                    }
                    Err(_) => warn!("hold needs a duration in milliseconds"),
                },
                (None, _) => {}
                _ => warn!("unknown button command `{}`", line.trim()),
            }
        }
    });
}

fn apply_env_overrides(config: &mut SwitchConfig) {
    if let Some(port) = env_parse::<u16>("SWITCH_HTTP_PORT") {
        config.http_port = port;
    }
    if let Some(port) = env_parse::<u16>("SWITCH_COMMAND_PORT") {
        config.command_port = port;
    }
    if let Some(enabled) = env_parse::<bool>("SWITCH_DIAGNOSTIC") {
        config.diagnostic_echo = enabled;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

struct HostStore {
    data_dir: PathBuf,
}

impl HostStore {
    fn new() -> Self {
        let data_dir = std::env::var("SWITCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.switch"));
        Self { data_dir }
    }

    fn load_config(&self) -> anyhow::Result<SwitchConfig> {
        let path = self.data_dir.join("config.json");
        match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<SwitchConfig>(&raw)
                .with_context(|| format!("invalid config in {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(SwitchConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn settings_store(&self) -> JsonSettings {
        JsonSettings {
            path: self.data_dir.join("settings.json"),
        }
    }
}

struct JsonSettings {
    path: PathBuf,
}

impl JsonSettings {
    fn exists(&self) -> bool {
        self.path.exists()
    }
}

impl SettingsStore for JsonSettings {
    fn load(&mut self) -> Result<Option<PersistedSettings>, SettingsError> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&mut self, settings: &PersistedSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(settings)?;
        std::fs::write(&self.path, payload)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), SettingsError> {
        match std::fs::remove_file(&self.path) {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

// The host is always online. A first boot walks through the portal callbacks
// as if credentials had just been entered.
struct HostProvisioning {
    configured: bool,
    portal_timeout: Duration,
    config_mode: Option<Callback>,
    saved: Option<Callback>,
}

impl HostProvisioning {
    fn new(configured: bool) -> Self {
        Self {
            configured,
            portal_timeout: Duration::ZERO,
            config_mode: None,
            saved: None,
        }
    }
}

impl Provisioning for HostProvisioning {
    fn set_config_portal_timeout(&mut self, timeout: Duration) {
        self.portal_timeout = timeout;
    }

    fn on_enter_config_mode(&mut self, callback: Callback) {
        self.config_mode = Some(callback);
    }

    fn on_credentials_saved(&mut self, callback: Callback) {
        self.saved = Some(callback);
    }

    fn try_auto_connect(&mut self, hostname: &str) -> bool {
        if !self.configured {
            info!(
                "no saved network for `{hostname}`, simulating portal (timeout {:?})",
                self.portal_timeout
            );
            if let Some(callback) = self.config_mode.as_mut() {
                callback();
            }
            if let Some(callback) = self.saved.as_mut() {
                callback();
            }
        }
        true
    }
}

struct HostSystem {
    settings: JsonSettings,
}

impl SystemControl for HostSystem {
    fn restart(&mut self) {
        warn!("restart requested; exiting simulator");
        std::process::exit(0);
    }

    fn factory_reset(&mut self) {
        warn!("factory reset requested; clearing settings");
        if let Err(err) = self.settings.clear() {
            warn!("failed to clear settings: {err}");
        }
        std::process::exit(0);
    }
}

struct HostOta;

impl OtaService for HostOta {
    fn supported(&self) -> bool {
        false
    }

    fn begin(&mut self, _request: OtaRequest) -> Result<(), OtaError> {
        Err(OtaError::Unsupported(
            "OTA apply is only available in ESP32 builds".to_string(),
        ))
    }

    fn poll(&mut self) -> Vec<OtaEvent> {
        Vec::new()
    }
}

struct LogPin {
    name: &'static str,
}

impl LogPin {
    fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl OutputPin for LogPin {
    fn set_level(&mut self, level: Level) {
        debug!("{} -> {level:?}", self.name);
    }
}

#[derive(Clone, Default)]
struct SimulatedButton {
    pressed: Arc<AtomicBool>,
}

impl SimulatedButton {
    fn set(&self, level: Level) {
        self.pressed.store(!level.is_high(), Ordering::Relaxed);
    }
}

impl ButtonInput for SimulatedButton {
    fn level(&mut self) -> Level {
        Level::from_high(!self.pressed.load(Ordering::Relaxed))
    }
}

struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        monotonic_ms() as u32
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
