use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyInputPin, AnyOutputPin, Input, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    sys::EspError,
    timer::{EspTaskTimerService, EspTimer},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use relay_switch_common::{
    bring_up, flag_raiser, form::form_value, BlinkPattern, Blinker, BootOutcome, ButtonInput,
    Callback, Clock, Device, DeviceParts, Level, OtaError, OtaEvent, OtaRequest, OtaService,
    OutputPin, PersistedSettings, Provisioning, RelayController, Scheduler, SettingsError,
    SettingsStore, SwitchConfig, SystemControl, Task, TcpPort,
};

const NVS_NAMESPACE: &str = "switch";
const NVS_SETTINGS_KEY: &str = "settings_json";
const NVS_WIFI_KEY: &str = "wifi_json";
const MAX_HTTP_BODY: usize = 1024;
const OTA_CHUNK_SIZE: usize = 4096;
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);
const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY_MS: u64 = 2_000;
const PORTAL_POLL_MS: u64 = 250;
const BLINK_POLL_MS: u64 = 50;

const PORTAL_INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Switch Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem;color:#111}
    label{display:block;margin:.5rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>Switch Setup</h1>
  <form method="post" action="/save">
    <label>WiFi SSID</label><input name="ssid" type="text">
    <label>WiFi Password</label><input name="pass" type="password">
    <button type="submit">Save</button>
  </form>
</body>
</html>
"#;
const PORTAL_SAVED_HTML: &str =
    "<!doctype html><html><body><p>Credentials saved. Connecting...</p></body></html>";

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut config = SwitchConfig::default();
    config.sanitize();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let Peripherals { modem, .. } = Peripherals::take()?;

    let led = SharedPin::output(config.pins.status_led)?;
    let blinker = Arc::new(Mutex::new(Blinker::new(BlinkPattern::Connecting)));
    spawn_blink_loop(blinker.clone(), led.clone());

    let mut settings = nvs_store.clone();
    let mut provisioning = EspProvisioning::new(modem, sys_loop, nvs_partition, nvs_store.clone());
    let mut system = EspSystem { nvs_store };
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
    if outcome == BootOutcome::Restarting {
        // restart() does not return on hardware
        return Ok(());
    }
    if let Ok(mut blinker) = blinker.lock() {
        blinker.stop();
    }
    if let Err(err) = keep_radio_awake() {
        warn!("radio power save left on: {err}");
    }

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let http = TcpPort::bind(("0.0.0.0", config.http_port), config.io_timeout())
        .with_context(|| format!("failed to bind http port {}", config.http_port))?;
    let commands = TcpPort::bind(("0.0.0.0", config.command_port), config.io_timeout())
        .with_context(|| format!("failed to bind command port {}", config.command_port))?;
    info!("server started on ports {} and {}", config.http_port, config.command_port);

    let relay = RelayController::new(
        Box::new(SharedPin::output(config.pins.relay)?),
        Box::new(led),
    );
    let device = Device::new(
        &config,
        DeviceParts {
            relay,
            button: Box::new(EspButton::new(config.pins.button)?),
            clock: Box::new(MonotonicClock),
            http,
            commands,
            ota: Box::new(EspOtaService::default()),
            system: Box::new(system),
        },
    );

    let scheduler = Scheduler::new(config.tick(), config.timers);
    let timer_service = EspTaskTimerService::new()?;
    let mut timers: Vec<EspTimer<'static>> = Vec::with_capacity(Task::ALL.len());
    for task in Task::ALL {
        let timer = timer_service.timer(flag_raiser(scheduler.flags(), task))?;
        timer.every(scheduler.period(task))?;
        timers.push(timer);
    }
    info!("done setup");

    // Keep services alive for the program lifetime.
    let _provisioning = provisioning;
    let _timers = timers;

    run_control_loop(scheduler, device)
}

fn run_control_loop(scheduler: Scheduler, mut device: Device<TcpPort, TcpPort>) -> anyhow::Result<()> {
    let watchdog = TaskWatchdog::arm(WATCHDOG_TIMEOUT)?;

    loop {
        watchdog.feed();
        thread::sleep(scheduler.tick_period());
        scheduler.tick(&mut device);
    }
}

fn spawn_blink_loop(blinker: Arc<Mutex<Blinker>>, mut led: SharedPin) {
    let spawn_result = thread::Builder::new()
        .name("status-blink".into())
        .stack_size(4 * 1024)
        .spawn(move || loop {
            {
                let Ok(mut blinker) = blinker.lock() else {
                    return;
                };
                if blinker.pattern().is_none() {
                    return;
                }
                if let Some(level) = blinker.update(uptime_ms()) {
                    led.set_level(level);
                }
            }
            thread::sleep(Duration::from_millis(BLINK_POLL_MS));
        });

    if let Err(err) = spawn_result {
        warn!("failed to spawn status blink thread: {err}");
    }
}

// Shared between the boot-time blinker and the relay indicator.
#[derive(Clone)]
struct SharedPin {
    gpio: i32,
    driver: Arc<Mutex<PinDriver<'static, AnyOutputPin, Output>>>,
}

impl SharedPin {
    fn output(gpio: i32) -> anyhow::Result<Self> {
        let driver = unsafe { PinDriver::output(AnyOutputPin::new(gpio)) }
            .with_context(|| format!("GPIO{gpio} unavailable as output"))?;
        Ok(Self {
            gpio,
            driver: Arc::new(Mutex::new(driver)),
        })
    }
}

impl OutputPin for SharedPin {
    fn set_level(&mut self, level: Level) {
        let Ok(mut driver) = self.driver.lock() else {
            warn!("GPIO{} lock poisoned", self.gpio);
            return;
        };
        let result = if level.is_high() {
            driver.set_high()
        } else {
            driver.set_low()
        };
        if let Err(err) = result {
            warn!("failed to drive GPIO{}: {err}", self.gpio);
        }
    }
}

struct EspButton {
    pin: PinDriver<'static, AnyInputPin, Input>,
}

impl EspButton {
    fn new(gpio: i32) -> anyhow::Result<Self> {
        let mut pin = unsafe { PinDriver::input(AnyInputPin::new(gpio)) }
            .with_context(|| format!("GPIO{gpio} unavailable as input"))?;
        pin.set_pull(Pull::Up)?;
        Ok(Self { pin })
    }
}

impl ButtonInput for EspButton {
    fn level(&mut self) -> Level {
        Level::from_high(self.pin.is_high())
    }
}

struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u32 {
        uptime_ms() as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WifiCredentials {
    ssid: String,
    #[serde(default)]
    pass: String,
}

impl WifiCredentials {
    fn from_build_env() -> Option<Self> {
        let ssid = option_env!("WIFI_SSID")?.trim();
        if ssid.is_empty() {
            return None;
        }
        Some(Self {
            ssid: ssid.to_string(),
            pass: option_env!("WIFI_PASS").unwrap_or_default().to_string(),
        })
    }
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl NvsStore {
    fn open(&self) -> anyhow::Result<EspNvs<esp_idf_svc::nvs::NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }

    fn load_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> anyhow::Result<Option<T>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; 512];

        match nvs.get_str(key, &mut buffer)? {
            Some(value) => Ok(Some(serde_json::from_str::<T>(value)?)),
            None => Ok(None),
        }
    }

    fn save_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = self.open()?;
        let payload = serde_json::to_string(value)?;
        nvs.set_str(key, &payload)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = self.open()?;
        nvs.remove(key)?;
        Ok(())
    }

    fn load_wifi_credentials(&self) -> Option<WifiCredentials> {
        match self.load_json::<WifiCredentials>(NVS_WIFI_KEY) {
            Ok(Some(credentials)) if !credentials.ssid.trim().is_empty() => Some(credentials),
            Ok(_) => WifiCredentials::from_build_env(),
            Err(err) => {
                warn!("failed to load wifi credentials from NVS: {err:#}");
                WifiCredentials::from_build_env()
            }
        }
    }
}

impl SettingsStore for NvsStore {
    fn load(&mut self) -> Result<Option<PersistedSettings>, SettingsError> {
        self.load_json(NVS_SETTINGS_KEY)
            .map_err(|err| SettingsError::Storage(format!("{err:#}")))
    }

    fn save(&mut self, settings: &PersistedSettings) -> Result<(), SettingsError> {
        self.save_json(NVS_SETTINGS_KEY, settings)
            .map_err(|err| SettingsError::Storage(format!("{err:#}")))
    }

    fn clear(&mut self) -> Result<(), SettingsError> {
        self.remove(NVS_SETTINGS_KEY)
            .map_err(|err| SettingsError::Storage(format!("{err:#}")))
    }
}

struct EspProvisioning {
    modem: Option<Modem>,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    nvs_store: NvsStore,
    portal_timeout: Duration,
    config_mode: Option<Callback>,
    saved: Option<Callback>,
    wifi: Option<EspWifi<'static>>,
}

impl EspProvisioning {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        nvs_store: NvsStore,
    ) -> Self {
        Self {
            modem: Some(modem),
            sys_loop,
            nvs_partition,
            nvs_store,
            portal_timeout: Duration::from_secs(180),
            config_mode: None,
            saved: None,
            wifi: None,
        }
    }

    fn connect(&mut self, hostname: &str) -> anyhow::Result<bool> {
        let modem = self
            .modem
            .take()
            .ok_or_else(|| anyhow!("wifi modem already in use"))?;
        let mut esp_wifi = EspWifi::new(
            modem,
            self.sys_loop.clone(),
            Some(self.nvs_partition.clone()),
        )?;

        let connected = {
            let mut wifi = BlockingWifi::wrap(&mut esp_wifi, self.sys_loop.clone())?;
            match self.nvs_store.load_wifi_credentials() {
                Some(credentials) if join_station(&mut wifi, &credentials)? => true,
                Some(_) => self.run_portal(&mut wifi, hostname)?,
                None => {
                    warn!("wifi credentials missing; entering config portal");
                    self.run_portal(&mut wifi, hostname)?
                }
            }
        };

        self.wifi = Some(esp_wifi);
        Ok(connected)
    }

    fn run_portal(
        &mut self,
        wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
        hostname: &str,
    ) -> anyhow::Result<bool> {
        let _ = wifi.disconnect();
        let _ = wifi.stop();
        start_portal_ap(wifi, hostname)?;
        if let Some(callback) = self.config_mode.as_mut() {
            callback();
        }

        let submitted: Arc<Mutex<Option<WifiCredentials>>> = Arc::new(Mutex::new(None));
        let server = create_portal_http_server(submitted.clone())?;

        let deadline = Instant::now() + self.portal_timeout;
        let credentials = loop {
            if let Some(credentials) = submitted.lock().ok().and_then(|mut slot| slot.take()) {
                break Some(credentials);
            }
            if Instant::now() >= deadline {
                break None;
            }
            thread::sleep(Duration::from_millis(PORTAL_POLL_MS));
        };
        drop(server);

        let Some(credentials) = credentials else {
            warn!("config portal timed out after {:?}", self.portal_timeout);
            return Ok(false);
        };

        if let Err(err) = self.nvs_store.save_json(NVS_WIFI_KEY, &credentials) {
            warn!("failed to persist wifi credentials: {err:#}");
        }
        if let Some(callback) = self.saved.as_mut() {
            callback();
        }

        let _ = wifi.stop();
        join_station(wifi, &credentials)
    }
}

impl Provisioning for EspProvisioning {
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
        match self.connect(hostname) {
            Ok(connected) => connected,
            Err(err) => {
                warn!("wifi startup failed: {err:#}");
                false
            }
        }
    }
}

fn join_station(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    credentials: &WifiCredentials,
) -> anyhow::Result<bool> {
    let auth_method = if credentials.pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: credentials
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: credentials
            .pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", credentials.ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(true);
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed");
    let _ = wifi.disconnect();
    Ok(false)
}

fn start_portal_ap(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    hostname: &str,
) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: hostname
            .try_into()
            .map_err(|_| anyhow!("portal AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("config portal AP started on `{hostname}`");
    Ok(())
}

fn create_portal_http_server(
    submitted: Arc<Mutex<Option<WifiCredentials>>>,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?
                .write_all(PORTAL_INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/save", Method::Post, move |mut req| {
        let len = req.content_len().unwrap_or(0) as usize;
        if len > MAX_HTTP_BODY {
            req.into_status_response(413)?
                .write_all(b"request body too large")?;
            return Ok(());
        }
        let mut body = vec![0_u8; len];
        if len > 0 {
            req.read_exact(&mut body)?;
        }

        let body = String::from_utf8_lossy(&body);
        let ssid = form_value(&body, "ssid").unwrap_or_default();
        if ssid.trim().is_empty() {
            req.into_status_response(400)?
                .write_all(b"ssid cannot be empty")?;
            return Ok(());
        }

        let credentials = WifiCredentials {
            ssid: ssid.trim().to_string(),
            pass: form_value(&body, "pass").unwrap_or_default(),
        };
        info!("config portal received credentials for `{}`", credentials.ssid);
        if let Ok(mut slot) = submitted.lock() {
            *slot = Some(credentials);
        }

        req.into_ok_response()?
            .write_all(PORTAL_SAVED_HTML.as_bytes())?;
        Ok(())
    })?;

    Ok(server)
}

struct EspSystem {
    nvs_store: NvsStore,
}

impl SystemControl for EspSystem {
    fn restart(&mut self) {
        info!("restarting");
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }

    fn factory_reset(&mut self) {
        warn!("factory reset: clearing wifi credentials");
        if let Err(err) = self.nvs_store.remove(NVS_WIFI_KEY) {
            warn!("failed to clear stored credentials: {err:#}");
        }
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_restore() };
        if rc != esp_idf_svc::sys::ESP_OK {
            warn!("esp_wifi_restore failed: esp_err_t={rc}");
        }
        thread::sleep(Duration::from_millis(1_000));
        self.restart();
    }
}

// The transfer runs on its own thread; `poll` drains its events on the OTA tick.
struct EspOtaService {
    events_tx: Sender<OtaEvent>,
    events_rx: Receiver<OtaEvent>,
    busy: Arc<AtomicBool>,
}

impl Default for EspOtaService {
    fn default() -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            events_tx,
            events_rx,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl OtaService for EspOtaService {
    fn supported(&self) -> bool {
        true
    }

    fn begin(&mut self, request: OtaRequest) -> Result<(), OtaError> {
        request.validate()?;
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(OtaError::AlreadyInProgress);
        }

        let events = self.events_tx.clone();
        let busy = self.busy.clone();
        let spawn_result = thread::Builder::new()
            .name("ota-apply".into())
            .stack_size(16 * 1024)
            .spawn(move || {
                let expected = request.expected_sha256();
                let result = download_and_apply_ota(&events, &request.url, expected.as_deref());
                let event = match result {
                    Ok((bytes, sha256)) => OtaEvent::Finished { bytes, sha256 },
                    Err(err) => OtaEvent::Failed(err.to_string()),
                };
                let _ = events.send(event);
                busy.store(false, Ordering::Release);
            });

        if let Err(err) = spawn_result {
            self.busy.store(false, Ordering::Release);
            return Err(OtaError::Transfer(format!(
                "failed to spawn OTA apply thread: {err}"
            )));
        }
        Ok(())
    }

    fn poll(&mut self) -> Vec<OtaEvent> {
        self.events_rx.try_iter().collect()
    }
}

fn download_and_apply_ota(
    events: &Sender<OtaEvent>,
    url: &str,
    expected_sha256: Option<&str>,
) -> Result<(u64, String), OtaError> {
    let transfer = |err: &dyn core::fmt::Debug| OtaError::Transfer(format!("{err:?}"));

    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let connection = EspHttpConnection::new(&http_conf).map_err(|e| transfer(&e))?;
    let mut client = HttpClient::wrap(connection);
    let request = client
        .request(Method::Get, url, &[])
        .map_err(|e| transfer(&e))?;
    let mut response = request.submit().map_err(|e| transfer(&e))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(OtaError::Transfer(format!(
            "OTA download failed with HTTP {status}"
        )));
    }

    let content_length = response
        .header("content-length")
        .or_else(|| response.header("Content-Length"))
        .and_then(|value| value.parse::<u64>().ok());
    let _ = events.send(OtaEvent::Started {
        source_url: url.to_string(),
        total_bytes: content_length,
    });

    let mut ota = EspOta::new().map_err(|e| transfer(&e))?;
    let mut update = ota.initiate_update().map_err(|e| transfer(&e))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|e| transfer(&e))?;
        if read == 0 {
            break;
        }

        update.write(&chunk[..read]).map_err(|e| transfer(&e))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);
        let _ = events.send(OtaEvent::Progress {
            written: total_written,
            total: content_length,
        });
    }

    if total_written == 0 {
        return Err(OtaError::Transfer("OTA download body is empty".to_string()));
    }

    let digest = hasher.finalize();
    let mut digest_hex = String::with_capacity(64);
    for byte in digest {
        use core::fmt::Write as _;
        let _ = write!(&mut digest_hex, "{byte:02x}");
    }

    if let Some(expected) = expected_sha256 {
        if digest_hex != expected {
            return Err(OtaError::DigestMismatch {
                expected: expected.to_string(),
                actual: digest_hex,
            });
        }
    }

    update.complete().map_err(|e| transfer(&e))?;
    drop(ota);

    Ok((total_written, digest_hex))
}

struct TaskWatchdog;

impl TaskWatchdog {
    // Subscribes the calling task, so this must run on the control loop thread.
    fn arm(timeout: Duration) -> anyhow::Result<Self> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: timeout.as_millis().try_into().unwrap_or(u32::MAX),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        already_done_is_ok(unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) })
            .context("task watchdog init")?;
        already_done_is_ok(unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) })
            .context("task watchdog subscribe")?;
        Ok(Self)
    }

    fn feed(&self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

fn already_done_is_ok(rc: esp_idf_svc::sys::esp_err_t) -> Result<(), EspError> {
    if rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    EspError::convert(rc)
}

fn keep_radio_awake() -> Result<(), EspError> {
    EspError::convert(unsafe {
        esp_idf_svc::sys::esp_wifi_set_ps(esp_idf_svc::sys::wifi_ps_type_t_WIFI_PS_NONE)
    })
}

fn uptime_ms() -> u64 {
    let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
    u64::try_from(micros).unwrap_or_default() / 1_000
}
