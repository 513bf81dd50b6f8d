pub mod boot;
pub mod button;
pub mod command_port;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod form;
pub mod http;
pub mod led;
pub mod net;
pub mod ota;
pub mod platform;
pub mod relay;
pub mod routes;
pub mod scheduler;
pub mod types;

pub use boot::{bring_up, BootOutcome};
pub use button::{classify, ButtonClassifier, ButtonPhase, DebounceTimer};
pub use command_port::{parse_command, CommandOutcome, CommandServer, PortCommand};
pub use config::{
    CommandMatching, PersistedSettings, PinConfig, PressThresholds, RequestLimits, SwitchConfig,
    TimerPeriods, SETTINGS_SALT,
};
pub use device::{Device, DeviceParts};
pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher, EchoHandler, Handler};
pub use http::{Method, ProtocolError, Request, Response};
pub use led::{BlinkPattern, Blinker};
pub use net::{Connection, Listener, TcpConnection, TcpPort};
pub use ota::{OtaError, OtaEvent, OtaRequest, OtaService, OtaStatus};
pub use platform::{
    ButtonInput, Callback, Clock, Provisioning, SettingsError, SettingsStore, SystemControl,
};
pub use relay::{OutputPin, RelayController};
pub use routes::DeviceState;
pub use scheduler::{flag_raiser, ReadinessFlags, Scheduler, Task, TickReport, Workload};
pub use types::{ButtonSample, Command, Level, PressEvent, PressKind, RelayState};
