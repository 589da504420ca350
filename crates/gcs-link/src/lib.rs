pub mod autodetect;
pub mod commands;
pub mod doctor;
pub mod error;
pub mod firmware;
pub mod latency;
pub mod listener;
pub mod manager;
pub mod outbound;
pub mod params;
pub mod shutdown;
pub mod state;
pub mod target;
pub mod telemetry;
pub mod transport;
pub mod watchdog;
pub mod wire;

mod dispatcher;
mod session;

use std::time::Duration;

use serde::Deserialize;

pub use commands::AckStatus;
pub use error::{CommandError, ConnectError, ParamSyncError, ParamUpdateError, SendError, TransportError};
pub use listener::LinkListener;
pub use manager::ConnectionManager;
pub use params::{ParameterDelta, ParameterTable};
pub use state::SessionInfo;
pub use target::ConnectTarget;
pub use telemetry::TelemetrySnapshot;

use params::StallPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Connection string, see [`ConnectTarget::parse`]. Unset means autodetect.
    pub target: Option<String>,

    /// Baud for bare serial device names.
    pub baud: u32,

    /// If true and no target is set, probe candidate serial ports/bauds and
    /// pick the first that yields a vehicle HEARTBEAT.
    pub autodetect: bool,

    /// Autodetect candidates (paths). Example:
    /// ["/dev/serial0","/dev/ttyAMA0","/dev/ttyS0","/dev/ttyUSB0","/dev/ttyACM0"]
    pub candidate_devs: Option<Vec<String>>,

    /// Autodetect candidate baud rates (common ArduPilot telemetry values).
    pub candidate_bauds: Option<Vec<u32>>,

    /// MAVLink ids we use (ground station side)
    pub sys_id: u8,
    pub comp_id: u8,

    pub connect_timeout_ms: u64,
    /// Bound on a single dispatcher receive; also bounds shutdown latency.
    pub recv_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub latency_probe_ms: u64,

    pub param_stall_timeout_ms: u64,
    pub param_stall_retries: u32,

    /// Emit a GCS heartbeat once per second while connected.
    pub send_heartbeat: bool,

    /// REQUEST_DATA_STREAM rate used by callers that ask for streams.
    pub stream_rate_hz: u16,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            target: None,
            baud: 57600,
            autodetect: false,
            candidate_devs: None,
            candidate_bauds: None,
            sys_id: 255,
            comp_id: 190,
            connect_timeout_ms: 10_000,
            recv_timeout_ms: 500,
            heartbeat_timeout_ms: 5_000,
            command_timeout_ms: 3_000,
            latency_probe_ms: 1_000,
            param_stall_timeout_ms: 3_000,
            param_stall_retries: 3,
            send_heartbeat: true,
            stream_rate_hz: 4,
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn latency_probe(&self) -> Duration {
        Duration::from_millis(self.latency_probe_ms)
    }

    pub fn stall_policy(&self) -> StallPolicy {
        StallPolicy {
            timeout: Duration::from_millis(self.param_stall_timeout_ms),
            retries: self.param_stall_retries,
            ..StallPolicy::default()
        }
    }

    /// Parsed `target`, if one is configured.
    pub fn connect_target(&self) -> Result<Option<ConnectTarget>, ConnectError> {
        self.target.as_deref().map(|t| ConnectTarget::parse(t, self.baud)).transpose()
    }
}
