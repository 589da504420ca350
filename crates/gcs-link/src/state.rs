use std::time::{Duration, Instant};

use serde::Serialize;

/// What `connect` learned from the vehicle's first heartbeat, plus liveness.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub transport: String,
    pub target_system: u8,
    pub target_component: u8,
    pub autopilot: String,
    pub vehicle_type: String,
    pub connected: bool,
    #[serde(skip)]
    pub connected_at: Instant,
    #[serde(skip)]
    pub last_heartbeat: Instant,
}

impl SessionInfo {
    pub fn hb_age(&self) -> Duration {
        self.last_heartbeat.elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// `MAV_AUTOPILOT_ARDUPILOTMEGA` -> `ARDUPILOTMEGA`
pub(crate) fn enum_label<T: std::fmt::Debug>(value: &T, prefix: &str) -> String {
    let full = format!("{:?}", value);
    full.strip_prefix(prefix).unwrap_or(&full).to_string()
}
