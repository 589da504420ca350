use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connected,
    HeartbeatLost,
}

/// Inbound traffic rate over the window since the previous sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    pub packets_per_sec: f64,
    pub bytes_per_sec: f64,
}

/// Round-trip statistics in milliseconds. All zero until the first sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub current_ms: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSyncState {
    #[default]
    Idle,
    Downloading,
    Complete,
    Stalled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamProgress {
    pub state: ParamSyncState,
    pub received: u32,
    pub expected: u32,
    pub percent: f32,
}

/// Everything the presentation layer broadcasts on its slow cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub ts_unix_ms: i64,
    pub state: LinkState,
    pub target_system: Option<u8>,
    pub target_component: Option<u8>,
    pub link: LinkStats,
    pub latency: LatencyStats,
    pub params: ParamProgress,
    // Vehicle
    pub flight_mode: Option<String>,
    pub armed: Option<bool>,
    pub battery_voltage: Option<f32>,
    pub battery_percent: Option<u8>,
    pub battery_current: Option<f32>,
    pub gps_fix: Option<String>,
    pub satellites: Option<u8>,
}

impl StatusReport {
    pub fn disconnected(ts_unix_ms: i64) -> Self {
        Self {
            ts_unix_ms,
            state: LinkState::Disconnected,
            target_system: None,
            target_component: None,
            link: LinkStats::default(),
            latency: LatencyStats::default(),
            params: ParamProgress::default(),
            flight_mode: None,
            armed: None,
            battery_voltage: None,
            battery_percent: None,
            battery_current: None,
            gps_fix: None,
            satellites: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_serialize_snake_case() {
        let s = serde_json::to_string(&LinkState::HeartbeatLost).unwrap();
        assert_eq!(s, "\"heartbeat_lost\"");
        let s = serde_json::to_string(&ParamSyncState::Downloading).unwrap();
        assert_eq!(s, "\"downloading\"");
    }

    #[test]
    fn disconnected_report_is_empty() {
        let r = StatusReport::disconnected(42);
        assert_eq!(r.state, LinkState::Disconnected);
        assert_eq!(r.params.expected, 0);
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["ts_unix_ms"], 42);
        assert!(v["flight_mode"].is_null());
    }
}
