//! Typed readings derived from a [`TelemetrySnapshot`].

use mavlink::common::{MavMessage, MavModeFlag, SYS_STATUS_DATA};
use serde::Serialize;

use super::TelemetrySnapshot;

/// ArduCopter `custom_mode` numbers.
pub const COPTER_MODES: &[(u32, &str)] = &[
    (0, "STABILIZE"),
    (1, "ACRO"),
    (2, "ALT_HOLD"),
    (3, "AUTO"),
    (4, "GUIDED"),
    (5, "LOITER"),
    (6, "RTL"),
    (7, "CIRCLE"),
    (9, "LAND"),
    (11, "DRIFT"),
    (13, "SPORT"),
    (14, "FLIP"),
    (15, "AUTOTUNE"),
    (16, "POSHOLD"),
    (17, "BRAKE"),
    (18, "THROW"),
    (19, "AVOID_ADSB"),
    (20, "GUIDED_NOGPS"),
    (21, "SMART_RTL"),
    (22, "FLOWHOLD"),
    (23, "FOLLOW"),
    (24, "ZIGZAG"),
    (25, "SYSTEMID"),
    (26, "AUTOROTATE"),
    (27, "AUTO_RTL"),
];

pub fn copter_mode_name(custom_mode: u32) -> String {
    COPTER_MODES
        .iter()
        .find(|(n, _)| *n == custom_mode)
        .map(|(_, name)| (*name).to_string())
        .unwrap_or_else(|| format!("Unknown ({})", custom_mode))
}

pub fn copter_mode_number(name: &str) -> Option<u32> {
    COPTER_MODES.iter().find(|(_, n)| n.eq_ignore_ascii_case(name.trim())).map(|(v, _)| *v)
}

/// SYS_STATUS onboard sensor bits.
pub const SENSOR_FLAGS: &[(u32, &str)] = &[
    (1 << 0, "3D Gyro"),
    (1 << 1, "3D Accel"),
    (1 << 2, "3D Magnetometer"),
    (1 << 3, "Absolute Pressure"),
    (1 << 4, "Differential Pressure"),
    (1 << 5, "GPS"),
    (1 << 6, "Optical Flow"),
    (1 << 7, "Vision Position"),
    (1 << 8, "Laser Position"),
    (1 << 9, "External Ground Truth"),
    (1 << 10, "3D Angular Rate Control"),
    (1 << 11, "Attitude Stabilization"),
    (1 << 12, "Yaw Position"),
    (1 << 13, "Z/Altitude Control"),
    (1 << 14, "XY Position Control"),
    (1 << 15, "Motor Outputs"),
    (1 << 16, "RC Receiver"),
    (1 << 17, "3D Gyro2"),
    (1 << 18, "3D Accel2"),
    (1 << 19, "3D Magnetometer2"),
    (1 << 20, "Geofence"),
    (1 << 21, "AHRS"),
    (1 << 22, "Terrain"),
    (1 << 23, "Reverse Motor"),
    (1 << 24, "Logging"),
    (1 << 25, "Battery"),
    (1 << 26, "Proximity"),
    (1 << 27, "Satellite Communication"),
    (1 << 28, "Pre-arm Check"),
    (1 << 29, "Obstacle Avoidance"),
    (1 << 30, "Propulsion"),
    (1 << 31, "Extended Bit-field"),
];

pub fn sensor_names(bits: u32) -> Vec<&'static str> {
    SENSOR_FLAGS.iter().filter(|(bit, _)| bits & bit != 0).map(|(_, n)| *n).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleMode {
    pub custom_mode: u32,
    pub name: String,
    pub armed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BatteryStatus {
    pub voltage: Option<f32>,   // Volts
    pub current: Option<f32>,   // Amps
    pub remaining: Option<u8>,  // Percent
}

impl BatteryStatus {
    pub fn from_sys_status(status: &SYS_STATUS_DATA) -> Self {
        let mut b = BatteryStatus::default();
        // voltage_battery is in millivolts, u16::MAX when unknown
        if status.voltage_battery != u16::MAX {
            b.voltage = Some(status.voltage_battery as f32 / 1000.0);
        }
        // current_battery is in centiamps, -1 when unknown
        if status.current_battery != -1 {
            b.current = Some(status.current_battery as f32 / 100.0);
        }
        if (0..=100).contains(&status.battery_remaining) {
            b.remaining = Some(status.battery_remaining as u8);
        }
        b
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpsStatus {
    pub fix: String,
    pub satellites: Option<u8>,
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub alt_m: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AttitudeDeg {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Hud {
    pub airspeed: f32,
    pub groundspeed: f32,
    pub alt: f32,
    pub climb: f32,
    pub heading: i16,
    pub throttle: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorReport {
    pub present: Vec<&'static str>,
    pub enabled: Vec<&'static str>,
    /// Present and enabled but not reporting healthy.
    pub unhealthy: Vec<&'static str>,
}

impl TelemetrySnapshot {
    pub fn mode(&self) -> Option<VehicleMode> {
        let MavMessage::HEARTBEAT(hb) = self.get("HEARTBEAT")? else { return None };
        Some(VehicleMode {
            custom_mode: hb.custom_mode,
            name: copter_mode_name(hb.custom_mode),
            armed: hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
        })
    }

    pub fn battery(&self) -> Option<BatteryStatus> {
        match self.get("SYS_STATUS")? {
            MavMessage::SYS_STATUS(s) => Some(BatteryStatus::from_sys_status(s)),
            _ => None,
        }
    }

    pub fn gps(&self) -> Option<GpsStatus> {
        let MavMessage::GPS_RAW_INT(g) = self.get("GPS_RAW_INT")? else { return None };
        let fix = format!("{:?}", g.fix_type);
        Some(GpsStatus {
            fix: fix.strip_prefix("GPS_FIX_TYPE_").unwrap_or(&fix).to_string(),
            satellites: (g.satellites_visible != u8::MAX).then_some(g.satellites_visible),
            lat_deg: g.lat as f64 / 1e7,
            lon_deg: g.lon as f64 / 1e7,
            alt_m: g.alt as f32 / 1000.0,
        })
    }

    pub fn attitude(&self) -> Option<AttitudeDeg> {
        let MavMessage::ATTITUDE(a) = self.get("ATTITUDE")? else { return None };
        Some(AttitudeDeg { roll: a.roll.to_degrees(), pitch: a.pitch.to_degrees(), yaw: a.yaw.to_degrees() })
    }

    pub fn hud(&self) -> Option<Hud> {
        let MavMessage::VFR_HUD(h) = self.get("VFR_HUD")? else { return None };
        Some(Hud {
            airspeed: h.airspeed,
            groundspeed: h.groundspeed,
            alt: h.alt,
            climb: h.climb,
            heading: h.heading,
            throttle: h.throttle,
        })
    }

    pub fn sensors(&self) -> Option<SensorReport> {
        let MavMessage::SYS_STATUS(s) = self.get("SYS_STATUS")? else { return None };
        let present = s.onboard_control_sensors_present.bits();
        let enabled = s.onboard_control_sensors_enabled.bits();
        let health = s.onboard_control_sensors_health.bits();
        Some(SensorReport {
            present: sensor_names(present),
            enabled: sensor_names(enabled),
            unhealthy: sensor_names(present & enabled & !health),
        })
    }
}
