use mavlink::common::AUTOPILOT_VERSION_DATA;
use serde::Serialize;

use crate::wire::decode_text;

/// MAV_PROTOCOL_CAPABILITY bits.
const CAPABILITIES: &[(u64, &str)] = &[
    (1 << 0, "Mission Float"),
    (1 << 1, "Param Float"),
    (1 << 2, "Mission Int"),
    (1 << 3, "Command Int"),
    (1 << 4, "Param Bytewise Encoding"),
    (1 << 5, "FTP"),
    (1 << 6, "Set Attitude Target"),
    (1 << 7, "Set Position Target Local NED"),
    (1 << 8, "Set Position Target Global Int"),
    (1 << 9, "Terrain"),
    (1 << 10, "Set Actuator Target"),
    (1 << 11, "Flight Termination"),
    (1 << 12, "Compass Calibration"),
    (1 << 13, "MAVLink 2"),
    (1 << 14, "Mission Fence"),
    (1 << 15, "Mission Rally"),
    (1 << 16, "Flight Information"),
    (1 << 17, "Param C-Cast Encoding"),
];

/// Decoded AUTOPILOT_VERSION.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FirmwareInfo {
    pub version: (u8, u8, u8),
    /// Release type byte (dev, alpha, beta, rc, official).
    pub release_type: u8,
    pub board_version: (u8, u8),
    pub custom_version: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub capabilities: Vec<&'static str>,
}

impl FirmwareInfo {
    pub fn from_autopilot_version(msg: &AUTOPILOT_VERSION_DATA) -> Self {
        let sw = msg.flight_sw_version;
        let board = msg.board_version;
        let caps = msg.capabilities.bits();
        Self {
            version: ((sw >> 24) as u8, (sw >> 16) as u8, (sw >> 8) as u8),
            release_type: sw as u8,
            board_version: ((board >> 24) as u8, (board >> 16) as u8),
            custom_version: decode_text(&msg.flight_custom_version),
            vendor_id: msg.vendor_id,
            product_id: msg.product_id,
            capabilities: CAPABILITIES.iter().filter(|(bit, _)| caps & bit != 0).map(|(_, n)| *n).collect(),
        }
    }

    pub fn version_string(&self) -> String {
        let (a, b, c) = self.version;
        format!("{}.{}.{}", a, b, c)
    }
}
