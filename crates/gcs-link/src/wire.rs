//! Frame builders and field helpers for the handful of MAVLink messages the
//! link core emits. Everything here is pure.

use mavlink::common::{
    MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavParamType, MavState, MavType, COMMAND_LONG_DATA,
    HEARTBEAT_DATA, PARAM_REQUEST_LIST_DATA, PARAM_REQUEST_READ_DATA, PARAM_SET_DATA, REQUEST_DATA_STREAM_DATA,
    TIMESYNC_DATA,
};
use mavlink::{MavlinkVersion, Message};

use crate::error::ParamError;

pub const PARAM_ID_LEN: usize = 16;

/// Header (10) + checksum (2) of a v2 frame, unsigned.
const V2_OVERHEAD: usize = 12;

pub const MSG_ID_AUTOPILOT_VERSION: u32 = 148;

/// Addressing pair of the vehicle we talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub system: u8,
    pub component: u8,
}

impl Target {
    pub fn new(system: u8, component: u8) -> Self {
        Self { system, component }
    }
}

pub fn estimate_wire_len(message: &MavMessage) -> usize {
    let mut buf = [0u8; 255];
    message.ser(MavlinkVersion::V2, &mut buf) + V2_OVERHEAD
}

pub fn encode_param_id(name: &str) -> Result<[u8; PARAM_ID_LEN], ParamError> {
    if name.is_empty() {
        return Err(ParamError::EmptyName);
    }
    let bytes = name.as_bytes();
    if bytes.len() > PARAM_ID_LEN {
        return Err(ParamError::NameTooLong(name.to_string()));
    }
    let mut id = [0u8; PARAM_ID_LEN];
    id[..bytes.len()].copy_from_slice(bytes);
    Ok(id)
}

/// NUL-terminated (or full-width) MAVLink char field to a Rust string.
pub fn decode_text(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

pub fn gcs_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

pub fn param_request_list(target: Target) -> MavMessage {
    MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA {
        target_system: target.system,
        target_component: target.component,
    })
}

pub fn param_request_read(target: Target, index: u16) -> MavMessage {
    MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
        param_index: index as i16,
        target_system: target.system,
        target_component: target.component,
        param_id: [0u8; PARAM_ID_LEN],
    })
}

pub fn param_set(target: Target, param_id: [u8; PARAM_ID_LEN], value: f32) -> MavMessage {
    MavMessage::PARAM_SET(PARAM_SET_DATA {
        param_value: value,
        target_system: target.system,
        target_component: target.component,
        param_id,
        param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
    })
}

pub fn command_long(target: Target, command: MavCmd, params: [f32; 7]) -> MavMessage {
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        target_system: target.system,
        target_component: target.component,
        command,
        confirmation: 0,
        param1: params[0],
        param2: params[1],
        param3: params[2],
        param4: params[3],
        param5: params[4],
        param6: params[5],
        param7: params[6],
    })
}

pub fn request_message(target: Target, message_id: u32) -> MavMessage {
    let mut params = [0.0f32; 7];
    params[0] = message_id as f32;
    command_long(target, MavCmd::MAV_CMD_REQUEST_MESSAGE, params)
}

pub fn request_data_stream(target: Target, stream_id: u8, rate_hz: u16, start: bool) -> MavMessage {
    MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
        req_message_rate: rate_hz,
        target_system: target.system,
        target_component: target.component,
        req_stream_id: stream_id,
        start_stop: start as u8,
    })
}

/// Round-trip probe: `tc1 == 0` marks a request, the peer echoes `ts1`.
pub fn timesync_request(ts1: i64) -> MavMessage {
    MavMessage::TIMESYNC(TIMESYNC_DATA { tc1: 0, ts1, ..Default::default() })
}

/// Answer a peer's probe: our clock in `tc1`, its `ts1` echoed back.
pub fn timesync_reply(tc1: i64, ts1: i64) -> MavMessage {
    MavMessage::TIMESYNC(TIMESYNC_DATA { tc1, ts1, ..Default::default() })
}
