//! The single reader of a session's transport.

use std::time::Duration;

use mavlink::common::{MavMessage, MavType};
use mavlink::Message;
use tracing::{debug, error, info, trace};

use crate::firmware::FirmwareInfo;
use crate::session::Session;
use crate::shutdown::StopToken;
use crate::telemetry::RawMessage;
use crate::transport::InboundFrame;
use crate::watchdog::LivenessChange;
use crate::wire;

/// Receive until stopped or the transport fails. Never reconnects.
pub(crate) fn run(session: &Session, stop: &StopToken, recv_timeout: Duration) {
    debug!("dispatcher running on {}", session.transport.describe());
    while !stop.is_stopped() {
        match session.transport.recv(recv_timeout) {
            Ok(Some(frame)) => dispatch(session, frame),
            Ok(None) => {}
            Err(e) => {
                if !stop.is_stopped() {
                    error!("link read failed: {}", e);
                    session.link_failed(&e.to_string());
                }
                break;
            }
        }
    }
    debug!("dispatcher exited");
}

/// Route one inbound frame. Frames from other systems are counted but not used.
pub(crate) fn dispatch(session: &Session, frame: InboundFrame) {
    session.telemetry.count_inbound(frame.wire_len);

    if frame.header.system_id != session.target().system {
        trace!(sys = frame.header.system_id, msg = frame.message.message_name(), "ignoring foreign frame");
        return;
    }

    match &frame.message {
        MavMessage::HEARTBEAT(hb) => {
            if hb.mavtype == MavType::MAV_TYPE_GCS {
                return;
            }
            if session.watchdog.on_heartbeat(frame.received_at) == Some(LivenessChange::Restored) {
                session.listeners.each(|l| l.on_heartbeat_restored());
            }
            session.telemetry.push(RawMessage::from(&frame));
        }
        MavMessage::PARAM_VALUE(pv) => session.params.ingest(pv),
        MavMessage::COMMAND_ACK(ack) => {
            session.commands.resolve(ack.command as u32, ack.result);
        }
        MavMessage::TIMESYNC(ts) => {
            if ts.tc1 == 0 {
                let reply = wire::timesync_reply(session.latency.clock_ns(frame.received_at), ts.ts1);
                if let Err(e) = session.sender.send(&reply) {
                    debug!("timesync reply not sent: {}", e);
                }
            } else if let Some(rtt) = session.latency.on_timesync(ts.tc1, ts.ts1, frame.received_at) {
                trace!(rtt_ms = rtt, "latency sample");
            }
        }
        MavMessage::AUTOPILOT_VERSION(v) => {
            let fw = FirmwareInfo::from_autopilot_version(v);
            info!(
                version = %fw.version_string(),
                board = ?fw.board_version,
                custom = %fw.custom_version,
                "firmware: vendor {:#06x} product {:#06x}, {} capabilities",
                fw.vendor_id,
                fw.product_id,
                fw.capabilities.len()
            );
            *session.firmware.lock().unwrap_or_else(|p| p.into_inner()) = Some(fw);
            session.telemetry.push(RawMessage::from(&frame));
        }
        MavMessage::STATUSTEXT(st) => {
            info!(severity = ?st.severity, "fc: {}", wire::decode_text(&st.text));
            session.telemetry.push(RawMessage::from(&frame));
        }
        _ => session.telemetry.push(RawMessage::from(&frame)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{LinkListener, Listeners};
    use crate::transport::memory::{memory_link, MemoryPeer};
    use crate::LinkConfig;
    use mavlink::common::{
        MavAutopilot, MavCmd, MavModeFlag, MavParamType, MavResult, MavSeverity, MavState, COMMAND_ACK_DATA,
        HEARTBEAT_DATA, PARAM_VALUE_DATA, STATUSTEXT_DATA, TIMESYNC_DATA, VFR_HUD_DATA,
    };
    use mavlink::MavHeader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn vehicle_heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_STANDBY,
            mavlink_version: 3,
        })
    }

    fn frame(sys: u8, message: MavMessage) -> InboundFrame {
        InboundFrame::new(MavHeader { system_id: sys, component_id: 1, sequence: 0 }, message)
    }

    #[derive(Default)]
    struct Counts {
        restored: AtomicUsize,
        params: AtomicUsize,
    }

    impl LinkListener for Counts {
        fn on_heartbeat_restored(&self) {
            self.restored.fetch_add(1, Ordering::SeqCst);
        }
        fn on_parameters_complete(&self, _table: &crate::params::ParameterTable) {
            self.params.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session() -> (Session, MemoryPeer, Arc<Counts>) {
        let (transport, peer) = memory_link();
        let listeners = Listeners::default();
        let counts = Arc::new(Counts::default());
        listeners.add(counts.clone());
        let first = frame(1, vehicle_heartbeat());
        let s = Session::new(Arc::new(transport), &first, &LinkConfig::default(), listeners);
        (s, peer, counts)
    }

    #[test]
    fn routes_params_acks_and_telemetry() {
        let (s, _peer, counts) = session();
        dispatch(
            &s,
            frame(
                1,
                MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
                    param_value: 1.0,
                    param_count: 1,
                    param_index: 0,
                    param_id: wire::encode_param_id("SYSID_THISMAV").unwrap(),
                    param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
                }),
            ),
        );
        assert_eq!(s.params.table().get("SYSID_THISMAV"), Some(1.0));
        assert_eq!(counts.params.load(Ordering::SeqCst), 1);

        dispatch(
            &s,
            frame(
                1,
                MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
                    command: MavCmd::MAV_CMD_NAV_LAND,
                    result: MavResult::MAV_RESULT_ACCEPTED,
                    ..Default::default()
                }),
            ),
        );
        dispatch(
            &s,
            frame(
                1,
                MavMessage::VFR_HUD(VFR_HUD_DATA {
                    airspeed: 0.0,
                    groundspeed: 0.0,
                    alt: 12.0,
                    climb: 0.0,
                    heading: 90,
                    throttle: 0,
                }),
            ),
        );

        let snap = s.telemetry.snapshot();
        assert!(snap.get("VFR_HUD").is_some());
        assert!(snap.get("HEARTBEAT").is_some());
        assert!(snap.get("PARAM_VALUE").is_none());
        assert!(snap.get("COMMAND_ACK").is_none());
    }

    #[test]
    fn foreign_and_gcs_frames_are_not_used() {
        let (s, _peer, _) = session();
        dispatch(&s, frame(42, MavMessage::STATUSTEXT(STATUSTEXT_DATA {
            severity: MavSeverity::MAV_SEVERITY_INFO,
            text: [b'x'; 50],
            ..Default::default()
        })));
        dispatch(&s, frame(1, wire::gcs_heartbeat()));
        let snap = s.telemetry.snapshot();
        assert!(snap.get("STATUSTEXT").is_none());
        let Some(MavMessage::HEARTBEAT(hb)) = snap.get("HEARTBEAT") else { panic!("vehicle heartbeat missing") };
        assert_eq!(hb.mavtype, MavType::MAV_TYPE_QUADROTOR);
    }

    #[test]
    fn heartbeat_after_outage_notifies_restore() {
        let (s, _peer, counts) = session();
        s.watchdog.check(Instant::now() + Duration::from_secs(10));
        assert!(s.watchdog.is_timed_out());
        dispatch(&s, frame(1, vehicle_heartbeat()));
        assert!(!s.watchdog.is_timed_out());
        assert_eq!(counts.restored.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn answers_peer_timesync_probe() {
        let (s, peer, _) = session();
        dispatch(&s, frame(1, MavMessage::TIMESYNC(TIMESYNC_DATA { tc1: 0, ts1: 777, ..Default::default() })));
        let (_, reply) = peer.try_recv().expect("reply sent");
        let MavMessage::TIMESYNC(t) = reply else { panic!("expected TIMESYNC") };
        assert_eq!(t.ts1, 777);
        assert_ne!(t.tc1, 0);
    }

    #[test]
    fn every_frame_counts_toward_link_stats() {
        let (s, _peer, _) = session();
        s.telemetry.link_stats();
        for _ in 0..10 {
            dispatch(&s, frame(9, vehicle_heartbeat()));
        }
        std::thread::sleep(Duration::from_millis(20));
        assert!(s.telemetry.link_stats().packets_per_sec > 0.0);
    }
}
