//! Simulated flight controller on the far end of an in-memory link.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gcs_link::transport::memory::{memory_link, MemoryPeer, MemoryTransport};
use gcs_link::wire;
use gcs_link::{LinkConfig, LinkListener, ParameterTable};
use mavlink::common::{
    MavAutopilot, MavCmd, MavMessage, MavModeFlag, MavParamType, MavResult, MavState, MavType, COMMAND_ACK_DATA,
    HEARTBEAT_DATA, PARAM_VALUE_DATA, TIMESYNC_DATA,
};

pub const FC_SYS: u8 = 1;
pub const FC_COMP: u8 = 1;

pub type AckPolicy = Box<dyn Fn(MavCmd) -> Option<MavResult> + Send + Sync>;

pub fn accept_all() -> AckPolicy {
    Box::new(|_| Some(MavResult::MAV_RESULT_ACCEPTED))
}

pub fn vehicle_heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_STANDBY,
        mavlink_version: 3,
    })
}

pub fn param_value(name: &str, value: f32, index: u16, count: u16) -> MavMessage {
    MavMessage::PARAM_VALUE(PARAM_VALUE_DATA {
        param_value: value,
        param_count: count,
        param_index: index,
        param_id: wire::encode_param_id(name).unwrap(),
        param_type: MavParamType::MAV_PARAM_TYPE_REAL32,
    })
}

pub fn fast_config() -> LinkConfig {
    LinkConfig {
        connect_timeout_ms: 2_000,
        recv_timeout_ms: 20,
        latency_probe_ms: 200,
        ..LinkConfig::default()
    }
}

struct SimState {
    params: Vec<(String, f32)>,
    ack: AckPolicy,
    heartbeat_period: Duration,
    silent: AtomicBool,
    commands_seen: AtomicUsize,
    received: Mutex<Vec<MavMessage>>,
    stop: AtomicBool,
}

pub struct SimFc {
    pub peer: Arc<MemoryPeer>,
    state: Arc<SimState>,
    thread: Option<JoinHandle<()>>,
}

impl SimFc {
    /// Returns the ground-station end of the link and the running simulator.
    pub fn start(params: &[(&str, f32)], ack: AckPolicy) -> (MemoryTransport, SimFc) {
        Self::start_with_period(params, ack, Duration::from_millis(100))
    }

    pub fn start_with_period(params: &[(&str, f32)], ack: AckPolicy, heartbeat_period: Duration) -> (MemoryTransport, SimFc) {
        let (transport, peer) = memory_link();
        let peer = Arc::new(peer);
        let state = Arc::new(SimState {
            params: params.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
            ack,
            heartbeat_period,
            silent: AtomicBool::new(false),
            commands_seen: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            stop: AtomicBool::new(false),
        });
        let thread = {
            let peer = peer.clone();
            let state = state.clone();
            std::thread::spawn(move || sim_loop(&peer, &state))
        };
        (transport, SimFc { peer, state, thread: Some(thread) })
    }

    /// Stop (or resume) heartbeats and replies, as a vehicle dropping off the air would.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn commands_seen(&self) -> usize {
        self.state.commands_seen.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<MavMessage> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn send(&self, message: MavMessage) {
        self.peer.send(FC_SYS, FC_COMP, message);
    }
}

impl Drop for SimFc {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn sim_loop(peer: &MemoryPeer, state: &SimState) {
    let mut next_hb = Instant::now();
    while !state.stop.load(Ordering::SeqCst) {
        let silent = state.silent.load(Ordering::SeqCst);
        if !silent && Instant::now() >= next_hb {
            peer.send(FC_SYS, FC_COMP, vehicle_heartbeat());
            next_hb = Instant::now() + state.heartbeat_period;
        }

        let Some((_, msg)) = peer.recv_timeout(Duration::from_millis(5)) else { continue };
        state.received.lock().unwrap().push(msg.clone());
        if silent {
            continue;
        }
        match msg {
            MavMessage::PARAM_REQUEST_LIST(_) => {
                let count = state.params.len() as u16;
                for (i, (name, value)) in state.params.iter().enumerate() {
                    peer.send(FC_SYS, FC_COMP, param_value(name, *value, i as u16, count));
                }
            }
            MavMessage::PARAM_SET(set) => {
                let name = wire::decode_text(&set.param_id);
                let count = state.params.len() as u16;
                if let Some(i) = state.params.iter().position(|(n, _)| *n == name) {
                    peer.send(FC_SYS, FC_COMP, param_value(&name, set.param_value, i as u16, count));
                }
            }
            MavMessage::COMMAND_LONG(cmd) => {
                state.commands_seen.fetch_add(1, Ordering::SeqCst);
                if let Some(result) = (state.ack)(cmd.command) {
                    peer.send(
                        FC_SYS,
                        FC_COMP,
                        MavMessage::COMMAND_ACK(COMMAND_ACK_DATA { command: cmd.command, result, ..Default::default() }),
                    );
                }
            }
            MavMessage::TIMESYNC(ts) if ts.tc1 == 0 => {
                peer.send(FC_SYS, FC_COMP, MavMessage::TIMESYNC(TIMESYNC_DATA { tc1: 1, ts1: ts.ts1, ..Default::default() }));
            }
            _ => {}
        }
    }
}

/// Poll `cond` until it holds or `within` runs out.
pub fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[derive(Default)]
pub struct Recorder {
    pub completed: AtomicUsize,
    pub completed_size: AtomicUsize,
    pub lost: AtomicUsize,
    pub restored: AtomicUsize,
    pub disconnected: Mutex<Vec<String>>,
}

impl LinkListener for Recorder {
    fn on_parameters_complete(&self, table: &ParameterTable) {
        self.completed_size.store(table.len(), Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_heartbeat_lost(&self) {
        self.lost.fetch_add(1, Ordering::SeqCst);
    }

    fn on_heartbeat_restored(&self) {
        self.restored.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnected(&self, reason: &str) {
        self.disconnected.lock().unwrap().push(reason.to_string());
    }
}
