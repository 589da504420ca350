use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use gcs_proto::telemetry::{
    LatencyStats, LinkState, LinkStats, ParamProgress, ParamSyncState, StatusReport,
};
use mavlink::common::{MavMessage, MavType};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::commands::{self, AckStatus};
use crate::error::{CommandError, ConnectError, ParamSyncError, ParamUpdateError, SendError};
use crate::firmware::FirmwareInfo;
use crate::listener::{LinkListener, Listeners};
use crate::params::category::{categorize, CategorizedParameters};
use crate::params::{ParameterDelta, ParameterTable};
use crate::session::Session;
use crate::state::SessionInfo;
use crate::target::ConnectTarget;
use crate::telemetry::TelemetrySnapshot;
use crate::transport::{self, InboundFrame, LinkTransport};
use crate::wire;
use crate::LinkConfig;

/// Data streams 0..=5 cover everything ArduPilot groups into REQUEST_DATA_STREAM.
const STREAM_IDS: std::ops::RangeInclusive<u8> = 0..=5;

/// Owns the link to one vehicle and everything learned over it.
///
/// All methods take `&self`; share the manager behind an `Arc` between the
/// threads that poll telemetry and the ones that send commands.
pub struct ConnectionManager {
    config: LinkConfig,
    session: Mutex<Option<Arc<Session>>>,
    listeners: Listeners,
}

impl ConnectionManager {
    pub fn new(config: LinkConfig) -> Self {
        Self { config, session: Mutex::new(None), listeners: Listeners::default() }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn LinkListener>) {
        self.listeners.add(listener);
    }

    fn slot(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.session.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn current(&self) -> Option<Arc<Session>> {
        self.slot().clone()
    }

    fn live(&self) -> Result<Arc<Session>, SendError> {
        self.current().filter(|s| s.is_connected()).ok_or(SendError::NotConnected)
    }

    /// Open `target` and block until the vehicle's first heartbeat.
    pub fn connect(&self, target: &ConnectTarget) -> Result<SessionInfo, ConnectError> {
        info!("link: connecting to {}", target);
        let transport = transport::open(target, self.config.connect_timeout())?;
        self.connect_transport(transport)
    }

    /// Like [`connect`](Self::connect) over a transport the caller already opened.
    pub fn connect_transport(&self, transport: Arc<dyn LinkTransport>) -> Result<SessionInfo, ConnectError> {
        self.teardown();

        let first = match wait_for_heartbeat(transport.as_ref(), &self.config) {
            Ok(f) => f,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };

        let session = Arc::new(Session::new(transport.clone(), &first, &self.config, self.listeners.clone()));
        if let Err(e) = session.start(&self.config) {
            transport.close();
            return Err(ConnectError::TransportOpenFailed {
                target: transport.describe(),
                reason: format!("spawn link workers: {}", e),
            });
        }

        let info = session.info();
        // A concurrent connect may have landed meanwhile; the newest session wins.
        let replaced = self.slot().replace(session);
        if let Some(old) = replaced {
            old.shutdown();
        }
        info!(
            sys = info.target_system,
            comp = info.target_component,
            autopilot = %info.autopilot,
            vehicle = %info.vehicle_type,
            "link: connected via {}",
            info.transport
        );
        Ok(info)
    }

    /// Stop the link and discard its session. A no-op when not connected.
    pub fn disconnect(&self) {
        self.teardown();
    }

    // The session is shut down outside the slot lock so listeners may call back in.
    fn teardown(&self) {
        let previous = self.slot().take();
        if let Some(session) = previous {
            session.shutdown();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.current().map(|s| s.is_connected()).unwrap_or(false)
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.current().map(|s| s.info())
    }

    pub fn heartbeat_timed_out(&self) -> bool {
        self.current().map(|s| s.watchdog.is_timed_out()).unwrap_or(false)
    }

    // --- parameters ---

    pub fn get_parameters(&self) -> ParameterTable {
        self.current().map(|s| s.params.table()).unwrap_or_default()
    }

    pub fn get_parameters_categorized(&self) -> CategorizedParameters {
        categorize(&self.get_parameters())
    }

    /// What changed since the caller's `previous` copy of the table.
    pub fn parameter_delta(&self, previous: &ParameterTable) -> ParameterDelta {
        match self.current() {
            Some(s) => s.params.diff(previous),
            None => ParameterTable::new().diff(previous),
        }
    }

    pub fn request_parameters(&self) -> Result<(), SendError> {
        self.live()?.params.request_all()
    }

    pub fn update_parameter(&self, name: &str, value: f32) -> Result<(), ParamUpdateError> {
        wire::encode_param_id(name)?;
        self.live()?.params.update(name, value)
    }

    pub fn param_progress(&self) -> ParamProgress {
        self.current().map(|s| s.params.progress()).unwrap_or_default()
    }

    pub fn param_sync_status(&self) -> Result<ParamSyncState, ParamSyncError> {
        self.current().map(|s| s.params.status()).unwrap_or(Ok(ParamSyncState::Idle))
    }

    // --- commands ---

    /// Send a named command and wait for its ACK. `None` uses the configured timeout.
    pub fn send_command(
        &self,
        name: &str,
        params: [f32; 7],
        timeout: Option<Duration>,
    ) -> Result<AckStatus, CommandError> {
        let command = commands::lookup(name).ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        let session = self.live()?;
        session
            .commands
            .send_command_and_wait(command, params, timeout.unwrap_or_else(|| self.config.command_timeout()))
    }

    pub fn request_data_streams(&self, rate_hz: u16) -> Result<(), SendError> {
        let session = self.live()?;
        let target = session.target();
        for id in STREAM_IDS {
            session.sender.send(&wire::request_data_stream(target, id, rate_hz, true))?;
        }
        info!("link: requested data streams at {} Hz", rate_hz);
        Ok(())
    }

    /// Ask for AUTOPILOT_VERSION. Fire and forget; the reply lands in [`firmware_info`](Self::firmware_info).
    pub fn request_autopilot_version(&self) -> Result<(), SendError> {
        let session = self.live()?;
        session.sender.send(&wire::request_message(session.target(), wire::MSG_ID_AUTOPILOT_VERSION))?;
        Ok(())
    }

    pub fn firmware_info(&self) -> Option<FirmwareInfo> {
        let session = self.current()?;
        let fw = session.firmware.lock().unwrap_or_else(|p| p.into_inner()).clone();
        fw
    }

    // --- telemetry ---

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.current().map(|s| s.telemetry.snapshot()).unwrap_or_else(TelemetrySnapshot::empty)
    }

    /// Messages currently held in the session's receive ring.
    pub fn buffered_messages(&self) -> usize {
        self.current().map(|s| s.telemetry.len()).unwrap_or(0)
    }

    /// Inbound rates since the previous call, from any caller.
    pub fn link_stats(&self) -> LinkStats {
        self.current().map(|s| s.telemetry.link_stats()).unwrap_or_default()
    }

    pub fn latency_stats(&self) -> LatencyStats {
        self.current().map(|s| s.latency.stats()).unwrap_or_default()
    }

    pub fn outbound_log(&self) -> Vec<&'static str> {
        self.current().map(|s| s.telemetry.outbound_log()).unwrap_or_default()
    }

    /// One-shot summary for the slow consumer. Samples (and so resets) link stats.
    pub fn status_report(&self) -> StatusReport {
        let ts_unix_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64;
        let Some(session) = self.current() else {
            return StatusReport::disconnected(ts_unix_ms);
        };

        let state = if !session.is_connected() {
            LinkState::Disconnected
        } else if session.watchdog.is_timed_out() {
            LinkState::HeartbeatLost
        } else {
            LinkState::Connected
        };

        let snap = session.telemetry.snapshot();
        let mode = snap.mode();
        let battery = snap.battery().unwrap_or_default();
        let gps = snap.gps();
        let target = session.target();

        StatusReport {
            ts_unix_ms,
            state,
            target_system: Some(target.system),
            target_component: Some(target.component),
            link: session.telemetry.link_stats(),
            latency: session.latency.stats(),
            params: session.params.progress(),
            flight_mode: mode.as_ref().map(|m| m.name.clone()),
            armed: mode.map(|m| m.armed),
            battery_voltage: battery.voltage,
            battery_percent: battery.remaining,
            battery_current: battery.current,
            gps_fix: gps.as_ref().map(|g| g.fix.clone()),
            satellites: gps.and_then(|g| g.satellites),
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Wait for a heartbeat from a vehicle: not from us, not from another ground station.
pub(crate) fn wait_for_heartbeat(transport: &dyn LinkTransport, config: &LinkConfig) -> Result<InboundFrame, ConnectError> {
    let started = Instant::now();
    let deadline = started + config.connect_timeout();
    let mut next_announce = started;
    let hb_header = mavlink::MavHeader { system_id: config.sys_id, component_id: config.comp_id, sequence: 0 };

    debug!("link: waiting for heartbeat on {}", transport.describe());
    loop {
        let now = Instant::now();
        if now >= deadline {
            warn!("link: no heartbeat from {}", transport.describe());
            return Err(ConnectError::NoResponse { target: transport.describe(), waited: now - started });
        }

        // udpout/tcpout peers only learn where we are once we talk.
        if config.send_heartbeat && now >= next_announce {
            if let Err(e) = transport.send(&hb_header, &wire::gcs_heartbeat()) {
                debug!("link: announce heartbeat failed: {}", e);
            }
            next_announce = now + Duration::from_secs(1);
        }

        let slice = (deadline - now).min(config.recv_timeout()).min(Duration::from_secs(1));
        match transport.recv(slice) {
            Ok(Some(frame)) => {
                if let MavMessage::HEARTBEAT(hb) = &frame.message {
                    if frame.header.system_id != config.sys_id && hb.mavtype != MavType::MAV_TYPE_GCS {
                        return Ok(frame);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                return Err(ConnectError::TransportOpenFailed {
                    target: transport.describe(),
                    reason: format!("read before first heartbeat: {}", e),
                });
            }
        }
    }
}
