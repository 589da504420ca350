//! Everything that lives for one connect/disconnect cycle.
//!
//! A `Session` is built once the vehicle's first heartbeat is in hand and is
//! dropped whole on disconnect, so a reconnect never sees a previous link's
//! parameters, pending commands or telemetry.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use mavlink::common::MavMessage;
use tracing::{debug, info, warn};

use crate::commands::CommandAckCoordinator;
use crate::dispatcher;
use crate::firmware::FirmwareInfo;
use crate::latency::LatencyMonitor;
use crate::listener::Listeners;
use crate::outbound::LinkSender;
use crate::params::ParameterSyncEngine;
use crate::shutdown::{spawn_periodic, StopSignal};
use crate::state::{enum_label, SessionInfo};
use crate::telemetry::{RawMessage, TelemetryBufferStore};
use crate::transport::{InboundFrame, LinkTransport};
use crate::watchdog::{HeartbeatWatchdog, LivenessChange};
use crate::wire::{self, Target};
use crate::LinkConfig;

const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

pub(crate) struct Session {
    info: SessionInfo,
    pub transport: Arc<dyn LinkTransport>,
    pub sender: Arc<LinkSender>,
    pub params: ParameterSyncEngine,
    pub commands: CommandAckCoordinator,
    pub telemetry: Arc<TelemetryBufferStore>,
    pub watchdog: HeartbeatWatchdog,
    pub latency: LatencyMonitor,
    pub firmware: Mutex<Option<FirmwareInfo>>,
    pub listeners: Listeners,
    connected: AtomicBool,
    stop: StopSignal,
    workers: Mutex<Vec<JoinHandle<()>>>,
    send_heartbeat: bool,
}

impl Session {
    /// Build the session around the heartbeat that proved the vehicle is there.
    /// No threads run until [`Session::start`].
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        first: &InboundFrame,
        config: &LinkConfig,
        listeners: Listeners,
    ) -> Self {
        let target = Target::new(first.header.system_id, first.header.component_id);
        let (autopilot, vehicle_type) = match &first.message {
            MavMessage::HEARTBEAT(hb) => {
                (enum_label(&hb.autopilot, "MAV_AUTOPILOT_"), enum_label(&hb.mavtype, "MAV_TYPE_"))
            }
            _ => (String::new(), String::new()),
        };

        let telemetry = Arc::new(TelemetryBufferStore::new());
        telemetry.count_inbound(first.wire_len);
        telemetry.push(RawMessage::from(first));

        let sender = Arc::new(LinkSender::new(
            transport.clone(),
            config.sys_id,
            config.comp_id,
            target,
            telemetry.clone(),
        ));

        let hook = listeners.clone();
        let params = ParameterSyncEngine::new(
            sender.clone(),
            config.stall_policy(),
            Box::new(move |table| hook.each(|l| l.on_parameters_complete(table))),
        );

        Self {
            info: SessionInfo {
                transport: transport.describe(),
                target_system: target.system,
                target_component: target.component,
                autopilot,
                vehicle_type,
                connected: true,
                connected_at: first.received_at,
                last_heartbeat: first.received_at,
            },
            commands: CommandAckCoordinator::new(sender.clone()),
            watchdog: HeartbeatWatchdog::new(config.heartbeat_timeout(), first.received_at),
            latency: LatencyMonitor::new(),
            firmware: Mutex::new(None),
            connected: AtomicBool::new(true),
            stop: StopSignal::new(),
            workers: Mutex::new(Vec::new()),
            send_heartbeat: config.send_heartbeat,
            transport,
            sender,
            params,
            telemetry,
            listeners,
        }
    }

    /// Spawn the dispatcher, watchdog and latency threads.
    pub fn start(self: &Arc<Self>, config: &LinkConfig) -> io::Result<()> {
        match self.spawn_workers(config) {
            Ok(workers) => {
                *self.workers.lock().unwrap_or_else(|p| p.into_inner()) = workers;
                Ok(())
            }
            Err(e) => {
                // Whatever did start sees the stop and exits on its own.
                self.connected.store(false, Ordering::SeqCst);
                self.stop.trigger();
                Err(e)
            }
        }
    }

    fn spawn_workers(self: &Arc<Self>, config: &LinkConfig) -> io::Result<Vec<JoinHandle<()>>> {
        let mut workers = Vec::with_capacity(3);

        let s = self.clone();
        let stop = self.stop.token();
        let recv_timeout = config.recv_timeout();
        workers.push(
            std::thread::Builder::new()
                .name("mav-dispatch".into())
                .spawn(move || dispatcher::run(&s, &stop, recv_timeout))?,
        );

        let s = self.clone();
        workers.push(spawn_periodic("mav-watchdog", WATCHDOG_PERIOD, self.stop.token(), move |now| {
            s.watchdog_tick(now)
        })?);

        let s = self.clone();
        workers.push(spawn_periodic("mav-latency", config.latency_probe(), self.stop.token(), move |now| {
            s.probe_latency(now)
        })?);

        Ok(workers)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn target(&self) -> Target {
        self.sender.target()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            connected: self.is_connected(),
            last_heartbeat: self.watchdog.last_heartbeat(),
            ..self.info.clone()
        }
    }

    pub fn watchdog_tick(&self, now: Instant) {
        if self.watchdog.check(now) == Some(LivenessChange::Lost) {
            self.listeners.each(|l| l.on_heartbeat_lost());
        }
        if self.send_heartbeat {
            if let Err(e) = self.sender.send(&wire::gcs_heartbeat()) {
                debug!("gcs heartbeat not sent: {}", e);
            }
        }
        // Logged inside; the sync status reports it to callers.
        let _ = self.params.check_stall(now);
    }

    pub fn probe_latency(&self, now: Instant) {
        let ts1 = self.latency.new_probe(now);
        if let Err(e) = self.sender.send(&wire::timesync_request(ts1)) {
            debug!("latency probe not sent: {}", e);
        }
    }

    /// Read side died. Only the first caller does the teardown.
    pub fn link_failed(&self, reason: &str) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(transport = %self.info.transport, "link lost: {}", reason);
        self.stop.trigger();
        self.transport.close();
        self.commands.fail_all();
        self.listeners.each(|l| l.on_disconnected(reason));
    }

    /// Stop every worker, close the transport and release blocked callers.
    pub fn shutdown(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.stop.trigger();
        self.transport.close();
        self.commands.fail_all();
        self.join_workers();
        if was_connected {
            info!(transport = %self.info.transport, "disconnected");
            self.listeners.each(|l| l.on_disconnected("disconnect requested"));
        }
    }

    fn join_workers(&self) {
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|p| p.into_inner()));
        let me = std::thread::current().id();
        for h in workers {
            // A listener may call disconnect from one of our own threads.
            if h.thread().id() == me {
                continue;
            }
            let name = h.thread().name().unwrap_or("worker").to_string();
            if h.join().is_err() {
                warn!("{} panicked", name);
            }
        }
    }
}
