use anyhow::Result;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::manager::wait_for_heartbeat;
use crate::target::ConnectTarget;
use crate::transport;
use crate::LinkConfig;

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub dev: String,
    pub baud: u32,
    pub hb_seen: bool,
    pub elapsed_ms: u64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutodetectResult {
    pub chosen: Option<(String, u32)>,
    pub probes: Vec<ProbeResult>,
}

impl AutodetectResult {
    pub fn target(&self) -> Option<ConnectTarget> {
        self.chosen.as_ref().map(|(device, baud)| ConnectTarget::Serial { device: device.clone(), baud: *baud })
    }
}

pub fn default_candidate_devs() -> Vec<String> {
    vec![
        "/dev/serial0".into(),
        "/dev/ttyAMA0".into(),
        "/dev/ttyS0".into(),
        "/dev/ttyUSB0".into(),
        "/dev/ttyUSB1".into(),
        "/dev/ttyACM0".into(),
        "/dev/ttyACM1".into(),
    ]
}

pub fn default_candidate_bauds() -> Vec<u32> {
    vec![57600, 115200, 230400, 921600]
}

/// Configured candidates, else whatever the OS enumerates, else the usual suspects.
pub fn candidate_devs(config: &LinkConfig) -> Vec<String> {
    if let Some(devs) = config.candidate_devs.as_ref().filter(|d| !d.is_empty()) {
        return devs.clone();
    }
    match tokio_serial::available_ports() {
        Ok(ports) if !ports.is_empty() => ports.into_iter().map(|p| p.port_name).collect(),
        Ok(_) => default_candidate_devs(),
        Err(e) => {
            debug!("serial port enumeration failed: {}", e);
            default_candidate_devs()
        }
    }
}

/// Probe every device/baud pair for a vehicle heartbeat; stop at the first hit.
pub fn autodetect_fc(config: &LinkConfig, probe_timeout: Duration) -> Result<AutodetectResult> {
    let devs = candidate_devs(config);
    let bauds = config.candidate_bauds.clone().filter(|b| !b.is_empty()).unwrap_or_else(default_candidate_bauds);
    anyhow::ensure!(!devs.is_empty(), "no candidate serial devices");

    let probe_config = LinkConfig { connect_timeout_ms: probe_timeout.as_millis() as u64, ..config.clone() };
    let mut probes = Vec::new();

    for dev in devs {
        for baud in &bauds {
            let start = Instant::now();
            let target = ConnectTarget::Serial { device: dev.clone(), baud: *baud };

            let (hb_seen, note) = match transport::open(&target, probe_timeout) {
                Ok(link) => {
                    let outcome = wait_for_heartbeat(link.as_ref(), &probe_config);
                    link.close();
                    match outcome {
                        Ok(frame) => (true, format!("heartbeat from sys {}", frame.header.system_id)),
                        Err(e) => (false, e.to_string()),
                    }
                }
                Err(e) => {
                    warn!("fc autodetect probe failed dev={} baud={} err={}", dev, baud, e);
                    (false, format!("open failed: {}", e))
                }
            };

            probes.push(ProbeResult {
                dev: dev.clone(),
                baud: *baud,
                hb_seen,
                elapsed_ms: start.elapsed().as_millis() as u64,
                note,
            });

            if hb_seen {
                info!("fc autodetect: OK {} @ {}", dev, baud);
                return Ok(AutodetectResult { chosen: Some((dev, *baud)), probes });
            }
        }
    }

    Ok(AutodetectResult { chosen: None, probes })
}
