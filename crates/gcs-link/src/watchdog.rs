use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Transition reported by a watchdog check or a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessChange {
    Lost,
    Restored,
}

struct Liveness {
    last_heartbeat: Instant,
    timed_out: bool,
}

/// Edge-triggered heartbeat timeout: `Lost` is reported once per outage and
/// `Restored` once when the next heartbeat shows up.
pub struct HeartbeatWatchdog {
    timeout: Duration,
    state: Mutex<Liveness>,
}

impl HeartbeatWatchdog {
    pub fn new(timeout: Duration, first_heartbeat: Instant) -> Self {
        Self { timeout, state: Mutex::new(Liveness { last_heartbeat: first_heartbeat, timed_out: false }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Liveness> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn on_heartbeat(&self, at: Instant) -> Option<LivenessChange> {
        let mut s = self.lock();
        s.last_heartbeat = s.last_heartbeat.max(at);
        if std::mem::replace(&mut s.timed_out, false) {
            info!("heartbeat restored");
            Some(LivenessChange::Restored)
        } else {
            None
        }
    }

    pub fn check(&self, now: Instant) -> Option<LivenessChange> {
        let mut s = self.lock();
        let age = now.saturating_duration_since(s.last_heartbeat);
        if age > self.timeout && !s.timed_out {
            s.timed_out = true;
            warn!(age_ms = age.as_millis() as u64, "heartbeat lost");
            Some(LivenessChange::Lost)
        } else {
            None
        }
    }

    pub fn is_timed_out(&self) -> bool {
        self.lock().timed_out
    }

    pub fn last_heartbeat(&self) -> Instant {
        self.lock().last_heartbeat
    }
}
