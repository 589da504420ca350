//! Recent-traffic store shared by the dispatcher (writer) and any number of
//! telemetry consumers polling at their own rate.
//!
//! The writer appends to a bounded ring under one mutex. A snapshot copies the
//! ring under that mutex and folds it into "latest per message type" after
//! releasing it, so a slow consumer never holds the writer up for longer than
//! a plain copy.

pub mod views;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use gcs_proto::telemetry::LinkStats;
use mavlink::common::MavMessage;
use mavlink::MavHeader;

use crate::transport::InboundFrame;

pub const RING_CAPACITY: usize = 100;
pub const OUTBOUND_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub name: &'static str,
    pub header: MavHeader,
    pub message: MavMessage,
    pub received_at: Instant,
}

impl From<&InboundFrame> for RawMessage {
    fn from(f: &InboundFrame) -> Self {
        use mavlink::Message;
        Self { name: f.message.message_name(), header: f.header, message: f.message.clone(), received_at: f.received_at }
    }
}

struct Ring {
    buf: VecDeque<RawMessage>,
    packets: u64,
    bytes: u64,
    window_start: Instant,
}

pub struct TelemetryBufferStore {
    ring: Mutex<Ring>,
    outbound: Mutex<VecDeque<&'static str>>,
}

impl Default for TelemetryBufferStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBufferStore {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(Ring {
                buf: VecDeque::with_capacity(RING_CAPACITY),
                packets: 0,
                bytes: 0,
                window_start: Instant::now(),
            }),
            outbound: Mutex::new(VecDeque::with_capacity(OUTBOUND_LOG_CAPACITY)),
        }
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&self, msg: RawMessage) {
        let mut ring = self.lock_ring();
        if ring.buf.len() == RING_CAPACITY {
            ring.buf.pop_front();
        }
        ring.buf.push_back(msg);
    }

    /// Account one inbound frame for the rate counters, buffered or not.
    pub fn count_inbound(&self, wire_len: usize) {
        let mut ring = self.lock_ring();
        ring.packets += 1;
        ring.bytes += wire_len as u64;
    }

    pub fn len(&self) -> usize {
        self.lock_ring().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let copied: Vec<RawMessage> = {
            let ring = self.lock_ring();
            ring.buf.iter().cloned().collect()
        };

        let mut latest = BTreeMap::new();
        for m in copied {
            latest.insert(m.name, m);
        }
        TelemetrySnapshot { latest, taken_at: Instant::now() }
    }

    /// Rates since the previous call; the counters restart at zero.
    pub fn link_stats(&self) -> LinkStats {
        self.link_stats_at(Instant::now())
    }

    pub fn link_stats_at(&self, now: Instant) -> LinkStats {
        let mut ring = self.lock_ring();
        let elapsed = now.saturating_duration_since(ring.window_start).as_secs_f64();
        let stats = if elapsed > 0.0 {
            LinkStats { packets_per_sec: ring.packets as f64 / elapsed, bytes_per_sec: ring.bytes as f64 / elapsed }
        } else {
            LinkStats::default()
        };
        ring.packets = 0;
        ring.bytes = 0;
        ring.window_start = now;
        stats
    }

    pub fn record_outbound(&self, name: &'static str) {
        let mut log = self.outbound.lock().unwrap_or_else(|p| p.into_inner());
        if log.len() == OUTBOUND_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(name);
    }

    /// Names of the most recent outbound frames, oldest first.
    pub fn outbound_log(&self) -> Vec<&'static str> {
        self.outbound.lock().unwrap_or_else(|p| p.into_inner()).iter().copied().collect()
    }

    fn lock_ring(&self) -> std::sync::MutexGuard<'_, Ring> {
        // A panicking consumer must not take telemetry down with it.
        self.ring.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Latest message of each type, as of one point-in-time copy of the ring.
#[derive(Debug, Clone)]
pub struct TelemetrySnapshot {
    latest: BTreeMap<&'static str, RawMessage>,
    taken_at: Instant,
}

impl TelemetrySnapshot {
    pub fn empty() -> Self {
        Self { latest: BTreeMap::new(), taken_at: Instant::now() }
    }

    pub fn get(&self, name: &str) -> Option<&MavMessage> {
        self.latest.get(name).map(|m| &m.message)
    }

    pub fn entry(&self, name: &str) -> Option<&RawMessage> {
        self.latest.get(name)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.latest.keys().copied()
    }

    pub fn taken_at(&self) -> Instant {
        self.taken_at
    }

    /// `{ "ATTITUDE": {...}, "HEARTBEAT": {...} }`
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, raw) in &self.latest {
            let v = serde_json::to_value(&raw.message).unwrap_or(serde_json::Value::Null);
            map.insert((*name).to_string(), v);
        }
        serde_json::Value::Object(map)
    }
}
