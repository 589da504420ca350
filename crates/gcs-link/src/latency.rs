//! TIMESYNC round-trip measurement.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use gcs_proto::telemetry::LatencyStats;
use tracing::trace;

pub const WINDOW: usize = 60;
/// Probes we still accept a reply for.
const OUTSTANDING: usize = 8;
const MAX_RTT_MS: f64 = 10_000.0;

struct Window {
    outstanding: VecDeque<i64>,
    samples: VecDeque<f64>,
}

pub struct LatencyMonitor {
    anchor: Instant,
    window: Mutex<Window>,
}

impl Default for LatencyMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyMonitor {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            window: Mutex::new(Window {
                outstanding: VecDeque::with_capacity(OUTSTANDING),
                samples: VecDeque::with_capacity(WINDOW),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn clock_ns(&self, at: Instant) -> i64 {
        // Never zero: tc1/ts1 of zero mean "unset" on the wire.
        (at.saturating_duration_since(self.anchor).as_nanos() as i64).max(1)
    }

    /// Register a probe sent at `at` and return the `ts1` to put in it.
    pub fn new_probe(&self, at: Instant) -> i64 {
        let ts1 = self.clock_ns(at);
        let mut w = self.lock();
        if w.outstanding.len() == OUTSTANDING {
            w.outstanding.pop_front();
        }
        w.outstanding.push_back(ts1);
        ts1
    }

    /// Feed a TIMESYNC frame. Returns the RTT when it answers one of our probes
    /// and the sample was within bounds.
    pub fn on_timesync(&self, tc1: i64, ts1: i64, now: Instant) -> Option<f64> {
        if tc1 == 0 {
            // The peer is probing us.
            return None;
        }
        let mut w = self.lock();
        let pos = w.outstanding.iter().position(|t| *t == ts1)?;
        w.outstanding.remove(pos);

        let rtt_ms = (self.clock_ns(now) - ts1) as f64 / 1e6;
        if !(rtt_ms > 0.0 && rtt_ms < MAX_RTT_MS) {
            trace!(rtt_ms, "latency: discarding out-of-range sample");
            return None;
        }
        if w.samples.len() == WINDOW {
            w.samples.pop_front();
        }
        w.samples.push_back(rtt_ms);
        Some(rtt_ms)
    }

    pub fn stats(&self) -> LatencyStats {
        let w = self.lock();
        let Some(&current_ms) = w.samples.back() else {
            return LatencyStats::default();
        };
        let n = w.samples.len();
        let sum: f64 = w.samples.iter().sum();
        let min_ms = w.samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max_ms = w.samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        LatencyStats { current_ms, avg_ms: sum / n as f64, min_ms, max_ms, samples: n }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn answered(m: &LatencyMonitor, rtt_ms: u64) {
        let sent = m.anchor + Duration::from_secs(1);
        let ts1 = m.new_probe(sent);
        m.on_timesync(1, ts1, sent + Duration::from_millis(rtt_ms)).expect("in-range sample");
    }

    #[test]
    fn empty_window_reports_zeros() {
        assert_eq!(LatencyMonitor::new().stats(), LatencyStats::default());
    }

    #[test]
    fn stats_over_samples() {
        let m = LatencyMonitor::new();
        for ms in [10, 20, 30] {
            answered(&m, ms);
        }
        let s = m.stats();
        assert_eq!(s.current_ms, 30.0);
        assert_eq!(s.avg_ms, 20.0);
        assert_eq!(s.min_ms, 10.0);
        assert_eq!(s.max_ms, 30.0);
        assert_eq!(s.samples, 3);
    }

    #[test]
    fn matching_reply_yields_rtt() {
        let m = LatencyMonitor::new();
        let sent = Instant::now();
        let ts1 = m.new_probe(sent);
        let rtt = m.on_timesync(42, ts1, sent + Duration::from_millis(35)).expect("sample");
        assert!((rtt - 35.0).abs() < 0.01);
        // Answered once; a duplicate reply is ignored.
        assert_eq!(m.on_timesync(42, ts1, sent + Duration::from_millis(50)), None);
    }

    #[test]
    fn requests_and_strangers_are_ignored() {
        let m = LatencyMonitor::new();
        let ts1 = m.new_probe(Instant::now());
        assert_eq!(m.on_timesync(0, ts1, Instant::now()), None);
        assert_eq!(m.on_timesync(7, ts1 + 1, Instant::now()), None);
        assert_eq!(m.stats().samples, 0);
    }

    #[test]
    fn out_of_range_rtt_is_discarded() {
        let m = LatencyMonitor::new();
        let sent = Instant::now();
        let ts1 = m.new_probe(sent);
        assert_eq!(m.on_timesync(1, ts1, sent + Duration::from_secs(11)), None);
        assert_eq!(m.stats().samples, 0);
    }

    #[test]
    fn window_keeps_last_sixty() {
        let m = LatencyMonitor::new();
        for ms in 1..=100u64 {
            answered(&m, ms);
        }
        let s = m.stats();
        assert_eq!(s.samples, WINDOW);
        assert_eq!(s.min_ms, 41.0);
    }
}
