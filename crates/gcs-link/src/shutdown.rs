//! Stop signal shared by a session's worker threads.
//!
//! Nothing is ever sent on the channel; triggering drops the only sender, and
//! every [`StopToken`] observes the disconnection. A worker sleeping in
//! [`StopToken::wait`] wakes immediately instead of finishing its period.

use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::debug;

pub struct StopSignal {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

#[derive(Clone)]
pub struct StopToken {
    rx: Receiver<()>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        Self { tx: Mutex::new(Some(tx)), rx }
    }

    pub fn token(&self) -> StopToken {
        StopToken { rx: self.rx.clone() }
    }

    pub fn trigger(&self) {
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
    }
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `period` or until stopped. Returns true when stopped.
    pub fn wait(&self, period: Duration) -> bool {
        matches!(self.rx.recv_timeout(period), Err(RecvTimeoutError::Disconnected))
    }
}

/// Run `tick` every `period` on a named thread until `stop` fires.
pub fn spawn_periodic<F>(name: &str, period: Duration, stop: StopToken, mut tick: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut(Instant) + Send + 'static,
{
    let thread_name = name.to_string();
    std::thread::Builder::new().name(thread_name.clone()).spawn(move || {
        while !stop.wait(period) {
            tick(Instant::now());
        }
        debug!("{} stopped", thread_name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn trigger_wakes_waiters_promptly() {
        let signal = StopSignal::new();
        let token = signal.token();
        assert!(!token.is_stopped());

        let h = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = token.wait(Duration::from_secs(30));
            (stopped, start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(20));
        signal.trigger();
        let (stopped, waited) = h.join().unwrap();
        assert!(stopped);
        assert!(waited < Duration::from_secs(5));
        assert!(signal.token().is_stopped());
    }

    #[test]
    fn periodic_task_ticks_until_stopped() {
        let signal = StopSignal::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let h = spawn_periodic("ticker", Duration::from_millis(5), signal.token(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        signal.trigger();
        h.join().unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
