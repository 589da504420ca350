//! COMMAND_LONG with acknowledgement.
//!
//! Every caller waiting on a command id hangs off one "flight" for that id.
//! Only the ACK or a disconnect settles a flight; it then wakes everyone with
//! `notify_all`, so callers still waiting read the same outcome. A caller
//! whose own deadline passes leaves the flight alone and the rest keep
//! waiting. A settled outcome is dropped after its last reader has taken it.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use mavlink::common::{MavCmd, MavResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CommandError;
use crate::outbound::LinkSender;
use crate::wire;

/// Commands callers may address by name.
pub const COMMANDS: &[(&str, MavCmd)] = &[
    ("MAV_CMD_COMPONENT_ARM_DISARM", MavCmd::MAV_CMD_COMPONENT_ARM_DISARM),
    ("MAV_CMD_NAV_TAKEOFF", MavCmd::MAV_CMD_NAV_TAKEOFF),
    ("MAV_CMD_NAV_LAND", MavCmd::MAV_CMD_NAV_LAND),
    ("MAV_CMD_NAV_RETURN_TO_LAUNCH", MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH),
    ("MAV_CMD_NAV_LOITER_UNLIM", MavCmd::MAV_CMD_NAV_LOITER_UNLIM),
    ("MAV_CMD_DO_SET_MODE", MavCmd::MAV_CMD_DO_SET_MODE),
    ("MAV_CMD_DO_CHANGE_SPEED", MavCmd::MAV_CMD_DO_CHANGE_SPEED),
    ("MAV_CMD_DO_SET_HOME", MavCmd::MAV_CMD_DO_SET_HOME),
    ("MAV_CMD_DO_MOTOR_TEST", MavCmd::MAV_CMD_DO_MOTOR_TEST),
    ("MAV_CMD_PREFLIGHT_CALIBRATION", MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION),
    ("MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN", MavCmd::MAV_CMD_PREFLIGHT_REBOOT_SHUTDOWN),
    ("MAV_CMD_REQUEST_MESSAGE", MavCmd::MAV_CMD_REQUEST_MESSAGE),
    ("MAV_CMD_SET_MESSAGE_INTERVAL", MavCmd::MAV_CMD_SET_MESSAGE_INTERVAL),
];

/// Resolve a command name; the `MAV_CMD_` prefix is optional.
pub fn lookup(name: &str) -> Option<MavCmd> {
    let name = name.trim();
    COMMANDS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name) || n["MAV_CMD_".len()..].eq_ignore_ascii_case(name))
        .map(|(_, c)| *c)
}

/// Non-failure ACK results. The vehicle heard the command and is acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    TemporarilyRejected,
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Ok(AckStatus),
    Rejected(String),
    TimedOut,
}

impl From<MavResult> for Outcome {
    fn from(r: MavResult) -> Self {
        match r {
            MavResult::MAV_RESULT_ACCEPTED => Outcome::Ok(AckStatus::Accepted),
            MavResult::MAV_RESULT_TEMPORARILY_REJECTED => Outcome::Ok(AckStatus::TemporarilyRejected),
            MavResult::MAV_RESULT_IN_PROGRESS => Outcome::Ok(AckStatus::InProgress),
            other => Outcome::Rejected(result_name(other)),
        }
    }
}

impl From<Outcome> for Result<AckStatus, CommandError> {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Ok(s) => Ok(s),
            Outcome::Rejected(reason) => Err(CommandError::Rejected(reason)),
            Outcome::TimedOut => Err(CommandError::TimedOut),
        }
    }
}

/// `MAV_RESULT_DENIED` -> `DENIED`
fn result_name(r: MavResult) -> String {
    let full = format!("{:?}", r);
    full.strip_prefix("MAV_RESULT_").unwrap_or(&full).to_string()
}

struct Flight {
    ticket: u64,
    waiters: usize,
    issued_at: Instant,
}

struct Settled {
    outcome: Outcome,
    unread: usize,
}

#[derive(Default)]
struct AckBook {
    in_flight: HashMap<u32, Flight>,
    settled: HashMap<u64, Settled>,
    next_ticket: u64,
}

impl AckBook {
    /// Join the open flight for `command_id`, or open one. Returns its ticket.
    fn join(&mut self, command_id: u32) -> u64 {
        let next = self.next_ticket;
        let flight = self.in_flight.entry(command_id).or_insert(Flight { ticket: next, waiters: 0, issued_at: Instant::now() });
        flight.waiters += 1;
        let ticket = flight.ticket;
        if ticket == next {
            self.next_ticket += 1;
        }
        ticket
    }

    /// Settle the open flight for everyone waiting on it.
    fn settle(&mut self, command_id: u32, outcome: Outcome) -> bool {
        match self.in_flight.remove(&command_id) {
            Some(f) => {
                self.settled.insert(f.ticket, Settled { outcome, unread: f.waiters });
                true
            }
            None => false,
        }
    }

    /// Read the outcome of `ticket` if it is settled. The last reader removes it.
    fn take_outcome(&mut self, ticket: u64) -> Option<Outcome> {
        let s = self.settled.get_mut(&ticket)?;
        let outcome = s.outcome.clone();
        s.unread -= 1;
        if s.unread == 0 {
            self.settled.remove(&ticket);
        }
        Some(outcome)
    }

    /// Give up one waiter's place without reading: leave the open flight, or
    /// forfeit the read of an outcome that already settled.
    fn leave(&mut self, command_id: u32, ticket: u64) {
        let open = match self.in_flight.get_mut(&command_id) {
            Some(f) if f.ticket == ticket => {
                f.waiters -= 1;
                Some(f.waiters == 0)
            }
            _ => None,
        };
        match open {
            Some(true) => {
                self.in_flight.remove(&command_id);
            }
            Some(false) => {}
            None => {
                let drained = match self.settled.get_mut(&ticket) {
                    Some(s) => {
                        s.unread -= 1;
                        s.unread == 0
                    }
                    None => false,
                };
                if drained {
                    self.settled.remove(&ticket);
                }
            }
        }
    }
}

pub struct CommandAckCoordinator {
    sender: Arc<LinkSender>,
    book: Mutex<AckBook>,
    settled_cv: Condvar,
}

impl CommandAckCoordinator {
    pub fn new(sender: Arc<LinkSender>) -> Self {
        Self { sender, book: Mutex::new(AckBook::default()), settled_cv: Condvar::new() }
    }

    fn lock(&self) -> MutexGuard<'_, AckBook> {
        self.book.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Send the named command and block until it is acknowledged or `timeout` passes.
    pub fn send_and_wait(&self, name: &str, params: [f32; 7], timeout: Duration) -> Result<AckStatus, CommandError> {
        let command = lookup(name).ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        self.send_command_and_wait(command, params, timeout)
    }

    /// Callers on the same command share its ACK. Each caller's `timeout`
    /// only ends its own wait.
    pub fn send_command_and_wait(
        &self,
        command: MavCmd,
        params: [f32; 7],
        timeout: Duration,
    ) -> Result<AckStatus, CommandError> {
        let id = command as u32;
        let deadline = Instant::now() + timeout;
        let ticket = self.lock().join(id);

        if let Err(e) = self.sender.send(&wire::command_long(self.sender.target(), command, params)) {
            self.lock().leave(id, ticket);
            return Err(e.into());
        }
        info!("command: sent {:?}", command);

        let outcome = self.wait(id, ticket, deadline);
        if outcome == Outcome::TimedOut {
            warn!("command: {:?} timed out after {:?}", command, timeout);
        }
        outcome.into()
    }

    fn wait(&self, id: u32, ticket: u64, deadline: Instant) -> Outcome {
        let mut book = self.lock();
        loop {
            if let Some(outcome) = book.take_outcome(ticket) {
                return outcome;
            }

            let now = Instant::now();
            if now >= deadline {
                book.leave(id, ticket);
                return Outcome::TimedOut;
            }

            book = self
                .settled_cv
                .wait_timeout(book, deadline - now)
                .unwrap_or_else(|p| p.into_inner())
                .0;
        }
    }

    /// Called by the dispatcher for every COMMAND_ACK.
    pub fn resolve(&self, command_id: u32, result: MavResult) -> bool {
        let mut book = self.lock();
        let elapsed = book.in_flight.get(&command_id).map(|f| f.issued_at.elapsed());
        if book.settle(command_id, Outcome::from(result)) {
            self.settled_cv.notify_all();
            debug!("command: ack {} {:?} after {:?}", command_id, result, elapsed.unwrap_or_default());
            true
        } else {
            debug!("command: unsolicited ack {} {:?}", command_id, result);
            false
        }
    }

    /// Release every waiter with `TimedOut`. Used when the link goes away.
    pub fn fail_all(&self) {
        let mut book = self.lock();
        let ids: Vec<u32> = book.in_flight.keys().copied().collect();
        for id in &ids {
            book.settle(*id, Outcome::TimedOut);
        }
        self.settled_cv.notify_all();
        if !ids.is_empty() {
            info!("command: released {} pending command(s)", ids.len());
        }
    }

    /// Flights plus settled outcomes not yet read by every waiter.
    pub fn outstanding(&self) -> usize {
        let book = self.lock();
        book.in_flight.len() + book.settled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TelemetryBufferStore;
    use crate::transport::memory::{memory_link, MemoryPeer};
    use crate::wire::Target;
    use mavlink::common::MavMessage;
    use std::thread;

    fn coordinator() -> (Arc<CommandAckCoordinator>, MemoryPeer) {
        let (transport, peer) = memory_link();
        let sender =
            LinkSender::new(Arc::new(transport), 255, 190, Target::new(1, 1), Arc::new(TelemetryBufferStore::new()));
        (Arc::new(CommandAckCoordinator::new(Arc::new(sender))), peer)
    }

    const ARM: u32 = MavCmd::MAV_CMD_COMPONENT_ARM_DISARM as u32;

    fn wait_for_flight(c: &CommandAckCoordinator) {
        let until = Instant::now() + Duration::from_secs(2);
        while c.outstanding() == 0 && Instant::now() < until {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn names_resolve_with_or_without_prefix() {
        assert_eq!(lookup("MAV_CMD_NAV_LAND"), Some(MavCmd::MAV_CMD_NAV_LAND));
        assert_eq!(lookup("nav_return_to_launch"), Some(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH));
        assert_eq!(lookup("MAV_CMD_FLIP"), None);
    }

    #[test]
    fn unknown_name_sends_nothing() {
        let (c, peer) = coordinator();
        let err = c.send_and_wait("MAV_CMD_DO_BARREL_ROLL", [0.0; 7], Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(_)));
        assert!(peer.try_recv().is_none());
    }

    #[test]
    fn accepted_ack_releases_caller() {
        let (c, peer) = coordinator();
        let c2 = c.clone();
        let h = thread::spawn(move || {
            c2.send_and_wait("MAV_CMD_COMPONENT_ARM_DISARM", [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0], Duration::from_secs(2))
        });

        let (_, msg) = peer.recv_timeout(Duration::from_secs(1)).expect("command on the wire");
        let MavMessage::COMMAND_LONG(cmd) = msg else { panic!("expected COMMAND_LONG") };
        assert_eq!(cmd.param1, 1.0);
        assert!(c.resolve(ARM, MavResult::MAV_RESULT_ACCEPTED));

        assert_eq!(h.join().unwrap().unwrap(), AckStatus::Accepted);
        assert_eq!(c.outstanding(), 0);
    }

    #[test]
    fn denied_ack_is_rejected_with_reason() {
        let (c, peer) = coordinator();
        let c2 = c.clone();
        let h = thread::spawn(move || c2.send_and_wait("MAV_CMD_NAV_TAKEOFF", [0.0; 7], Duration::from_secs(2)));
        peer.recv_timeout(Duration::from_secs(1)).expect("command on the wire");
        c.resolve(MavCmd::MAV_CMD_NAV_TAKEOFF as u32, MavResult::MAV_RESULT_DENIED);

        match h.join().unwrap() {
            Err(CommandError::Rejected(reason)) => assert_eq!(reason, "DENIED"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn no_ack_times_out_near_deadline() {
        let (c, _peer) = coordinator();
        let start = Instant::now();
        let err = c.send_and_wait("MAV_CMD_NAV_LAND", [0.0; 7], Duration::from_millis(200)).unwrap_err();
        let waited = start.elapsed();
        assert!(matches!(err, CommandError::TimedOut));
        assert!(waited >= Duration::from_millis(200));
        assert!(waited < Duration::from_millis(700), "waited {:?}", waited);
        assert_eq!(c.outstanding(), 0);
    }

    #[test]
    fn short_timeout_leaves_longer_waiter_in_flight() {
        let (c, peer) = coordinator();
        let land = MavCmd::MAV_CMD_NAV_LAND as u32;
        let quick = {
            let c = c.clone();
            thread::spawn(move || c.send_and_wait("MAV_CMD_NAV_LAND", [0.0; 7], Duration::from_millis(200)))
        };
        peer.recv_timeout(Duration::from_secs(1)).expect("first command on the wire");
        let patient = {
            let c = c.clone();
            thread::spawn(move || c.send_and_wait("MAV_CMD_NAV_LAND", [0.0; 7], Duration::from_secs(5)))
        };
        peer.recv_timeout(Duration::from_secs(1)).expect("second command on the wire");

        assert!(matches!(quick.join().unwrap(), Err(CommandError::TimedOut)));
        thread::sleep(Duration::from_millis(200));
        assert!(c.resolve(land, MavResult::MAV_RESULT_ACCEPTED), "flight must still be open");
        assert_eq!(patient.join().unwrap().unwrap(), AckStatus::Accepted);
        assert_eq!(c.outstanding(), 0);
    }

    #[test]
    fn leaving_after_settle_forfeits_the_read() {
        let mut book = AckBook::default();
        let first = book.join(ARM);
        let joiner = book.join(ARM);
        assert_eq!(first, joiner);
        assert!(book.settle(ARM, Outcome::Ok(AckStatus::Accepted)));

        assert_eq!(book.take_outcome(first), Some(Outcome::Ok(AckStatus::Accepted)));
        // The joiner's send failed after the ACK landed.
        book.leave(ARM, joiner);
        assert!(book.settled.is_empty());
        assert!(book.in_flight.is_empty());
    }

    #[test]
    fn fail_all_releases_waiters() {
        let (c, _peer) = coordinator();
        let c2 = c.clone();
        let h = thread::spawn(move || c2.send_and_wait("MAV_CMD_NAV_LAND", [0.0; 7], Duration::from_secs(30)));
        wait_for_flight(&c);
        c.fail_all();
        assert!(matches!(h.join().unwrap(), Err(CommandError::TimedOut)));
    }

    #[test]
    fn unsolicited_ack_is_ignored() {
        let (c, _peer) = coordinator();
        assert!(!c.resolve(ARM, MavResult::MAV_RESULT_ACCEPTED));
        assert_eq!(c.outstanding(), 0);
    }

    #[test]
    fn send_failure_leaves_no_flight() {
        let (c, peer) = coordinator();
        drop(peer);
        let err = c.send_and_wait("MAV_CMD_NAV_LAND", [0.0; 7], Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CommandError::Send(_)));
        assert_eq!(c.outstanding(), 0);
    }
}
