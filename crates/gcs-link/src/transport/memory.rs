//! In-process link pair. The [`MemoryPeer`] end plays the flight controller
//! in tests and simulations.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mavlink::common::MavMessage;
use mavlink::MavHeader;

use super::{InboundFrame, LinkTransport};
use crate::error::TransportError;

enum Wire {
    Frame(MavHeader, MavMessage),
    Fail,
}

pub struct MemoryTransport {
    inbound: Receiver<Wire>,
    outbound: Sender<(MavHeader, MavMessage)>,
    closed: AtomicBool,
}

pub struct MemoryPeer {
    to_gcs: Sender<Wire>,
    from_gcs: Receiver<(MavHeader, MavMessage)>,
}

/// Create a connected transport/peer pair.
pub fn memory_link() -> (MemoryTransport, MemoryPeer) {
    let (to_gcs, inbound) = crossbeam_channel::unbounded();
    let (outbound, from_gcs) = crossbeam_channel::unbounded();
    (
        MemoryTransport { inbound, outbound, closed: AtomicBool::new(false) },
        MemoryPeer { to_gcs, from_gcs },
    )
}

impl LinkTransport for MemoryTransport {
    fn recv(&self, timeout: Duration) -> Result<Option<InboundFrame>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match self.inbound.recv_timeout(timeout) {
            Ok(Wire::Frame(h, m)) => Ok(Some(InboundFrame::new(h, m))),
            Ok(Wire::Fail) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "peer reset the link",
            ))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
        }
    }

    fn send(&self, header: &MavHeader, message: &MavMessage) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.outbound.send((*header, message.clone())).map_err(|_| TransportError::Closed)?;
        Ok(crate::wire::estimate_wire_len(message))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

impl MemoryPeer {
    /// Deliver `message` to the ground station as if sent by `(system, component)`.
    pub fn send(&self, system_id: u8, component_id: u8, message: MavMessage) -> bool {
        let header = MavHeader { system_id, component_id, sequence: 0 };
        self.to_gcs.send(Wire::Frame(header, message)).is_ok()
    }

    /// Make the ground station's next receive fail with an i/o error.
    pub fn fail(&self) {
        let _ = self.to_gcs.send(Wire::Fail);
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<(MavHeader, MavMessage)> {
        self.from_gcs.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<(MavHeader, MavMessage)> {
        self.from_gcs.try_recv().ok()
    }
}
