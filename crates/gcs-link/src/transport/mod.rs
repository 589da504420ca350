//! Byte-stream links to the flight controller.
//!
//! Every transport hands out already-framed MAVLink messages with a bounded
//! receive, so the single dispatcher thread can notice a stop request within
//! one receive timeout. Transports are shared between the reader and the
//! threads that send; they must never be read from two places.

pub mod mav;
pub mod memory;
pub mod ws;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use mavlink::common::MavMessage;
use mavlink::error::MessageReadError;
use mavlink::MavHeader;
use tracing::{debug, warn};

use crate::error::{ConnectError, TransportError};
use crate::target::ConnectTarget;

/// Inbound frames queued between a pump thread and the dispatcher.
const PUMP_QUEUE: usize = 1024;

const MAV_STX_V2: u8 = 0xFD;
/// STX, nine header bytes and the checksum.
const V2_FRAME_OVERHEAD: usize = 12;
const V2_SIGNATURE_LEN: usize = 13;
const V2_FLAG_SIGNED: u8 = 0x01;

#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub header: MavHeader,
    pub message: MavMessage,
    pub wire_len: usize,
    pub received_at: Instant,
}

impl InboundFrame {
    pub fn new(header: MavHeader, message: MavMessage) -> Self {
        let wire_len = crate::wire::estimate_wire_len(&message);
        Self { header, message, wire_len, received_at: Instant::now() }
    }
}

pub trait LinkTransport: Send + Sync {
    /// `Ok(None)` when nothing arrived within `timeout`.
    fn recv(&self, timeout: Duration) -> Result<Option<InboundFrame>, TransportError>;

    /// Returns the number of bytes written.
    fn send(&self, header: &MavHeader, message: &MavMessage) -> Result<usize, TransportError>;

    fn close(&self);

    fn describe(&self) -> String;
}

/// Open the transport matching `target`.
pub fn open(target: &ConnectTarget, open_timeout: Duration) -> Result<Arc<dyn LinkTransport>, ConnectError> {
    let failed = |reason: String| ConnectError::TransportOpenFailed { target: target.to_string(), reason };
    match target {
        ConnectTarget::WebSocket(url) => {
            let t = ws::WebSocketTransport::open(url, open_timeout).map_err(|e| failed(format!("{:#}", e)))?;
            Ok(Arc::new(t))
        }
        other => {
            let t = mav::MavlinkTransport::open(other, open_timeout).map_err(|e| failed(format!("{:#}", e)))?;
            Ok(Arc::new(t))
        }
    }
}

pub(crate) enum PumpItem {
    Frame(InboundFrame),
    Batch(Vec<InboundFrame>),
    Skip,
    Fatal(TransportError),
}

pub(crate) type Inbound = Receiver<Result<InboundFrame, TransportError>>;

/// Runs `read` on a dedicated thread and queues what it yields. The thread
/// ends after a fatal read or once every receiver is gone, dropping `read`
/// and whatever handles it owns.
pub(crate) fn spawn_pump<F>(name: &str, mut read: F) -> std::io::Result<(Inbound, JoinHandle<()>)>
where
    F: FnMut() -> PumpItem + Send + 'static,
{
    let (tx, rx) = crossbeam_channel::bounded(PUMP_QUEUE);
    let handle = std::thread::Builder::new()
        .name(format!("{}-pump", name))
        .spawn(move || pump_loop(&tx, &mut read))?;
    Ok((rx, handle))
}

fn pump_loop<F: FnMut() -> PumpItem>(tx: &Sender<Result<InboundFrame, TransportError>>, read: &mut F) {
    loop {
        let frames = match read() {
            PumpItem::Skip => continue,
            PumpItem::Frame(f) => vec![f],
            PumpItem::Batch(fs) => fs,
            PumpItem::Fatal(e) => {
                // never block here: close() joins this thread
                let _ = tx.try_send(Err(e));
                return;
            }
        };
        for frame in frames {
            match tx.try_send(Ok(frame)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => warn!("link pump queue full, dropping frame"),
                Err(TrySendError::Disconnected(_)) => {
                    debug!("link pump: reader gone");
                    return;
                }
            }
        }
    }
}

/// Bounded receive shared by the pump-backed transports.
pub(crate) fn recv_pumped(
    rx: &Inbound,
    timeout: Duration,
) -> Result<Option<InboundFrame>, TransportError> {
    match rx.recv_timeout(timeout) {
        Ok(Ok(frame)) => Ok(Some(frame)),
        Ok(Err(e)) => Err(e),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => Err(TransportError::Closed),
    }
}

/// Accumulates raw link bytes and cuts MAVLink v2 frames out of them.
/// Bytes before a start marker, frames with a bad checksum and frames for
/// unknown message ids are dropped; a trailing partial frame waits for more.
#[derive(Default)]
pub(crate) struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn drain_frames(&mut self) -> Vec<InboundFrame> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some(off) = self.buf[pos..].iter().position(|b| *b == MAV_STX_V2) {
            pos += off;
            let rest = &self.buf[pos..];
            if rest.len() < 3 {
                break;
            }
            let mut total = V2_FRAME_OVERHEAD + rest[1] as usize;
            if rest[2] & V2_FLAG_SIGNED != 0 {
                total += V2_SIGNATURE_LEN;
            }
            if rest.len() < total {
                break;
            }
            let mut frame = &rest[..total];
            match mavlink::read_v2_msg::<MavMessage, _>(&mut frame) {
                Ok((header, message)) => {
                    out.push(InboundFrame::new(header, message));
                    pos += total;
                }
                // checksum mismatch: the marker was payload, resync one byte on
                Err(MessageReadError::Io(_)) => pos += 1,
                Err(MessageReadError::Parse(e)) => {
                    debug!("link: dropping undecodable frame: {:?}", e);
                    pos += total;
                }
            }
        }
        if self.buf[pos..].iter().all(|b| *b != MAV_STX_V2) {
            pos = self.buf.len();
        }
        self.buf.drain(..pos);
        out
    }
}

/// Every complete frame in one self-contained chunk (a datagram or a
/// websocket message).
pub(crate) fn decode_frames(bytes: &[u8]) -> Vec<InboundFrame> {
    let mut framer = FrameBuffer::default();
    framer.extend(bytes);
    framer.drain_frames()
}

pub(crate) fn encode_frame(header: &MavHeader, message: &MavMessage) -> Result<Vec<u8>, TransportError> {
    let mut buf = Vec::with_capacity(280);
    mavlink::write_v2_msg(&mut buf, *header, message).map_err(|e| TransportError::Write(format!("{:?}", e)))?;
    Ok(buf)
}
