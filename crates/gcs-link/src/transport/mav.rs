use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use mavlink::common::MavMessage;
use mavlink::MavHeader;
use tracing::{debug, info, warn};

use super::{decode_frames, encode_frame, recv_pumped, spawn_pump, FrameBuffer, Inbound, InboundFrame, LinkTransport, PumpItem};
use crate::error::TransportError;
use crate::target::ConnectTarget;

/// How long the pump blocks in one read before checking for close.
const READ_SLICE: Duration = Duration::from_millis(50);
const ACCEPT_POLL: Duration = Duration::from_millis(20);
const UDP_DATAGRAM_MAX: usize = 65_535;
const STREAM_CHUNK: usize = 4096;

type PeerSlot = Arc<Mutex<Option<SocketAddr>>>;

enum LinkReader {
    /// `learn_peer` replies to whoever sent the latest datagram (`udpin`).
    Udp { socket: Arc<UdpSocket>, peer: PeerSlot, learn_peer: bool },
    Stream { io: Box<dyn Read + Send>, framer: FrameBuffer },
}

enum LinkWriter {
    Udp { socket: Arc<UdpSocket>, peer: PeerSlot },
    Stream(Box<dyn Write + Send>),
}

/// Serial/UDP/TCP link framed with the `mavlink` codec. The transport owns
/// the sockets or port so `close` releases them before it returns.
pub struct MavlinkTransport {
    writer: Mutex<Option<LinkWriter>>,
    inbound: Inbound,
    pump: Mutex<Option<JoinHandle<()>>>,
    address: String,
    closed: Arc<AtomicBool>,
}

impl MavlinkTransport {
    pub fn open(target: &ConnectTarget, open_timeout: Duration) -> Result<Self> {
        let address = target.to_string();
        let (mut reader, writer) = match target {
            ConnectTarget::UdpIn(addr) => {
                let socket = UdpSocket::bind(addr).with_context(|| format!("bind udp {}", addr))?;
                udp_pair(socket, None, true)?
            }
            ConnectTarget::UdpOut(addr) => {
                let dest = resolve(addr)?;
                let socket = UdpSocket::bind("0.0.0.0:0").context("bind udp client socket")?;
                udp_pair(socket, Some(dest), false)?
            }
            ConnectTarget::TcpOut(addr) => {
                let dest = resolve(addr)?;
                let stream =
                    TcpStream::connect_timeout(&dest, open_timeout).with_context(|| format!("tcp connect {}", dest))?;
                tcp_pair(stream)?
            }
            ConnectTarget::TcpIn(addr) => {
                let stream = accept_one(addr, open_timeout)?;
                tcp_pair(stream)?
            }
            ConnectTarget::Serial { device, baud } => {
                let port = tokio_serial::new(device, *baud)
                    .timeout(READ_SLICE)
                    .open()
                    .with_context(|| format!("open serial device {}", device))?;
                let writer = port.try_clone().with_context(|| format!("clone serial handle {}", device))?;
                (
                    LinkReader::Stream { io: Box::new(port), framer: FrameBuffer::default() },
                    LinkWriter::Stream(Box::new(writer)),
                )
            }
            ConnectTarget::WebSocket(url) => return Err(anyhow!("{} needs the websocket transport", url)),
        };

        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = closed.clone();
        let (inbound, pump) = spawn_pump("mavlink", move || {
            if reader_closed.load(Ordering::Acquire) {
                return PumpItem::Fatal(TransportError::Closed);
            }
            reader.read_some()
        })
        .context("spawn link pump")?;

        info!("link: opened {}", address);
        Ok(Self {
            writer: Mutex::new(Some(writer)),
            inbound,
            pump: Mutex::new(Some(pump)),
            address,
            closed,
        })
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("resolve {}", addr))?
        .next()
        .ok_or_else(|| anyhow!("no address for {}", addr))
}

fn udp_pair(socket: UdpSocket, dest: Option<SocketAddr>, learn_peer: bool) -> Result<(LinkReader, LinkWriter)> {
    socket.set_read_timeout(Some(READ_SLICE)).context("set udp read timeout")?;
    let socket = Arc::new(socket);
    let peer: PeerSlot = Arc::new(Mutex::new(dest));
    Ok((
        LinkReader::Udp { socket: socket.clone(), peer: peer.clone(), learn_peer },
        LinkWriter::Udp { socket, peer },
    ))
}

fn tcp_pair(stream: TcpStream) -> Result<(LinkReader, LinkWriter)> {
    stream.set_nodelay(true).ok();
    stream.set_read_timeout(Some(READ_SLICE)).context("set tcp read timeout")?;
    let writer = stream.try_clone().context("clone tcp stream")?;
    Ok((
        LinkReader::Stream { io: Box::new(stream), framer: FrameBuffer::default() },
        LinkWriter::Stream(Box::new(writer)),
    ))
}

/// Wait up to `timeout` for the vehicle side to connect in.
fn accept_one(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let listener = TcpListener::bind(addr).with_context(|| format!("bind tcp {}", addr))?;
    listener.set_nonblocking(true).context("set listener nonblocking")?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, from)) => {
                debug!("link: tcp peer {} connected", from);
                stream.set_nonblocking(false).context("set tcp stream blocking")?;
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(anyhow!("no tcp connection on {} within {:?}", addr, timeout));
                }
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => return Err(e).with_context(|| format!("accept on {}", addr)),
        }
    }
}

fn is_idle(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}

fn batch(frames: Vec<InboundFrame>) -> PumpItem {
    if frames.is_empty() {
        PumpItem::Skip
    } else {
        PumpItem::Batch(frames)
    }
}

impl LinkReader {
    fn read_some(&mut self) -> PumpItem {
        match self {
            LinkReader::Udp { socket, peer, learn_peer } => {
                let mut buf = [0u8; UDP_DATAGRAM_MAX];
                match socket.recv_from(&mut buf) {
                    Ok((n, from)) => {
                        if *learn_peer {
                            if let Ok(mut p) = peer.lock() {
                                if *p != Some(from) {
                                    debug!("link: udp peer is now {}", from);
                                    *p = Some(from);
                                }
                            }
                        }
                        batch(decode_frames(&buf[..n]))
                    }
                    Err(e) if is_idle(&e) => PumpItem::Skip,
                    // ICMP port unreachable from a peer that went away
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => PumpItem::Skip,
                    Err(e) => PumpItem::Fatal(TransportError::Io(e)),
                }
            }
            LinkReader::Stream { io, framer } => {
                let mut buf = [0u8; STREAM_CHUNK];
                match io.read(&mut buf) {
                    Ok(0) => PumpItem::Fatal(TransportError::Closed),
                    Ok(n) => {
                        framer.extend(&buf[..n]);
                        batch(framer.drain_frames())
                    }
                    Err(e) if is_idle(&e) => PumpItem::Skip,
                    Err(e) => PumpItem::Fatal(TransportError::Io(e)),
                }
            }
        }
    }
}

impl LinkWriter {
    fn write_frame(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        match self {
            LinkWriter::Udp { socket, peer } => {
                let dest = *peer.lock().map_err(|_| TransportError::Closed)?;
                match dest {
                    Some(dest) => Ok(socket.send_to(frame, dest)?),
                    // udpin before anything arrived: nobody to talk to yet
                    None => Ok(0),
                }
            }
            LinkWriter::Stream(io) => {
                io.write_all(frame)?;
                io.flush()?;
                Ok(frame.len())
            }
        }
    }
}

impl LinkTransport for MavlinkTransport {
    fn recv(&self, timeout: Duration) -> Result<Option<InboundFrame>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        recv_pumped(&self.inbound, timeout)
    }

    fn send(&self, header: &MavHeader, message: &MavMessage) -> Result<usize, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(header, message)?;
        let mut writer = self.writer.lock().map_err(|_| TransportError::Closed)?;
        writer.as_mut().ok_or(TransportError::Closed)?.write_frame(&frame)
    }

    /// Stops the pump and drops every handle, so the address or device can
    /// be opened again as soon as this returns.
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.writer.lock().ok().and_then(|mut w| w.take()));
        let pump = self.pump.lock().ok().and_then(|mut p| p.take());
        if let Some(pump) = pump {
            if pump.join().is_err() {
                warn!("link: pump for {} panicked", self.address);
            }
        }
        info!("link: closed {}", self.address);
    }

    fn describe(&self) -> String {
        self.address.clone()
    }
}

impl Drop for MavlinkTransport {
    fn drop(&mut self) {
        self.close();
    }
}
