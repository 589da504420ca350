use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use mavlink::common::MavMessage;
use mavlink::MavHeader;
use tracing::{info, warn};
use tungstenite::http::Uri;
use tungstenite::{Message, WebSocket};

use super::{decode_frames, encode_frame, recv_pumped, spawn_pump, Inbound, InboundFrame, LinkTransport, PumpItem};
use crate::error::TransportError;

/// How long the pump holds the socket per read attempt.
const READ_SLICE: Duration = Duration::from_millis(50);

type SharedSocket = Arc<Mutex<WebSocket<TcpStream>>>;

/// MAVLink v2 frames carried in binary websocket messages (one or more per message).
pub struct WebSocketTransport {
    socket: SharedSocket,
    inbound: Inbound,
    pump: Mutex<Option<JoinHandle<()>>>,
    url: String,
    closed: Arc<AtomicBool>,
}

impl WebSocketTransport {
    pub fn open(url: &str, connect_timeout: Duration) -> Result<Self> {
        let uri: Uri = url.parse().with_context(|| format!("parse websocket url {}", url))?;
        let host = uri.host().context("websocket url has no host")?;
        let port = uri.port_u16().unwrap_or(80);
        let addr = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", host, port))?
            .next()
            .ok_or_else(|| anyhow!("no address for {}:{}", host, port))?;

        let stream = TcpStream::connect_timeout(&addr, connect_timeout)
            .with_context(|| format!("tcp connect {}", addr))?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(connect_timeout)).context("set handshake timeout")?;

        let (socket, _resp) =
            tungstenite::client(url, stream).map_err(|e| anyhow!("websocket handshake with {}: {}", url, e))?;
        socket.get_ref().set_read_timeout(Some(READ_SLICE)).context("set read timeout")?;

        let socket: SharedSocket = Arc::new(Mutex::new(socket));
        let closed = Arc::new(AtomicBool::new(false));

        let reader = socket.clone();
        let reader_closed = closed.clone();
        let (inbound, pump) = spawn_pump("websocket", move || {
            if reader_closed.load(Ordering::Acquire) {
                return PumpItem::Fatal(TransportError::Closed);
            }
            read_one(&reader)
        })
        .context("spawn websocket pump")?;

        info!("link: websocket connected {}", url);
        Ok(Self { socket, inbound, pump: Mutex::new(Some(pump)), url: url.to_string(), closed })
    }
}

fn read_one(socket: &SharedSocket) -> PumpItem {
    let msg = {
        let Ok(mut ws) = socket.lock() else {
            return PumpItem::Fatal(TransportError::Closed);
        };
        ws.read()
    };
    match msg {
        Ok(Message::Binary(bytes)) => {
            let frames = decode_frames(&bytes);
            if frames.is_empty() {
                PumpItem::Skip
            } else {
                PumpItem::Batch(frames)
            }
        }
        Ok(Message::Close(_)) => PumpItem::Fatal(TransportError::Closed),
        Ok(_) => PumpItem::Skip,
        Err(tungstenite::Error::Io(e)) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            PumpItem::Skip
        }
        Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
            PumpItem::Fatal(TransportError::Closed)
        }
        Err(e) => PumpItem::Fatal(TransportError::WebSocket(e.to_string())),
    }
}

impl LinkTransport for WebSocketTransport {
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
        let buf = encode_frame(header, message)?;
        let n = buf.len();
        let mut ws = self.socket.lock().map_err(|_| TransportError::Closed)?;
        ws.send(Message::Binary(buf)).map_err(|e| TransportError::WebSocket(e.to_string()))?;
        Ok(n)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut ws) = self.socket.lock() {
            if let Err(e) = ws.close(None) {
                warn!("websocket close: {}", e);
            }
        }
        let pump = self.pump.lock().ok().and_then(|mut p| p.take());
        if let Some(pump) = pump {
            if pump.join().is_err() {
                warn!("websocket: pump for {} panicked", self.url);
            }
        }
        info!("link: closed {}", self.url);
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
