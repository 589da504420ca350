use std::fmt;

use crate::error::ConnectError;

/// Where the flight controller lives. Only used to pick a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectTarget {
    Serial { device: String, baud: u32 },
    UdpIn(String),
    UdpOut(String),
    TcpIn(String),
    TcpOut(String),
    WebSocket(String),
}

impl ConnectTarget {
    /// Accepts `udpin:ADDR`, `udpout:ADDR`, `tcpin:ADDR`, `tcpout:ADDR`,
    /// `serial:DEV:BAUD`, `ws://...`, a bare device path, or a bare COM
    /// port number (`"3"` means `COM3`). Bare devices use `default_baud`.
    pub fn parse(s: &str, default_baud: u32) -> Result<Self, ConnectError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConnectError::InvalidTarget(s.into()));
        }

        if s.starts_with("ws://") {
            return Ok(Self::WebSocket(s.to_string()));
        }
        if s.starts_with("wss://") {
            // TLS websockets are terminated by a proxy in front of us.
            return Err(ConnectError::InvalidTarget(s.into()));
        }

        let addr = |rest: &str| -> Result<String, ConnectError> {
            if rest.is_empty() || !rest.contains(':') {
                return Err(ConnectError::InvalidTarget(s.into()));
            }
            Ok(rest.to_string())
        };

        if let Some(rest) = s.strip_prefix("udpin:") {
            return Ok(Self::UdpIn(addr(rest)?));
        }
        if let Some(rest) = s.strip_prefix("udpout:") {
            return Ok(Self::UdpOut(addr(rest)?));
        }
        if let Some(rest) = s.strip_prefix("tcpin:") {
            return Ok(Self::TcpIn(addr(rest)?));
        }
        if let Some(rest) = s.strip_prefix("tcpout:") {
            return Ok(Self::TcpOut(addr(rest)?));
        }
        if let Some(rest) = s.strip_prefix("serial:") {
            let (device, baud) = match rest.rsplit_once(':') {
                Some((dev, b)) => {
                    let baud = b.parse::<u32>().map_err(|_| ConnectError::InvalidTarget(s.into()))?;
                    (dev.to_string(), baud)
                }
                None => (rest.to_string(), default_baud),
            };
            if device.is_empty() || baud == 0 {
                return Err(ConnectError::InvalidTarget(s.into()));
            }
            return Ok(Self::Serial { device, baud });
        }

        if default_baud == 0 {
            return Err(ConnectError::InvalidTarget(s.into()));
        }
        let device = if s.chars().all(|c| c.is_ascii_digit()) {
            format!("COM{}", s)
        } else {
            s.to_string()
        };
        Ok(Self::Serial { device, baud: default_baud })
    }

    /// `udpin:ADDR`-style address, if this target is not a websocket.
    pub fn mavlink_address(&self) -> Option<String> {
        match self {
            Self::Serial { device, baud } => Some(format!("serial:{}:{}", device, baud)),
            Self::UdpIn(a) => Some(format!("udpin:{}", a)),
            Self::UdpOut(a) => Some(format!("udpout:{}", a)),
            Self::TcpIn(a) => Some(format!("tcpin:{}", a)),
            Self::TcpOut(a) => Some(format!("tcpout:{}", a)),
            Self::WebSocket(_) => None,
        }
    }
}

impl fmt::Display for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket(url) => f.write_str(url),
            other => f.write_str(&other.mavlink_address().unwrap_or_default()),
        }
    }
}
