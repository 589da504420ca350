use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("link closed")]
    Closed,
    #[error("link i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    WebSocket(String),
    #[error("link write failed: {0}")]
    Write(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to open transport {target}: {reason}")]
    TransportOpenFailed { target: String, reason: String },
    #[error("no heartbeat from {target} within {waited:?}")]
    NoResponse { target: String, waited: Duration },
    #[error("invalid connection target {0:?}")]
    InvalidTarget(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error, PartialEq)]
pub enum ParamError {
    #[error("parameter name is empty")]
    EmptyName,
    #[error("parameter name {0:?} exceeds 16 bytes")]
    NameTooLong(String),
}

#[derive(Debug, Error)]
pub enum ParamUpdateError {
    #[error(transparent)]
    Invalid(#[from] ParamError),
    #[error(transparent)]
    Send(#[from] SendError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamSyncError {
    #[error("parameter download stalled at {received}/{expected}")]
    Stalled { received: u32, expected: u32 },
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("no acknowledgement before timeout")]
    TimedOut,
    #[error(transparent)]
    Send(#[from] SendError),
}

impl CommandError {
    /// True when the vehicle answered, false when it never heard us or we never sent.
    pub fn is_vehicle_answer(&self) -> bool {
        matches!(self, CommandError::Rejected(_))
    }
}
