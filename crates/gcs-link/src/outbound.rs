use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use mavlink::common::MavMessage;
use mavlink::{MavHeader, Message};
use tracing::trace;

use crate::error::SendError;
use crate::telemetry::TelemetryBufferStore;
use crate::transport::LinkTransport;
use crate::wire::Target;

/// Write side of a session: stamps our header and sequence on every frame.
pub struct LinkSender {
    transport: Arc<dyn LinkTransport>,
    system_id: u8,
    component_id: u8,
    sequence: AtomicU8,
    target: Target,
    traffic: Arc<TelemetryBufferStore>,
}

impl LinkSender {
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        system_id: u8,
        component_id: u8,
        target: Target,
        traffic: Arc<TelemetryBufferStore>,
    ) -> Self {
        Self { transport, system_id, component_id, sequence: AtomicU8::new(0), target, traffic }
    }

    pub fn target(&self) -> Target {
        self.target
    }

    pub fn send(&self, message: &MavMessage) -> Result<usize, SendError> {
        let header = MavHeader {
            system_id: self.system_id,
            component_id: self.component_id,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        let n = self.transport.send(&header, message)?;
        self.traffic.record_outbound(message.message_name());
        trace!(msg = message.message_name(), bytes = n, "tx");
        Ok(n)
    }
}
