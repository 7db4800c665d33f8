use std::sync::Arc;

use jdpipe_frame::Packet;

use crate::registry::PipeRegistry;
use crate::slots::SlotId;

/// Metadata delivered to a [`PipeSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meta<'a> {
    /// A packet written with the metadata flag.
    Data(&'a Packet),
    /// The sender closed the pipe; nothing follows.
    Eof,
}

/// Receiver of an input pipe's packets.
///
/// Both callbacks run on the dispatch task, in pipe order. Anything slow
/// belongs on a [`crate::Worker`]; packet data is a cheap `Bytes` clone.
pub trait PipeSink: Send + Sync {
    fn on_data(&self, packet: &Packet);

    fn on_meta(&self, meta: Meta<'_>) {
        let _ = meta;
    }
}

/// Owner handle of an open input pipe.
///
/// Dropping the handle closes the pipe locally (no packet is sent).
pub struct InputPipe {
    registry: Arc<PipeRegistry>,
    id: SlotId,
    port: u16,
}

impl InputPipe {
    pub(crate) fn new(registry: Arc<PipeRegistry>, id: SlotId, port: u16) -> Self {
        Self { registry, id, port }
    }

    /// Port to hand to the sender.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// False once closed locally or by the sender.
    pub fn is_open(&self) -> bool {
        self.registry.input_open(self.id)
    }

    /// Stop accepting packets. Closing twice is a no-op.
    pub fn close(&self) {
        if self.registry.close_input(self.id) {
            tracing::debug!(port = self.port, "input pipe closed");
        }
    }
}

impl Drop for InputPipe {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for InputPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPipe")
            .field("port", &self.port)
            .field("open", &self.is_open())
            .finish()
    }
}
