//! Reliable sending side of a pipe.
//!
//! Packets are staged in a command frame addressed to the receiver with
//! ACK_REQUESTED set. A flush seals the frame and resends copies of it
//! with exponential backoff until the receiver's CRC-ACK arrives. A pipe
//! that never gets its ack is torn down without a close packet.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jdpipe_frame::{
    Frame, Packet, PipeCommand, PipeOpen, FLAG_ACK_REQUESTED, FLAG_COMMAND, MAX_PACKET_DATA, PIPE,
};

use crate::config::RetryPolicy;
use crate::error::{NodeError, Result};
use crate::node::Node;
use crate::notify::Notify;
use crate::registry::PipeRegistry;
use crate::slots::SlotId;
use crate::txq::TxQueue;

#[derive(Debug, Clone, Copy)]
enum PacketKind {
    Data,
    Meta,
    Close,
}

struct PipeState {
    /// Port and counter of the next packet.
    next: PipeCommand,
    staging: Option<Frame>,
    open: bool,
}

/// Sending end of a pipe, owned by the service that opened it.
///
/// All operations take `&self`; writes from several threads are
/// serialised by the pipe's own lock.
pub struct OutputPipe {
    device: u64,
    port: u16,
    waiter: SlotId,
    notify: Arc<Notify>,
    registry: Arc<PipeRegistry>,
    tx: Arc<TxQueue>,
    retry: RetryPolicy,
    state: Mutex<PipeState>,
}

impl OutputPipe {
    /// Open the pipe described by an open command's payload.
    pub fn open(node: &Node, packet: &Packet) -> Result<Self> {
        let open =
            PipeOpen::parse(&packet.data).map_err(|_| NodeError::InvalidOpen(packet.data.len()))?;
        node.open_output_pipe(open.device_identifier, open.port)
    }

    pub(crate) fn new(
        registry: Arc<PipeRegistry>,
        tx: Arc<TxQueue>,
        retry: RetryPolicy,
        device: u64,
        port: u16,
    ) -> Result<Self> {
        let (waiter, notify) = registry.register_output(device)?;
        tracing::debug!(
            device = format_args!("{device:016x}"),
            port,
            "output pipe opened"
        );
        Ok(Self {
            device,
            port,
            waiter,
            notify,
            registry,
            tx,
            retry,
            state: Mutex::new(PipeState {
                next: PipeCommand::new(port),
                staging: None,
                open: true,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn device(&self) -> u64 {
        self.device
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Queue data; anything longer than one packet is split.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.write_ex(data, PacketKind::Data)
    }

    /// Queue metadata packets.
    pub fn write_meta(&self, data: &[u8]) -> Result<()> {
        self.write_ex(data, PacketKind::Meta)
    }

    /// Send the staged frame and wait for it to be acknowledged.
    ///
    /// On failure the pipe is freed and further calls return
    /// [`NodeError::Closed`].
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(NodeError::Closed);
        }
        let result = self.flush_locked(&mut state);
        if result.is_err() {
            self.free(&mut state);
        }
        result
    }

    /// Send a close packet, flush and free. Closing a closed pipe is a
    /// no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.open {
            return Ok(());
        }
        let result = self
            .push_packet(&mut state, &[], PacketKind::Close)
            .and_then(|()| self.flush_locked(&mut state));
        self.free(&mut state);
        tracing::debug!(port = self.port, ok = result.is_ok(), "output pipe closed");
        result
    }

    fn write_ex(&self, data: &[u8], kind: PacketKind) -> Result<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(NodeError::Closed);
        }
        if data.is_empty() {
            return self.push_packet(&mut state, data, kind);
        }
        for chunk in data.chunks(MAX_PACKET_DATA) {
            self.push_packet(&mut state, chunk, kind)?;
        }
        Ok(())
    }

    fn push_packet(&self, state: &mut PipeState, data: &[u8], kind: PacketKind) -> Result<()> {
        let command = match kind {
            PacketKind::Data => state.next,
            PacketKind::Meta => state.next.meta(),
            PacketKind::Close => state.next.close(),
        };
        loop {
            let device = self.device;
            let frame = state
                .staging
                .get_or_insert_with(|| Frame::new(device, FLAG_COMMAND | FLAG_ACK_REQUESTED));
            if frame.push_in_frame(PIPE, command.raw(), data) {
                break;
            }
            if let Err(err) = self.flush_locked(state) {
                self.free(state);
                return Err(err);
            }
        }
        state.next = state.next.advance();
        Ok(())
    }

    fn flush_locked(&self, state: &mut PipeState) -> Result<()> {
        let Some(mut frame) = state.staging.take() else {
            return Ok(());
        };
        frame.seal();
        self.registry.arm(self.waiter, frame.crc);

        let mut acked = false;
        for (attempt, delay) in self.retry.delays().enumerate() {
            if attempt > 0 {
                tracing::trace!(attempt, crc = format_args!("{:04x}", frame.crc), "resending");
            }
            self.tx.push_frame(frame.clone());
            if self.notify.wait(delay) {
                acked = true;
                break;
            }
        }
        self.registry.disarm(self.waiter);

        if acked {
            Ok(())
        } else {
            tracing::debug!(
                device = format_args!("{:016x}", self.device),
                port = self.port,
                "no ack, pipe reset"
            );
            Err(NodeError::Reset {
                device: self.device,
            })
        }
    }

    fn free(&self, state: &mut PipeState) {
        if !state.open {
            return;
        }
        state.open = false;
        state.staging = None;
        self.registry.unregister_output(self.waiter);
    }
}

impl Drop for OutputPipe {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.open {
            state.open = false;
            state.staging = None;
            self.registry.unregister_output(self.waiter);
        }
    }
}

impl std::fmt::Debug for OutputPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPipe")
            .field("device", &format_args!("{:016x}", self.device))
            .field("port", &self.port)
            .field("open", &self.is_open())
            .finish()
    }
}
