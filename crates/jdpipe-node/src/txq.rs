use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jdpipe_frame::{Frame, MAX_PACKET_DATA};
use jdpipe_transport::Transport;

use crate::error::{NodeError, Result};

/// Outbound side of a node.
///
/// Packets from any number of producers are coalesced into one staging
/// frame stamped with this node's id; the frame goes out when it is full
/// or on [`TxQueue::flush`].
pub struct TxQueue {
    device_id: u64,
    transport: Arc<dyn Transport>,
    send_timeout: Duration,
    staging: Mutex<Option<Frame>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl TxQueue {
    pub fn new(device_id: u64, transport: Arc<dyn Transport>, send_timeout: Duration) -> Self {
        Self {
            device_id,
            transport,
            send_timeout,
            staging: Mutex::new(None),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn staging(&self) -> MutexGuard<'_, Option<Frame>> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue one packet for broadcast.
    pub fn push(&self, service_number: u8, service_command: u16, data: &[u8]) -> Result<()> {
        if data.len() > MAX_PACKET_DATA {
            return Err(NodeError::PacketTooLarge {
                size: data.len(),
                max: MAX_PACKET_DATA,
            });
        }
        loop {
            {
                let mut staging = self.staging();
                let frame = staging.get_or_insert_with(|| Frame::new(self.device_id, 0));
                if frame.push_in_frame(service_number, service_command, data) {
                    return Ok(());
                }
            }
            self.flush();
        }
    }

    /// Seal the staging frame and hand it to the transport.
    pub fn flush(&self) {
        let Some(mut frame) = self.staging().take() else {
            return;
        };
        frame.seal();
        self.push_frame(frame);
    }

    /// Hand a sealed frame straight to the transport.
    ///
    /// Returns false when the transport refused it; the frame is gone.
    pub fn push_frame(&self, frame: Frame) -> bool {
        let crc = frame.crc;
        if self.transport.send(frame, self.send_timeout) {
            self.sent.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(crc = format_args!("{crc:04x}"), "transport refused frame, dropped");
            false
        }
    }

    /// Nothing staged and nothing waiting in the transport.
    pub fn is_idle(&self) -> bool {
        self.staging().is_none() && self.transport.is_idle()
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    /// Frames accepted by the transport.
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames the transport refused.
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
