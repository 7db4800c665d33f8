use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use jdpipe_frame::Frame;

/// Inbound frames waiting for the dispatch task.
pub struct RxQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    dropped: AtomicU64,
}

impl RxQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(depth.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a received frame without blocking; false when full.
    pub fn frame_received(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(err) => {
                let frame = err.into_inner();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    device = format_args!("{:016x}", frame.device_identifier),
                    "rx queue full, frame dropped"
                );
                false
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.rx.is_full()
    }

    pub fn has_frame(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn next_frame(&self, timeout: Duration) -> Option<Frame> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_next_frame(&self) -> Option<Frame> {
        self.rx.try_recv().ok()
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
