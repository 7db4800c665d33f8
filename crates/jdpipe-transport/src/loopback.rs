//! In-process broadcast bus.
//!
//! Every frame sent by one endpoint is encoded to wire bytes, optionally
//! lost according to the bus fault plan, and decoded into the inbox of
//! every other endpoint. Inbox overflow drops the frame for that
//! receiver only, as a busy node would miss it on a real wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use jdpipe_frame::Frame;

use crate::traits::Transport;

/// Default inbox depth per endpoint.
pub const DEFAULT_INBOX_DEPTH: usize = 32;

/// Counters describing bus activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Frames handed to the bus by any endpoint.
    pub frames_sent: u64,
    /// Frames lost on the wire by fault injection.
    pub frames_dropped: u64,
    /// Per-receiver deliveries lost to full inboxes.
    pub inbox_overflows: u64,
}

#[derive(Debug, Default)]
struct FaultPlan {
    drop_next: u64,
    drop_every: u64,
}

struct Endpoint {
    id: u64,
    inbox_tx: Sender<Frame>,
    inbox_rx: Receiver<Frame>,
}

struct BusInner {
    endpoints: Mutex<Vec<Weak<Endpoint>>>,
    faults: Mutex<FaultPlan>,
    inbox_depth: usize,
    next_id: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    overflows: AtomicU64,
}

/// Shared simulated wire. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct LoopbackBus {
    inner: Arc<BusInner>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::with_inbox_depth(DEFAULT_INBOX_DEPTH)
    }

    pub fn with_inbox_depth(inbox_depth: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                endpoints: Mutex::new(Vec::new()),
                faults: Mutex::new(FaultPlan::default()),
                inbox_depth,
                next_id: AtomicU64::new(1),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                overflows: AtomicU64::new(0),
            }),
        }
    }

    /// Connect a new endpoint to the wire.
    pub fn attach(&self) -> LoopbackTransport {
        let (inbox_tx, inbox_rx) = crossbeam_channel::bounded(self.inner.inbox_depth.max(1));
        let endpoint = Arc::new(Endpoint {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            inbox_tx,
            inbox_rx,
        });
        let mut endpoints = self
            .inner
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        endpoints.retain(|weak| weak.strong_count() > 0);
        endpoints.push(Arc::downgrade(&endpoint));
        LoopbackTransport {
            endpoint,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Lose the next `count` frames put on the wire.
    pub fn drop_next(&self, count: u64) {
        self.faults().drop_next = count;
    }

    /// Lose every `nth` frame put on the wire; 0 disables.
    pub fn drop_every(&self, nth: u64) {
        self.faults().drop_every = nth;
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            frames_sent: self.inner.sent.load(Ordering::Relaxed),
            frames_dropped: self.inner.dropped.load(Ordering::Relaxed),
            inbox_overflows: self.inner.overflows.load(Ordering::Relaxed),
        }
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, FaultPlan> {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusInner {
    fn should_drop(&self, sequence: u64) -> bool {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        if faults.drop_next > 0 {
            faults.drop_next -= 1;
            return true;
        }
        faults.drop_every > 0 && sequence % faults.drop_every == 0
    }

    fn transmit(&self, from: u64, frame: &Frame) {
        let sequence = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        if self.should_drop(sequence) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                sequence,
                device = format_args!("{:016x}", frame.device_identifier),
                "loopback frame lost"
            );
            return;
        }

        let wire = frame.to_bytes();
        let receivers: Vec<Arc<Endpoint>> = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|endpoint| endpoint.id != from)
            .collect();

        for endpoint in receivers {
            let received = match Frame::decode(&wire) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(error = %err, "loopback frame failed validation");
                    return;
                }
            };
            if endpoint.inbox_tx.try_send(received).is_err() {
                self.overflows.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(endpoint = endpoint.id, "loopback inbox full, frame dropped");
            }
        }
    }
}

/// One node's connection to a [`LoopbackBus`].
pub struct LoopbackTransport {
    endpoint: Arc<Endpoint>,
    bus: Arc<BusInner>,
}

impl LoopbackTransport {
    /// Frames waiting to be received.
    pub fn pending(&self) -> usize {
        self.endpoint.inbox_rx.len()
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, frame: Frame, _timeout: Duration) -> bool {
        self.bus.transmit(self.endpoint.id, &frame);
        true
    }

    fn receive(&self) -> Option<Frame> {
        self.endpoint.inbox_rx.try_recv().ok()
    }
}
