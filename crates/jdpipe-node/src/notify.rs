use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

/// Coalescing wake-up signal, the task-notification of an RTOS.
///
/// `give` may be called from any thread, any number of times; gives
/// collapse into one pending token and a successful `wait` consumes it.
#[derive(Debug)]
pub struct Notify {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Notify {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self { tx, rx }
    }

    pub fn give(&self) {
        // Full means a token is already pending.
        let _ = self.tx.try_send(());
    }

    /// Forget gives that arrived before the caller started waiting.
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    /// Block until a give arrives or `timeout` passes. Returns true when
    /// woken by a give.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }
}

impl Default for Notify {
    fn default() -> Self {
        Self::new()
    }
}
