use std::time::Duration;

use jdpipe_frame::Frame;

/// A frame-level bus driver.
///
/// Implementations must be callable from several tasks at once: the TX
/// queue and every output pipe push frames concurrently, while a single
/// dispatch task drains `receive`.
pub trait Transport: Send + Sync {
    /// Hand a sealed frame to the driver.
    ///
    /// Ownership transfers: the driver releases the frame once it has been
    /// sent. Returns `false` when the driver could not accept the frame
    /// within `timeout`, in which case the frame is dropped.
    fn send(&self, frame: Frame, timeout: Duration) -> bool;

    /// Next received frame, already CRC-validated. Never blocks.
    fn receive(&self) -> Option<Frame>;

    /// True when nothing is waiting to go out on the wire.
    fn is_idle(&self) -> bool {
        true
    }
}
