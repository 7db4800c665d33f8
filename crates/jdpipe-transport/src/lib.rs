//! Frame transport abstraction.
//!
//! The bus driver (UART break detection, bit timing, FIFOs) lives below
//! this layer. Everything above sees a [`Transport`] that accepts sealed
//! frames and yields CRC-validated ones:
//! - [`LoopbackBus`] connects in-process nodes over a simulated broadcast wire
//! - [`StreamTransport`] carries frames over a byte stream (serial bridge)
//!
//! Inboxes are bounded `crossbeam_channel` queues; a full inbox drops the
//! newest frame the way a busy node misses it on a real wire.

pub mod error;
pub mod loopback;
pub mod stream;
pub mod traits;

pub use error::{Result, TransportError};
pub use loopback::{BusStats, LoopbackBus, LoopbackTransport};
pub use stream::StreamTransport;
pub use traits::Transport;
