//! JACDAC framing and reliable pipes.
//!
//! # Crate Structure
//!
//! - [`frame`]: frame and packet codec, CRC, pipe command words
//! - [`transport`]: frame transport trait, loopback bus, stream bridge
//! - [`node`]: TX/RX queues, dispatcher, pipe registry, output and input pipes

/// Re-export frame types.
pub mod frame {
    pub use jdpipe_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use jdpipe_transport::*;
}

/// Re-export node types.
pub mod node {
    pub use jdpipe_node::*;
}
