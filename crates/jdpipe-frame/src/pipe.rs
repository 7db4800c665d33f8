//! Pipe command word and pipe open payload.
//!
//! Packets sent to the [`crate::PIPE`] service number carry this word in
//! their service command:
//!
//! ```text
//! 15            7   6      5      4       0
//! ┌──────────────┬──────┬───────┬─────────┐
//! │ port (9b)    │ meta │ close │ counter │
//! └──────────────┴──────┴───────┴─────────┘
//! ```

use crate::error::{FrameError, Result};

const PORT_SHIFT: u16 = 7;
const COUNTER_MASK: u16 = 0x001f;
const CLOSE_MASK: u16 = 0x0020;
const METADATA_MASK: u16 = 0x0040;

/// Largest port number; port 0 is never assigned.
pub const MAX_PORT: u16 = 0x01ff;

/// Wire size of [`PipeOpen`].
pub const PIPE_OPEN_SIZE: usize = 12;

/// Port, rolling counter and flag pair of one pipe packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeCommand(u16);

impl PipeCommand {
    /// First command word of a pipe on `port` (counter 0, no flags).
    pub const fn new(port: u16) -> Self {
        Self((port & MAX_PORT) << PORT_SHIFT)
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn port(self) -> u16 {
        self.0 >> PORT_SHIFT
    }

    pub const fn counter(self) -> u16 {
        self.0 & COUNTER_MASK
    }

    pub const fn is_meta(self) -> bool {
        self.0 & METADATA_MASK != 0
    }

    pub const fn is_close(self) -> bool {
        self.0 & CLOSE_MASK != 0
    }

    /// Same port and counter with the metadata flag set.
    pub const fn meta(self) -> Self {
        Self(self.0 | METADATA_MASK)
    }

    /// Same port and counter with the close flag set.
    pub const fn close(self) -> Self {
        Self(self.0 | CLOSE_MASK)
    }

    /// Next counter value; the counter wraps within its field and every
    /// other bit is preserved.
    pub const fn advance(self) -> Self {
        Self((self.0.wrapping_add(1) & COUNTER_MASK) | (self.0 & !COUNTER_MASK))
    }
}

impl std::fmt::Display for PipeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port={} counter={}", self.port(), self.counter())?;
        if self.is_meta() {
            f.write_str(" meta")?;
        }
        if self.is_close() {
            f.write_str(" close")?;
        }
        Ok(())
    }
}

/// Payload of an open command: where the opener listens.
///
/// Layout: `device_identifier u64 LE | port u16 LE | reserved u16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOpen {
    pub device_identifier: u64,
    pub port: u16,
}

impl PipeOpen {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PIPE_OPEN_SIZE {
            return Err(FrameError::InvalidPipeOpen(data.len()));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[0..8]);
        Ok(Self {
            device_identifier: u64::from_le_bytes(id),
            port: u16::from_le_bytes([data[8], data[9]]),
        })
    }

    pub fn encode(&self) -> [u8; PIPE_OPEN_SIZE] {
        let mut out = [0u8; PIPE_OPEN_SIZE];
        out[0..8].copy_from_slice(&self.device_identifier.to_le_bytes());
        out[8..10].copy_from_slice(&self.port.to_le_bytes());
        out
    }
}
