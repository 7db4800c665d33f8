/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than a frame header.
    #[error("frame too short ({len} bytes, header is 12)")]
    TooShort { len: usize },

    /// The size field claims more payload than a frame can carry.
    #[error("frame size {size} exceeds payload capacity {max}")]
    SizeOutOfRange { size: usize, max: usize },

    /// The buffer ends before the payload announced by the size field.
    #[error("frame truncated (expected {expected} bytes, got {actual})")]
    Truncated { expected: usize, actual: usize },

    /// The stored CRC does not match the frame contents.
    #[error("crc mismatch (stored {stored:#06x}, computed {computed:#06x})")]
    CrcMismatch { stored: u16, computed: u16 },

    /// Packet data does not fit in an empty frame.
    #[error("packet data too large ({size} bytes, max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// A pipe open payload is shorter than its fixed layout.
    #[error("invalid pipe open payload ({0} bytes, need 12)")]
    InvalidPipeOpen(usize),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
