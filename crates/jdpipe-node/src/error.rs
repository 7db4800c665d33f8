/// Errors that can occur in node and pipe operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The peer never acknowledged a flushed frame; the pipe was torn down.
    #[error("pipe to {device:016x} reset: no acknowledgement")]
    Reset { device: u64 },

    /// The pipe was already closed or torn down.
    #[error("pipe closed")]
    Closed,

    /// No unused port was found within the allowed number of draws.
    #[error("no free pipe port after {0} attempts")]
    NoFreePort(u32),

    /// Every slot of a pipe table is taken.
    #[error("{kind} pipe table full ({capacity} slots)")]
    RegistryFull {
        kind: &'static str,
        capacity: usize,
    },

    /// The worker job queue is full.
    #[error("worker queue full")]
    WorkerQueueFull,

    /// Packet data does not fit in a single frame.
    #[error("packet data of {size} bytes exceeds {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// An open command did not carry a complete pipe open payload.
    #[error("invalid pipe open payload ({0} bytes)")]
    InvalidOpen(usize),

    /// Event ids are limited to 16 bits.
    #[error("event id {0:#x} out of range")]
    InvalidEvent(u32),

    /// More services than service numbers (or advertisement room).
    #[error("too many services: {0}")]
    TooManyServices(usize),

    /// Thread creation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
