//! JACDAC frame codec.
//!
//! A frame is one bus transmission: a 12-byte header followed by up to
//! 236 bytes of payload holding one or more 4-byte aligned packets.
//! - A 2-byte CRC16 over everything that follows it
//! - A 1-byte payload size and a 1-byte flags field
//! - An 8-byte device identifier (sender, or target for commands)
//!
//! Pipes reuse the 16-bit service command of packets sent to the
//! [`PIPE`] service number as a port/counter word, see [`PipeCommand`].

pub mod codec;
pub mod crc;
pub mod error;
pub mod pipe;
pub mod reader;
pub mod service;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, Packet, Packets, FRAME_HEADER_SIZE,
    MAX_PACKET_DATA, MAX_PAYLOAD, PACKET_HEADER_SIZE,
};
pub use crc::crc16;
pub use error::{FrameError, Result};
pub use pipe::{PipeCommand, PipeOpen, MAX_PORT, PIPE_OPEN_SIZE};
pub use reader::FrameReader;
pub use service::{
    CMD_ADVERTISEMENT_DATA, CMD_EVENT, CONTROL, CRC_ACK, FLAG_ACK_REQUESTED, FLAG_COMMAND,
    FLAG_IDENTIFIER_IS_SERVICE_CLASS, PIPE,
};
pub use writer::FrameWriter;
