use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crc::{crc16_update, CRC16_INIT};
use crate::error::{FrameError, Result};
use crate::pipe::PipeCommand;
use crate::service::{FLAG_ACK_REQUESTED, FLAG_COMMAND, FLAG_IDENTIFIER_IS_SERVICE_CLASS};

/// Frame header: crc (2) + size (1) + flags (1) + device identifier (8).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Packet header: size (1) + service number (1) + service command (2).
pub const PACKET_HEADER_SIZE: usize = 4;

/// Payload capacity of a single frame.
pub const MAX_PAYLOAD: usize = 236;

/// Largest packet data that fits in an empty frame.
pub const MAX_PACKET_DATA: usize = MAX_PAYLOAD - PACKET_HEADER_SIZE;

const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// One bus frame: header fields plus packed packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sender id for reports, target id (or service class) for commands.
    pub device_identifier: u64,
    /// CRC as stored on the wire; see [`Frame::seal`].
    pub crc: u16,
    /// `FLAG_*` bits.
    pub flags: u8,
    payload: BytesMut,
}

impl Frame {
    /// Create an empty frame.
    pub fn new(device_identifier: u64, flags: u8) -> Self {
        Self {
            device_identifier,
            crc: 0,
            flags,
            payload: BytesMut::with_capacity(MAX_PAYLOAD),
        }
    }

    /// Payload size in bytes (the `size` header field).
    pub fn size(&self) -> u8 {
        self.payload.len() as u8
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn is_command(&self) -> bool {
        self.flags & FLAG_COMMAND != 0
    }

    pub fn ack_requested(&self) -> bool {
        self.flags & FLAG_ACK_REQUESTED != 0
    }

    pub fn targets_service_class(&self) -> bool {
        self.flags & FLAG_IDENTIFIER_IS_SERVICE_CLASS != 0
    }

    /// Total wire size (header + payload).
    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Bytes left for further packets (headers included).
    pub fn remaining(&self) -> usize {
        MAX_PAYLOAD - self.payload.len()
    }

    /// CRC over everything that follows the crc field.
    pub fn compute_crc(&self) -> u16 {
        let mut crc = crc16_update(CRC16_INIT, &[self.size(), self.flags]);
        crc = crc16_update(crc, &self.device_identifier.to_le_bytes());
        crc16_update(crc, &self.payload)
    }

    /// Store the computed CRC, making the frame ready to send.
    pub fn seal(&mut self) {
        self.crc = self.compute_crc();
    }

    /// Append a packet at the tail of the frame.
    ///
    /// Returns `false` when the packet does not fit; the caller should
    /// send this frame and retry on a fresh one. An empty frame always
    /// fits a packet of up to [`MAX_PACKET_DATA`] bytes.
    #[must_use]
    pub fn push_in_frame(&mut self, service_number: u8, service_command: u16, data: &[u8]) -> bool {
        if PACKET_HEADER_SIZE + data.len() > self.remaining() {
            return false;
        }
        self.payload.put_u8(data.len() as u8);
        self.payload.put_u8(service_number);
        self.payload.put_u16_le(service_command);
        self.payload.put_slice(data);
        let padded = align4(PACKET_HEADER_SIZE + data.len());
        self.payload
            .put_bytes(0, padded - PACKET_HEADER_SIZE - data.len());
        true
    }

    /// The packet at the front of the payload.
    pub fn first_packet(&self) -> Option<Packet> {
        self.packet_at(0)
    }

    /// Drop the front packet so the next one becomes current.
    ///
    /// Returns `false` when no further well-formed packet follows. The
    /// ack request is cleared since it has been answered for the frame.
    pub fn shift_frame(&mut self) -> bool {
        let Some(first) = self.payload.first() else {
            return false;
        };
        let next = align4(PACKET_HEADER_SIZE + *first as usize);
        if next >= self.payload.len() || self.packet_at(next).is_none() {
            return false;
        }
        self.flags &= !FLAG_ACK_REQUESTED;
        self.payload.advance(next);
        true
    }

    /// Iterate packets without consuming them.
    pub fn packets(&self) -> Packets<'_> {
        Packets {
            frame: self,
            offset: 0,
        }
    }

    fn packet_at(&self, offset: usize) -> Option<Packet> {
        let header = self.payload.get(offset..offset + PACKET_HEADER_SIZE)?;
        let size = header[0] as usize;
        let start = offset + PACKET_HEADER_SIZE;
        let data = self.payload.get(start..start + size)?;
        Some(Packet {
            device_identifier: self.device_identifier,
            flags: self.flags,
            service_number: header[1],
            service_command: u16::from_le_bytes([header[2], header[3]]),
            data: Bytes::copy_from_slice(data),
        })
    }

    /// Encode into a standalone buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        encode_frame(self, &mut dst);
        dst.freeze()
    }

    /// Decode exactly one frame from a received buffer, verifying its CRC.
    ///
    /// Trailing bytes past the announced size are ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let total = frame_len(data)?.ok_or(FrameError::TooShort { len: data.len() })?;
        if data.len() < total {
            return Err(FrameError::Truncated {
                expected: total,
                actual: data.len(),
            });
        }
        let frame = parse_unchecked(&data[..total]);
        verify(&frame)?;
        Ok(frame)
    }
}

/// A packet within a frame, together with the frame header it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub device_identifier: u64,
    pub flags: u8,
    pub service_number: u8,
    pub service_command: u16,
    pub data: Bytes,
}

impl Packet {
    pub fn is_command(&self) -> bool {
        self.flags & FLAG_COMMAND != 0
    }

    pub fn targets_service_class(&self) -> bool {
        self.flags & FLAG_IDENTIFIER_IS_SERVICE_CLASS != 0
    }

    /// The service command read as a pipe command word.
    pub fn pipe_command(&self) -> PipeCommand {
        PipeCommand::from_raw(self.service_command)
    }
}

/// Iterator over the packets of a frame.
pub struct Packets<'a> {
    frame: &'a Frame,
    offset: usize,
}

impl Iterator for Packets<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        if self.offset >= self.frame.payload.len() {
            return None;
        }
        let packet = self.frame.packet_at(self.offset)?;
        self.offset += align4(PACKET_HEADER_SIZE + packet.data.len());
        Some(packet)
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────┬──────────┬──────────┬───────────────┬──────────────────┐
/// │ CRC      │ Size     │ Flags    │ Device id     │ Packets          │
/// │ (2B LE)  │ (1B)     │ (1B)     │ (8B LE)       │ (Size bytes)     │
/// └──────────┴──────────┴──────────┴───────────────┴──────────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    dst.reserve(frame.wire_size());
    dst.put_u16_le(frame.crc);
    dst.put_u8(frame.size());
    dst.put_u8(frame.flags);
    dst.put_u64_le(frame.device_identifier);
    dst.put_slice(&frame.payload);
}

/// Decode a frame from a stream buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// A complete frame is consumed from the buffer even when its CRC check
/// fails, so the caller can resynchronise on the next one.
pub fn decode_frame(src: &mut BytesMut, config: &FrameConfig) -> Result<Option<Frame>> {
    let total = match frame_len(src)? {
        Some(total) => total,
        None => return Ok(None),
    };
    if src.len() < total {
        return Ok(None); // Need more data
    }

    let raw = src.split_to(total);
    let frame = parse_unchecked(&raw);
    if config.verify_crc {
        verify(&frame)?;
    }
    Ok(Some(frame))
}

fn frame_len(src: &[u8]) -> Result<Option<usize>> {
    if src.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let size = src[2] as usize;
    if size > MAX_PAYLOAD {
        return Err(FrameError::SizeOutOfRange {
            size,
            max: MAX_PAYLOAD,
        });
    }
    Ok(Some(FRAME_HEADER_SIZE + size))
}

// Caller guarantees `raw` is exactly one frame as sized by `frame_len`.
fn parse_unchecked(raw: &[u8]) -> Frame {
    let mut id = [0u8; 8];
    id.copy_from_slice(&raw[4..12]);
    let mut payload = BytesMut::with_capacity(MAX_PAYLOAD);
    payload.put_slice(&raw[FRAME_HEADER_SIZE..]);
    Frame {
        device_identifier: u64::from_le_bytes(id),
        crc: u16::from_le_bytes([raw[0], raw[1]]),
        flags: raw[3],
        payload,
    }
}

fn verify(frame: &Frame) -> Result<()> {
    let computed = frame.compute_crc();
    if computed != frame.crc {
        return Err(FrameError::CrcMismatch {
            stored: frame.crc,
            computed,
        });
    }
    Ok(())
}

/// Configuration for stream framing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Reject frames whose stored CRC does not match. Default: true.
    pub verify_crc: bool,
    /// Skip over frames that fail the CRC check instead of returning an
    /// error. Default: false.
    pub skip_invalid: bool,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            verify_crc: true,
            skip_invalid: false,
        }
    }
}
