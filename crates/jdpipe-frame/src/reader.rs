use std::io::{ErrorKind, Read};

use bytes::{Buf, BytesMut};

use crate::codec::{decode_frame, Frame, FrameConfig, FRAME_HEADER_SIZE, MAX_PAYLOAD};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 4 * (FRAME_HEADER_SIZE + MAX_PAYLOAD);
const READ_CHUNK_SIZE: usize = 1024;

/// Reads complete frames from any `Read` stream.
///
/// Frames are delimited by their own size field, which is how a host
/// bridge (serial adapter, capture file) carries them without break
/// detection. Handles partial reads internally.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        self.next_frame()?.ok_or(FrameError::ConnectionClosed)
    }

    /// Read the next frame, or `None` on EOF at a frame boundary.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match decode_frame(&mut self.buf, &self.config) {
                Ok(Some(frame)) => return Ok(Some(frame)),
                Ok(None) => {}
                Err(err @ FrameError::CrcMismatch { .. }) if self.config.skip_invalid => {
                    tracing::debug!(error = %err, "skipping corrupt frame");
                    continue;
                }
                Err(err @ FrameError::SizeOutOfRange { .. }) if self.config.skip_invalid => {
                    tracing::debug!(error = %err, "resynchronising frame stream");
                    self.buf.advance(1);
                    continue;
                }
                Err(err) => return Err(err),
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
