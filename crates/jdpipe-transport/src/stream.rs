use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use jdpipe_frame::{Frame, FrameConfig, FrameError, FrameReader, FrameWriter};

use crate::error::Result;
use crate::traits::Transport;

/// Frames carried over a byte stream such as a serial bridge.
///
/// A background thread decodes incoming frames (skipping corrupt ones)
/// into a fixed-depth inbox; sends are written synchronously.
///
/// The reader thread owns the read half. It exits at EOF, on a read
/// error, or at the first frame decoded after the transport is dropped.
/// A read blocked on a silent peer cannot be interrupted, so dropping
/// the transport before EOF detaches the thread instead of joining it;
/// give the reader a read timeout when that matters.
pub struct StreamTransport<W: Write> {
    writer: Mutex<FrameWriter<W>>,
    inbox: Receiver<Frame>,
    closed: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
}

impl<W: Write + Send> StreamTransport<W> {
    /// Start the reader thread for `reader` and wrap `writer`.
    pub fn spawn<R>(reader: R, writer: W, inbox_depth: usize) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let (inbox_tx, inbox) = crossbeam_channel::bounded(inbox_depth.max(1));
        let closed = Arc::new(AtomicBool::new(false));
        let config = FrameConfig {
            skip_invalid: true,
            ..FrameConfig::default()
        };

        let reader_thread = {
            let closed = Arc::clone(&closed);
            thread::Builder::new()
                .name("jdpipe-stream-rx".into())
                .spawn(move || read_loop(FrameReader::with_config(reader, config), &inbox_tx, &closed))?
        };

        Ok(Self {
            writer: Mutex::new(FrameWriter::new(writer)),
            inbox,
            closed,
            reader_thread: Some(reader_thread),
        })
    }

    /// True once the read side hit EOF or an I/O error.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn read_loop<R: Read>(mut reader: FrameReader<R>, inbox: &Sender<Frame>, closed: &AtomicBool) {
    loop {
        match reader.next_frame() {
            Ok(Some(frame)) => match inbox.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("stream inbox full, frame dropped");
                }
                Err(TrySendError::Disconnected(_)) => {
                    tracing::debug!("stream transport dropped, reader exiting");
                    break;
                }
            },
            Ok(None) => {
                tracing::debug!("stream closed by peer");
                break;
            }
            Err(FrameError::ConnectionClosed) => {
                tracing::debug!("stream closed mid-frame");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "stream read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::Release);
}

impl<W: Write + Send> Transport for StreamTransport<W> {
    fn send(&self, frame: Frame, _timeout: Duration) -> bool {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        match writer.write_frame(&frame) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "stream write failed, frame dropped");
                false
            }
        }
    }

    fn receive(&self) -> Option<Frame> {
        self.inbox.try_recv().ok()
    }
}

impl<W: Write> Drop for StreamTransport<W> {
    fn drop(&mut self) {
        // A reader blocked in read() is detached; join only once it has exited.
        if let Some(handle) = self.reader_thread.take() {
            if self.closed.load(Ordering::Acquire) {
                let _ = handle.join();
            }
        }
    }
}
