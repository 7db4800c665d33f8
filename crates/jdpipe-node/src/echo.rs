//! Pipe-backed echo service.
//!
//! A client sends [`CMD_OPEN`] carrying a [`jdpipe_frame::PipeOpen`]
//! payload that names its own input pipe. The service opens an output
//! pipe back to it, opens an input pipe of its own and replies with that
//! port (u16 LE) on the same command. Everything the client writes is
//! written back; closing the client side closes the echo side.
//!
//! Metadata from the client is treated as a control message. None are
//! defined, so the service answers with an [`EchoStatus`] metadata packet
//! and closes the connection. A connection whose packet could not be
//! queued for the worker has lost data; it is closed the same way with
//! [`ERROR_OVERRUN`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use jdpipe_frame::Packet;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::ipipe::{InputPipe, Meta, PipeSink};
use crate::node::{Node, Service};
use crate::opipe::OutputPipe;
use crate::worker::Worker;

/// Class advertised by the echo service.
pub const ECHO_SERVICE_CLASS: u32 = 0x1e7c_4c03;

/// Open a connection; payload is a `PipeOpen`.
pub const CMD_OPEN: u16 = 0x80;

/// Status codes carried in [`EchoStatus::error`].
pub const ERROR_UNKNOWN_COMMAND: i32 = 1;
pub const ERROR_MALFORMED_COMMAND: i32 = 2;
pub const ERROR_OVERRUN: i32 = 3;

/// Metadata reported before the service closes a connection on error.
///
/// Layout: `tag u32 LE | error i32 LE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoStatus {
    pub tag: u32,
    pub error: i32,
}

impl EchoStatus {
    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.tag.to_le_bytes());
        out[4..].copy_from_slice(&self.error.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let tag = u32::from_le_bytes(data.get(0..4)?.try_into().ok()?);
        let error = i32::from_le_bytes(data.get(4..8)?.try_into().ok()?);
        Some(Self { tag, error })
    }
}

struct Connection {
    id: u64,
    output: Arc<OutputPipe>,
    _input: InputPipe,
}

struct EchoShared {
    worker: Worker,
    connections: Mutex<Vec<Connection>>,
    /// Connections that lost a packet to a full worker queue.
    overruns: Mutex<Vec<u64>>,
    next_id: AtomicU64,
    echoed: AtomicU64,
}

impl EchoShared {
    fn connections(&self) -> MutexGuard<'_, Vec<Connection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn overruns(&self) -> MutexGuard<'_, Vec<u64>> {
        self.overruns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn output(&self, id: u64) -> Option<Arc<OutputPipe>> {
        self.connections()
            .iter()
            .find(|conn| conn.id == id)
            .map(|conn| Arc::clone(&conn.output))
    }

    fn remove(&self, id: u64) -> Option<Connection> {
        let mut connections = self.connections();
        let index = connections.iter().position(|conn| conn.id == id)?;
        Some(connections.swap_remove(index))
    }

    fn echo(&self, id: u64, data: &[u8]) {
        let Some(output) = self.output(id) else {
            return;
        };
        match output.write(data).and_then(|()| output.flush()) {
            Ok(()) => {
                self.echoed.fetch_add(data.len() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::debug!(connection = id, error = %err, "echo failed, dropping connection");
                self.remove(id);
            }
        }
    }

    fn finish(&self, id: u64) {
        if let Some(conn) = self.remove(id) {
            tracing::debug!(connection = id, "echo connection finished");
            if let Err(err) = conn.output.close() {
                tracing::debug!(connection = id, error = %err, "close not acknowledged");
            }
        }
    }

    fn signal_error(&self, id: u64, error: i32) {
        tracing::debug!(connection = id, error, "echo connection error");
        if let Some(output) = self.output(id) {
            let status = EchoStatus { tag: 0, error };
            if let Err(err) = output.write_meta(&status.encode()) {
                tracing::debug!(connection = id, error = %err, "status not sent");
            }
        }
        self.finish(id);
    }

    fn mark_overrun(&self, id: u64) {
        let mut overruns = self.overruns();
        if !overruns.contains(&id) {
            overruns.push(id);
        }
    }

    fn is_overrun(&self, id: u64) -> bool {
        self.overruns().contains(&id)
    }

    /// Close every connection marked by [`Self::mark_overrun`]. Runs on
    /// the worker, never on the dispatch task.
    fn report_overruns(&self) {
        let ids = std::mem::take(&mut *self.overruns());
        for id in ids {
            self.signal_error(id, ERROR_OVERRUN);
        }
    }
}

/// Per-connection sink; hands every packet to the worker.
struct EchoSink {
    id: u64,
    shared: Weak<EchoShared>,
}

impl EchoSink {
    fn defer(&self, job: impl FnOnce(&EchoShared) + Send + 'static) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let id = self.id;
        let weak = Weak::clone(&self.shared);
        let queued = shared.worker.run(move || {
            if let Some(shared) = weak.upgrade() {
                // Packets after a lost one are not echoed.
                if !shared.is_overrun(id) {
                    job(&shared);
                }
            }
        });
        if queued.is_err() {
            // The packet is already acked; report the loss from the worker.
            shared.mark_overrun(id);
        }
    }
}

impl PipeSink for EchoSink {
    fn on_data(&self, packet: &Packet) {
        if packet.data.is_empty() {
            return;
        }
        let id = self.id;
        let data: Bytes = packet.data.clone();
        self.defer(move |shared| shared.echo(id, &data));
    }

    fn on_meta(&self, meta: Meta<'_>) {
        let id = self.id;
        match meta {
            Meta::Eof => self.defer(move |shared| shared.finish(id)),
            Meta::Data(packet) if packet.data.len() < 4 => {
                self.defer(move |shared| shared.signal_error(id, ERROR_MALFORMED_COMMAND))
            }
            Meta::Data(_) => {
                self.defer(move |shared| shared.signal_error(id, ERROR_UNKNOWN_COMMAND))
            }
        }
    }
}

/// Reference service echoing pipe data back to its sender.
pub struct EchoService {
    shared: Arc<EchoShared>,
}

impl EchoService {
    pub fn new() -> Result<Self> {
        Self::with_worker(WorkerConfig {
            name: "jdpipe-echo".to_string(),
            ..WorkerConfig::default()
        })
    }

    pub fn with_worker(config: WorkerConfig) -> Result<Self> {
        let shared = Arc::new(EchoShared {
            worker: Worker::spawn(config)?,
            connections: Mutex::new(Vec::new()),
            overruns: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            echoed: AtomicU64::new(0),
        });
        let weak = Arc::downgrade(&shared);
        shared.worker.set_idle(move || {
            if let Some(shared) = weak.upgrade() {
                shared.report_overruns();
            }
        });
        Ok(Self { shared })
    }

    /// Open connections.
    pub fn connections(&self) -> usize {
        self.shared.connections().len()
    }

    /// Bytes written back so far.
    pub fn bytes_echoed(&self) -> u64 {
        self.shared.echoed.load(Ordering::Relaxed)
    }

    fn open_connection(&self, node: &Node, packet: &Packet) -> Result<()> {
        let output = OutputPipe::open(node, packet)?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let sink = Arc::new(EchoSink {
            id,
            shared: Arc::downgrade(&self.shared),
        });
        let input = node.open_input_pipe(sink)?;
        let port = input.port();
        self.shared.connections().push(Connection {
            id,
            output: Arc::new(output),
            _input: input,
        });
        tracing::debug!(connection = id, port, "echo connection opened");
        node.send(packet.service_number, packet.service_command, &port.to_le_bytes())
    }
}

impl Service for EchoService {
    fn service_class(&self) -> u32 {
        ECHO_SERVICE_CLASS
    }

    fn handle_packet(&self, node: &Node, packet: &Packet) {
        match packet.service_command {
            CMD_OPEN => {
                if let Err(err) = self.open_connection(node, packet) {
                    tracing::warn!(error = %err, "echo open failed");
                }
            }
            command => tracing::trace!(command, "unknown echo command"),
        }
    }
}
