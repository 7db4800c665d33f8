//! Tables of open pipes.
//!
//! Input pipes are looked up by port when pipe packets arrive; output
//! pipes register an ack waiter that CRC-ACK packets are matched against.
//! Locks are held only for table access: sink callbacks and waiter wakeups
//! happen after the entry has been read out.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jdpipe_frame::{Packet, PipeCommand, CRC_ACK, MAX_PORT};
use rand::Rng;

use crate::error::{NodeError, Result};
use crate::ipipe::{Meta, PipeSink};
use crate::notify::Notify;
use crate::slots::{SlotArena, SlotId};

/// Supplies candidate ports for new input pipes.
pub trait PortSource: Send {
    fn next_port(&mut self) -> u16;
}

impl<F> PortSource for F
where
    F: FnMut() -> u16 + Send,
{
    fn next_port(&mut self) -> u16 {
        self()
    }
}

/// Uniformly random ports from the thread RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPorts;

impl PortSource for RandomPorts {
    fn next_port(&mut self) -> u16 {
        rand::thread_rng().gen_range(0..=MAX_PORT)
    }
}

struct InputEntry {
    /// Port plus the counter of the next packet to accept.
    expected: PipeCommand,
    sink: Arc<dyn PipeSink>,
}

struct AckWaiter {
    device: u64,
    armed: Option<u16>,
    notify: Arc<Notify>,
}

pub struct PipeRegistry {
    inputs: Mutex<SlotArena<InputEntry>>,
    outputs: Mutex<SlotArena<AckWaiter>>,
    ports: Mutex<Box<dyn PortSource>>,
    port_attempts: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipeRegistry {
    pub fn new(max_inputs: usize, max_outputs: usize) -> Self {
        Self {
            inputs: Mutex::new(SlotArena::with_capacity(max_inputs)),
            outputs: Mutex::new(SlotArena::with_capacity(max_outputs)),
            ports: Mutex::new(Box::new(RandomPorts)),
            port_attempts: 64,
        }
    }

    pub fn with_port_source(mut self, source: Box<dyn PortSource>) -> Self {
        self.ports = Mutex::new(source);
        self
    }

    pub fn with_port_attempts(mut self, attempts: u32) -> Self {
        self.port_attempts = attempts.max(1);
        self
    }

    /// Register an input pipe on a fresh port.
    ///
    /// Port 0 and ports already in use are redrawn.
    pub fn open_input(&self, sink: Arc<dyn PipeSink>) -> Result<(SlotId, u16)> {
        let mut ports = lock(&self.ports);
        let mut inputs = lock(&self.inputs);
        if inputs.is_full() {
            return Err(NodeError::RegistryFull {
                kind: "input",
                capacity: inputs.capacity(),
            });
        }

        for _ in 0..self.port_attempts {
            let port = ports.next_port() & MAX_PORT;
            if port == 0 || inputs.iter().any(|(_, entry)| entry.expected.port() == port) {
                tracing::trace!(port, "port unavailable, drawing again");
                continue;
            }
            let entry = InputEntry {
                expected: PipeCommand::new(port),
                sink,
            };
            let id = inputs.insert(entry).map_err(|_| NodeError::RegistryFull {
                kind: "input",
                capacity: inputs.capacity(),
            })?;
            tracing::debug!(port, "input pipe opened");
            return Ok((id, port));
        }
        Err(NodeError::NoFreePort(self.port_attempts))
    }

    /// Free an input pipe. False when it was already gone.
    pub fn close_input(&self, id: SlotId) -> bool {
        lock(&self.inputs).remove(id).is_some()
    }

    pub fn input_open(&self, id: SlotId) -> bool {
        lock(&self.inputs).contains(id)
    }

    pub fn open_inputs(&self) -> usize {
        lock(&self.inputs).len()
    }

    /// Ports of all open input pipes.
    pub fn input_ports(&self) -> Vec<u16> {
        lock(&self.inputs)
            .iter()
            .map(|(_, entry)| entry.expected.port())
            .collect()
    }

    /// Route a packet addressed to the pipe service.
    ///
    /// Only the packet carrying the expected counter is accepted; replays
    /// and gaps are dropped. A close-flagged packet is delivered, followed
    /// by [`Meta::Eof`], and the pipe is freed. Returns true when the
    /// packet was accepted.
    pub fn handle_input_packet(&self, packet: &Packet) -> bool {
        let command = packet.pipe_command();
        let (id, sink) = {
            let mut inputs = lock(&self.inputs);
            let Some((id, entry)) = inputs
                .iter_mut()
                .find(|(_, entry)| entry.expected.port() == command.port())
            else {
                tracing::trace!(%command, "no input pipe on port");
                return false;
            };
            if entry.expected.counter() != command.counter() {
                tracing::trace!(
                    %command,
                    expected = entry.expected.counter(),
                    "out of sequence pipe packet dropped"
                );
                return false;
            }
            entry.expected = entry.expected.advance();
            (id, Arc::clone(&entry.sink))
        };

        if command.is_meta() {
            sink.on_meta(Meta::Data(packet));
        } else {
            sink.on_data(packet);
        }
        if command.is_close() {
            sink.on_meta(Meta::Eof);
            // The generation check makes this a no-op if a handler closed it.
            self.close_input(id);
            tracing::debug!(port = command.port(), "input pipe closed by sender");
        }
        true
    }

    /// Register the ack waiter of an output pipe to `device`.
    pub fn register_output(&self, device: u64) -> Result<(SlotId, Arc<Notify>)> {
        let notify = Arc::new(Notify::new());
        let waiter = AckWaiter {
            device,
            armed: None,
            notify: Arc::clone(&notify),
        };
        let mut outputs = lock(&self.outputs);
        let capacity = outputs.capacity();
        let id = outputs.insert(waiter).map_err(|_| NodeError::RegistryFull {
            kind: "output",
            capacity,
        })?;
        Ok((id, notify))
    }

    pub fn unregister_output(&self, id: SlotId) -> bool {
        lock(&self.outputs).remove(id).is_some()
    }

    pub fn open_outputs(&self) -> usize {
        lock(&self.outputs).len()
    }

    /// Expect an ack for `crc`, discarding wakeups left from earlier waits.
    pub fn arm(&self, id: SlotId, crc: u16) {
        if let Some(waiter) = lock(&self.outputs).get_mut(id) {
            waiter.armed = Some(crc);
            waiter.notify.clear();
        }
    }

    pub fn disarm(&self, id: SlotId) {
        if let Some(waiter) = lock(&self.outputs).get_mut(id) {
            waiter.armed = None;
        }
    }

    /// Wake the output pipes waiting for this ack. Returns how many woke.
    pub fn process_ack(&self, packet: &Packet) -> usize {
        if packet.service_number != CRC_ACK {
            return 0;
        }
        let outputs = lock(&self.outputs);
        let mut woken = 0;
        for (_, waiter) in outputs.iter() {
            if waiter.armed == Some(packet.service_command) && waiter.device == packet.device_identifier
            {
                waiter.notify.give();
                woken += 1;
            }
        }
        if woken == 0 {
            tracing::trace!(
                crc = format_args!("{:04x}", packet.service_command),
                "unmatched ack"
            );
        }
        woken
    }
}
