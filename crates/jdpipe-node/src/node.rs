use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use jdpipe_frame::{
    Frame, Packet, CMD_ADVERTISEMENT_DATA, CMD_EVENT, CONTROL, FLAG_COMMAND,
    FLAG_IDENTIFIER_IS_SERVICE_CLASS, MAX_PACKET_DATA,
};
use jdpipe_transport::Transport;

use crate::config::NodeConfig;
use crate::dispatch;
use crate::error::{NodeError, Result};
use crate::ipipe::{InputPipe, PipeSink};
use crate::opipe::OutputPipe;
use crate::registry::{PipeRegistry, PortSource};
use crate::rxq::RxQueue;
use crate::txq::TxQueue;

/// Highest service number a hosted service may occupy.
const MAX_SERVICE_NUMBER: usize = 0x3b;

/// A service hosted on a node.
///
/// Services occupy service numbers 1.. in registration order; number 0
/// is the node's own control service. All hooks run on the dispatch task.
pub trait Service: Send + Sync {
    /// 32-bit class advertised for this service.
    fn service_class(&self) -> u32;

    /// A command addressed to this service.
    fn handle_packet(&self, node: &Node, packet: &Packet);

    /// A report broadcast by any device.
    fn observe(&self, node: &Node, packet: &Packet) {
        let _ = (node, packet);
    }

    /// Periodic work, once per dispatch iteration.
    fn process(&self, node: &Node) {
        let _ = node;
    }
}

pub(crate) struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) tx: Arc<TxQueue>,
    pub(crate) rx: RxQueue,
    pub(crate) registry: Arc<PipeRegistry>,
    pub(crate) services: Vec<Arc<dyn Service>>,
}

/// One device on the bus.
///
/// Cloning is cheap and yields another handle to the same node.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

/// Builder for [`Node`].
pub struct NodeBuilder {
    transport: Arc<dyn Transport>,
    config: NodeConfig,
    services: Vec<Arc<dyn Service>>,
    ports: Option<Box<dyn PortSource>>,
}

impl NodeBuilder {
    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn device_id(mut self, device_id: u64) -> Self {
        self.config.device_id = device_id;
        self
    }

    /// Host a service at the next free service number.
    pub fn service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Replace the random port source of the input pipe table.
    pub fn port_source(mut self, ports: Box<dyn PortSource>) -> Self {
        self.ports = Some(ports);
        self
    }

    pub fn build(self) -> Result<Node> {
        // The advertisement lists every class (control included) in one packet.
        let advertised = (self.services.len() + 1) * 4;
        if self.services.len() > MAX_SERVICE_NUMBER || advertised > MAX_PACKET_DATA {
            return Err(NodeError::TooManyServices(self.services.len()));
        }

        let config = self.config;
        let mut registry = PipeRegistry::new(config.max_input_pipes, config.max_output_pipes)
            .with_port_attempts(config.port_attempts);
        if let Some(ports) = self.ports {
            registry = registry.with_port_source(ports);
        }
        let tx = TxQueue::new(
            config.device_id,
            Arc::clone(&self.transport),
            config.send_timeout,
        );

        tracing::debug!(
            device = format_args!("{:016x}", config.device_id),
            services = self.services.len(),
            "node built"
        );
        Ok(Node {
            inner: Arc::new(NodeInner {
                rx: RxQueue::new(config.rx_queue_depth),
                tx: Arc::new(tx),
                registry: Arc::new(registry),
                transport: self.transport,
                services: self.services,
                config,
            }),
        })
    }
}

impl Node {
    pub fn builder(transport: Arc<dyn Transport>) -> NodeBuilder {
        NodeBuilder {
            transport,
            config: NodeConfig::default(),
            services: Vec::new(),
            ports: None,
        }
    }

    pub fn device_id(&self) -> u64 {
        self.inner.config.device_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Hosted services, indexed by service number minus one.
    pub fn services(&self) -> &[Arc<dyn Service>] {
        &self.inner.services
    }

    /// Service number of the first hosted service of `class`.
    pub fn service_number(&self, class: u32) -> Option<u8> {
        if class == 0 {
            return Some(CONTROL);
        }
        self.inner
            .services
            .iter()
            .position(|service| service.service_class() == class)
            .map(|index| (index + 1) as u8)
    }

    /// Queue a fire-and-forget report from this node.
    pub fn send(&self, service_number: u8, service_command: u16, data: &[u8]) -> Result<()> {
        self.inner.tx.push(service_number, service_command, data)
    }

    /// Report an event: `[event_id u32 LE, arg u32 LE]` on the event command.
    pub fn send_event(&self, service_number: u8, event_id: u32, arg: u32) -> Result<()> {
        if event_id >> 16 != 0 {
            return Err(NodeError::InvalidEvent(event_id));
        }
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&event_id.to_le_bytes());
        data[4..].copy_from_slice(&arg.to_le_bytes());
        self.send(service_number, CMD_EVENT, &data)
    }

    /// Advertise the hosted service classes on the control service.
    pub fn announce(&self) -> Result<()> {
        let mut data = Vec::with_capacity((self.inner.services.len() + 1) * 4);
        data.extend_from_slice(&0u32.to_le_bytes());
        for service in &self.inner.services {
            data.extend_from_slice(&service.service_class().to_le_bytes());
        }
        self.send(CONTROL, CMD_ADVERTISEMENT_DATA, &data)
    }

    /// Send a single command frame to another device.
    pub fn send_command(
        &self,
        device: u64,
        service_number: u8,
        service_command: u16,
        data: &[u8],
    ) -> Result<()> {
        self.send_command_frame(device, FLAG_COMMAND, service_number, service_command, data)
    }

    /// Send a command to whichever device hosts a service of `class`.
    pub fn send_class_command(&self, class: u32, service_command: u16, data: &[u8]) -> Result<()> {
        self.send_command_frame(
            u64::from(class),
            FLAG_COMMAND | FLAG_IDENTIFIER_IS_SERVICE_CLASS,
            0,
            service_command,
            data,
        )
    }

    fn send_command_frame(
        &self,
        device: u64,
        flags: u8,
        service_number: u8,
        service_command: u16,
        data: &[u8],
    ) -> Result<()> {
        let mut frame = Frame::new(device, flags);
        if !frame.push_in_frame(service_number, service_command, data) {
            return Err(NodeError::PacketTooLarge {
                size: data.len(),
                max: MAX_PACKET_DATA,
            });
        }
        frame.seal();
        self.inner.tx.push_frame(frame);
        Ok(())
    }

    /// Seal and send whatever reports are staged.
    pub fn flush(&self) {
        self.inner.tx.flush();
    }

    pub fn is_tx_idle(&self) -> bool {
        self.inner.tx.is_idle()
    }

    /// Open a pipe to `port` on `device`.
    pub fn open_output_pipe(&self, device: u64, port: u16) -> Result<OutputPipe> {
        OutputPipe::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.tx),
            self.inner.config.retry,
            device,
            port,
        )
    }

    /// Open an input pipe delivering into `sink`.
    pub fn open_input_pipe(&self, sink: Arc<dyn PipeSink>) -> Result<InputPipe> {
        let (id, port) = self.inner.registry.open_input(sink)?;
        Ok(InputPipe::new(Arc::clone(&self.inner.registry), id, port))
    }

    pub fn registry(&self) -> &PipeRegistry {
        &self.inner.registry
    }

    /// Hand a received frame to the dispatch task. Never blocks.
    pub fn frame_received(&self, frame: Frame) -> bool {
        self.inner.rx.frame_received(frame)
    }

    /// Route every packet of one frame.
    pub fn process_frame(&self, frame: Frame) {
        dispatch::process_frame(self, frame);
    }

    /// One dispatch iteration.
    ///
    /// Moves frames from the transport into the RX queue while it has
    /// room, processes at most one frame (waiting up to `timeout` for it),
    /// runs service `process` hooks and flushes staged reports. Returns
    /// true when a frame was processed.
    pub fn poll(&self, timeout: Duration) -> bool {
        while !self.inner.rx.is_full() {
            match self.inner.transport.receive() {
                Some(frame) => {
                    self.frame_received(frame);
                }
                None => break,
            }
        }
        let frame = self.inner.rx.next_frame(timeout);
        let processed = frame.is_some();
        if let Some(frame) = frame {
            self.process_frame(frame);
        }
        for service in &self.inner.services {
            service.process(self);
        }
        self.inner.tx.flush();
        processed
    }

    /// Run the dispatch loop on its own thread.
    pub fn spawn(&self) -> Result<NodeTask> {
        let stop = Arc::new(AtomicBool::new(false));
        let node = self.clone();
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("jdpipe-node-{:016x}", self.device_id()))
                .spawn(move || {
                    let interval = node.inner.config.poll_interval;
                    while !stop.load(Ordering::Acquire) {
                        node.poll(interval);
                    }
                })?
        };
        Ok(NodeTask {
            stop,
            handle: Some(handle),
        })
    }

    /// Frames lost to a refusing transport or a full RX queue.
    pub fn frames_dropped(&self) -> u64 {
        self.inner.tx.frames_dropped() + self.inner.rx.frames_dropped()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("device_id", &format_args!("{:016x}", self.device_id()))
            .field("services", &self.inner.services.len())
            .finish()
    }
}

/// Running dispatch thread; stops and joins on drop.
pub struct NodeTask {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NodeTask {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NodeTask {
    fn drop(&mut self) {
        self.shutdown();
    }
}
