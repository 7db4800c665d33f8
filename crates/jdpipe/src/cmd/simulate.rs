//! Two nodes on an in-memory bus: a client streams bytes through the
//! echo service hosted by a server and checks what comes back.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use jdpipe_frame::{Packet, PipeOpen};
use jdpipe_node::{
    EchoService, EchoStatus, Meta, Node, NodeConfig, PipeSink, RetryPolicy, Service, CMD_OPEN,
    ECHO_SERVICE_CLASS,
};
use jdpipe_transport::loopback::DEFAULT_INBOX_DEPTH;
use jdpipe_transport::LoopbackBus;
use serde::{Deserialize, Serialize};

use crate::cmd::SimulateArgs;
use crate::exit::{io_error, node_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_json, print_table, OutputFormat};

const SERVER_ID: u64 = 0x5345_5256_0000_0001;
const CLIENT_ID: u64 = 0x434c_4e54_0000_0002;

/// Class the client advertises for its reply watcher.
const WATCHER_CLASS: u32 = 0x1f0c_a11e;

/// Overrides read from `--config`. Durations are in milliseconds.
#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct SimConfig {
    send_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    initial_backoff_ms: Option<u64>,
    backoff_limit_ms: Option<u64>,
    rx_queue_depth: Option<usize>,
    max_input_pipes: Option<usize>,
    max_output_pipes: Option<usize>,
    inbox_depth: Option<usize>,
    chunk_size: Option<usize>,
    timeout_ms: Option<u64>,
}

impl SimConfig {
    fn load(path: &Path) -> CliResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| io_error(&format!("failed reading {}", path.display()), err))?;
        serde_json::from_str(&text).map_err(|err| {
            CliError::new(USAGE, format!("invalid config {}: {err}", path.display()))
        })
    }

    fn node_config(&self, device_id: u64) -> NodeConfig {
        let defaults = NodeConfig::default();
        let ms = Duration::from_millis;
        NodeConfig {
            device_id,
            rx_queue_depth: self.rx_queue_depth.unwrap_or(defaults.rx_queue_depth),
            send_timeout: self.send_timeout_ms.map_or(defaults.send_timeout, ms),
            poll_interval: self.poll_interval_ms.map_or(Duration::from_millis(1), ms),
            max_input_pipes: self.max_input_pipes.unwrap_or(defaults.max_input_pipes),
            max_output_pipes: self.max_output_pipes.unwrap_or(defaults.max_output_pipes),
            retry: RetryPolicy {
                initial_backoff: self
                    .initial_backoff_ms
                    .map_or(defaults.retry.initial_backoff, ms),
                backoff_limit: self
                    .backoff_limit_ms
                    .map_or(defaults.retry.backoff_limit, ms),
            },
            ..defaults
        }
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size.unwrap_or(256).max(1)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(10_000))
    }
}

#[derive(Serialize, Debug)]
struct SimReport {
    bytes_sent: usize,
    bytes_received: usize,
    bytes_echoed: u64,
    matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_error: Option<i32>,
    frames_sent: u64,
    frames_dropped: u64,
    inbox_overflows: u64,
    elapsed_ms: u128,
}

/// Hands the port from the server's open reply to the waiting client.
struct OpenReply {
    tx: Sender<u16>,
    rx: Receiver<u16>,
}

impl Default for OpenReply {
    fn default() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        Self { tx, rx }
    }
}

impl OpenReply {
    fn wait(&self, timeout: Duration) -> Option<u16> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Service for OpenReply {
    fn service_class(&self) -> u32 {
        WATCHER_CLASS
    }

    fn handle_packet(&self, _node: &Node, _packet: &Packet) {}

    fn observe(&self, _node: &Node, packet: &Packet) {
        if packet.device_identifier != SERVER_ID || packet.service_command != CMD_OPEN {
            return;
        }
        let Some(bytes) = packet.data.get(..2) else {
            return;
        };
        // Only the first reply counts.
        let _ = self.tx.try_send(u16::from_le_bytes([bytes[0], bytes[1]]));
    }
}

#[derive(Default)]
struct Received {
    data: Vec<u8>,
    status: Option<EchoStatus>,
}

/// Client input pipe: everything echoed back.
struct EchoedData {
    state: Mutex<Received>,
    eof_tx: Sender<()>,
    eof_rx: Receiver<()>,
}

impl Default for EchoedData {
    fn default() -> Self {
        let (eof_tx, eof_rx) = crossbeam_channel::bounded(1);
        Self {
            state: Mutex::new(Received::default()),
            eof_tx,
            eof_rx,
        }
    }
}

impl EchoedData {
    fn state(&self) -> MutexGuard<'_, Received> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for the close; returns what arrived either way.
    fn wait_eof(&self, timeout: Duration) -> (Received, bool) {
        let closed = self.eof_rx.recv_timeout(timeout).is_ok();
        (std::mem::take(&mut *self.state()), closed)
    }
}

impl PipeSink for EchoedData {
    fn on_data(&self, packet: &Packet) {
        self.state().data.extend_from_slice(&packet.data);
    }

    fn on_meta(&self, meta: Meta<'_>) {
        match meta {
            Meta::Data(packet) => self.state().status = EchoStatus::parse(&packet.data),
            Meta::Eof => {
                let _ = self.eof_tx.try_send(());
            }
        }
    }
}

pub fn run(args: SimulateArgs, format: OutputFormat) -> CliResult<i32> {
    let config = match &args.config {
        Some(path) => SimConfig::load(path)?,
        None => SimConfig::default(),
    };
    let payload = pattern(args.bytes);
    let report = simulate(&payload, args.drop_every, &config)?;
    print_report(&report, format);
    Ok(if report.matched { SUCCESS } else { FAILURE })
}

fn simulate(payload: &[u8], drop_every: Option<u64>, config: &SimConfig) -> CliResult<SimReport> {
    let started = Instant::now();
    let timeout = config.timeout();
    let bus = LoopbackBus::with_inbox_depth(config.inbox_depth.unwrap_or(DEFAULT_INBOX_DEPTH));

    let echo = Arc::new(EchoService::new().map_err(|err| node_error("echo service", err))?);
    let server = Node::builder(Arc::new(bus.attach()))
        .config(config.node_config(SERVER_ID))
        .service(echo.clone())
        .build()
        .map_err(|err| node_error("server node", err))?;
    let reply = Arc::new(OpenReply::default());
    let client = Node::builder(Arc::new(bus.attach()))
        .config(config.node_config(CLIENT_ID))
        .service(reply.clone())
        .build()
        .map_err(|err| node_error("client node", err))?;
    let _server_task = server.spawn().map_err(|err| node_error("server task", err))?;
    let _client_task = client.spawn().map_err(|err| node_error("client task", err))?;

    let echoed = Arc::new(EchoedData::default());
    let input = client
        .open_input_pipe(echoed.clone())
        .map_err(|err| node_error("client input pipe", err))?;
    let open = PipeOpen {
        device_identifier: CLIENT_ID,
        port: input.port(),
    };
    client
        .send_class_command(ECHO_SERVICE_CLASS, CMD_OPEN, &open.encode())
        .map_err(|err| node_error("open command", err))?;
    let port = reply
        .wait(timeout)
        .ok_or_else(|| CliError::new(TIMEOUT, "echo service did not answer the open command"))?;
    tracing::info!(port, "echo connection open");

    // The open exchange is not acknowledged, so losses start afterwards.
    if let Some(nth) = drop_every {
        bus.drop_every(nth);
    }

    let output = client
        .open_output_pipe(SERVER_ID, port)
        .map_err(|err| node_error("client output pipe", err))?;
    for chunk in payload.chunks(config.chunk_size()) {
        output
            .write(chunk)
            .and_then(|()| output.flush())
            .map_err(|err| node_error("pipe write", err))?;
    }
    output.close().map_err(|err| node_error("pipe close", err))?;

    let (received, closed) = echoed.wait_eof(timeout);
    if !closed {
        tracing::warn!(received = received.data.len(), "echo side never closed");
    }
    let stats = bus.stats();
    Ok(SimReport {
        bytes_sent: payload.len(),
        bytes_received: received.data.len(),
        bytes_echoed: echo.bytes_echoed(),
        matched: closed && received.status.is_none() && received.data == payload,
        status_error: received.status.map(|status| status.error),
        frames_sent: stats.frames_sent,
        frames_dropped: stats.frames_dropped,
        inbox_overflows: stats.inbox_overflows,
        elapsed_ms: started.elapsed().as_millis(),
    })
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) + 7) as u8).collect()
}

fn print_report(report: &SimReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Table => {
            let rows = report_fields(report)
                .into_iter()
                .map(|(key, value)| vec![key.to_string(), value])
                .collect();
            print_table(&["FIELD", "VALUE"], rows);
        }
        OutputFormat::Pretty => {
            let line: Vec<String> = report_fields(report)
                .into_iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect();
            println!("{}", line.join(" "));
        }
    }
}

fn report_fields(report: &SimReport) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("bytes_sent", report.bytes_sent.to_string()),
        ("bytes_received", report.bytes_received.to_string()),
        ("bytes_echoed", report.bytes_echoed.to_string()),
        ("matched", report.matched.to_string()),
    ];
    if let Some(error) = report.status_error {
        fields.push(("status_error", error.to_string()));
    }
    fields.extend([
        ("frames_sent", report.frames_sent.to_string()),
        ("frames_dropped", report.frames_dropped.to_string()),
        ("inbox_overflows", report.inbox_overflows.to_string()),
        ("elapsed_ms", report.elapsed_ms.to_string()),
    ]);
    fields
}
