use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use jdpipe_frame::{Packet, PipeOpen, CMD_ADVERTISEMENT_DATA, CMD_EVENT, CONTROL};
use jdpipe_node::{
    EchoService, EchoStatus, Meta, Node, NodeConfig, NodeError, PipeSink, RetryPolicy, Service,
    CMD_OPEN, ECHO_SERVICE_CLASS,
};
use jdpipe_transport::LoopbackBus;

const SERVER: u64 = 0x5e5e_0000_0000_0001;
const CLIENT: u64 = 0xc1c1_0000_0000_0002;
const WAIT: Duration = Duration::from_secs(10);

fn config(device_id: u64) -> NodeConfig {
    NodeConfig {
        device_id,
        poll_interval: Duration::from_millis(1),
        retry: RetryPolicy {
            initial_backoff: Duration::from_millis(20),
            backoff_limit: Duration::from_secs(3),
        },
        ..NodeConfig::default()
    }
}

#[derive(Debug, Clone)]
struct Report {
    device: u64,
    service_number: u8,
    command: u16,
    data: Vec<u8>,
}

/// Forwards every report seen on the bus.
struct Watcher {
    reports: Mutex<Sender<Report>>,
}

impl Watcher {
    fn new() -> (Arc<Self>, Receiver<Report>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(Self {
                reports: Mutex::new(tx),
            }),
            rx,
        )
    }
}

impl Service for Watcher {
    fn service_class(&self) -> u32 {
        0x0bad_f00d
    }

    fn handle_packet(&self, _node: &Node, _packet: &Packet) {}

    fn observe(&self, _node: &Node, packet: &Packet) {
        let report = Report {
            device: packet.device_identifier,
            service_number: packet.service_number,
            command: packet.service_command,
            data: packet.data.to_vec(),
        };
        let _ = self.reports.lock().expect("reports lock").send(report);
    }
}

fn next_report(rx: &Receiver<Report>, wanted: impl Fn(&Report) -> bool) -> Report {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let report = rx.recv_timeout(left).expect("report should arrive");
        if wanted(&report) {
            return report;
        }
    }
}

#[derive(Default)]
struct Collected {
    data: Vec<u8>,
    meta: Vec<Vec<u8>>,
    eof: bool,
}

/// Input pipe sink gathering everything into memory.
#[derive(Default)]
struct Collector {
    state: Mutex<Collected>,
    changed: Condvar,
}

impl Collector {
    fn wait_eof(&self) -> Collected {
        let deadline = Instant::now() + WAIT;
        let mut state = self.state.lock().expect("collector lock");
        while !state.eof {
            let left = deadline.saturating_duration_since(Instant::now());
            assert!(!left.is_zero(), "pipe should reach eof");
            state = self
                .changed
                .wait_timeout(state, left)
                .expect("collector lock")
                .0;
        }
        std::mem::take(&mut *state)
    }
}

impl PipeSink for Collector {
    fn on_data(&self, packet: &Packet) {
        self.state
            .lock()
            .expect("collector lock")
            .data
            .extend_from_slice(&packet.data);
    }

    fn on_meta(&self, meta: Meta<'_>) {
        let mut state = self.state.lock().expect("collector lock");
        match meta {
            Meta::Data(packet) => state.meta.push(packet.data.to_vec()),
            Meta::Eof => state.eof = true,
        }
        drop(state);
        self.changed.notify_all();
    }
}

struct Pair {
    bus: LoopbackBus,
    echo: Arc<EchoService>,
    server: Node,
    client: Node,
    reports: Receiver<Report>,
    _tasks: Vec<jdpipe_node::NodeTask>,
}

fn pair() -> Pair {
    let bus = LoopbackBus::new();
    let echo = Arc::new(EchoService::new().expect("echo service should start"));
    let server = Node::builder(Arc::new(bus.attach()))
        .config(config(SERVER))
        .service(echo.clone())
        .build()
        .expect("server should build");
    let (watcher, reports) = Watcher::new();
    let client = Node::builder(Arc::new(bus.attach()))
        .config(config(CLIENT))
        .service(watcher)
        .build()
        .expect("client should build");
    let tasks = vec![
        server.spawn().expect("server task"),
        client.spawn().expect("client task"),
    ];
    Pair {
        bus,
        echo,
        server,
        client,
        reports,
        _tasks: tasks,
    }
}

/// Open an echo connection; returns the client's input sink and the
/// server's input port.
fn connect(pair: &Pair) -> (Arc<Collector>, jdpipe_node::InputPipe, u16) {
    let collector = Arc::new(Collector::default());
    let input = pair
        .client
        .open_input_pipe(collector.clone())
        .expect("client input pipe");
    let open = PipeOpen {
        device_identifier: CLIENT,
        port: input.port(),
    };
    pair.client
        .send_class_command(ECHO_SERVICE_CLASS, CMD_OPEN, &open.encode())
        .expect("open command");

    let reply = next_report(&pair.reports, |r| r.device == SERVER && r.command == CMD_OPEN);
    assert_eq!(reply.service_number, 1);
    let port = u16::from_le_bytes([reply.data[0], reply.data[1]]);
    (collector, input, port)
}

#[test]
fn echo_round_trip() {
    let pair = pair();
    let (collector, _input, port) = connect(&pair);

    let output = pair
        .client
        .open_output_pipe(SERVER, port)
        .expect("client output pipe");
    let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    output.write(&payload).expect("write");
    output.flush().expect("flush");
    output.close().expect("close");

    let collected = collector.wait_eof();
    assert_eq!(collected.data, payload);
    assert!(collected.meta.is_empty());
    assert_eq!(pair.echo.bytes_echoed(), payload.len() as u64);
}

#[test]
fn echo_survives_lossy_bus() {
    let pair = pair();
    let (collector, _input, port) = connect(&pair);
    pair.bus.drop_every(4);

    let output = pair
        .client
        .open_output_pipe(SERVER, port)
        .expect("client output pipe");
    let payload: Vec<u8> = (0..3000u32).map(|i| (i * 13) as u8).collect();
    for chunk in payload.chunks(500) {
        output.write(chunk).expect("write");
        output.flush().expect("flush despite losses");
    }
    output.close().expect("close");

    let collected = collector.wait_eof();
    assert_eq!(collected.data, payload);
    assert!(pair.bus.stats().frames_dropped > 0);
}

#[test]
fn metadata_command_is_rejected_and_closed() {
    let pair = pair();
    let (collector, _input, port) = connect(&pair);

    let output = pair
        .client
        .open_output_pipe(SERVER, port)
        .expect("client output pipe");
    output.write_meta(b"hi").expect("write meta");
    output.flush().expect("flush");

    let collected = collector.wait_eof();
    assert_eq!(collected.meta.len(), 1);
    let status = EchoStatus::parse(&collected.meta[0]).expect("status layout");
    assert_eq!(status.error, jdpipe_node::echo::ERROR_MALFORMED_COMMAND);

    let deadline = Instant::now() + WAIT;
    while pair.echo.connections() > 0 {
        assert!(Instant::now() < deadline, "connection should be dropped");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn flush_to_absent_device_resets() {
    let bus = LoopbackBus::new();
    let node = Node::builder(Arc::new(bus.attach()))
        .config(NodeConfig {
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(2),
                backoff_limit: Duration::from_millis(20),
            },
            ..config(CLIENT)
        })
        .build()
        .expect("node should build");
    let _task = node.spawn().expect("task");

    let output = node
        .open_output_pipe(0xdead_beef, 7)
        .expect("output pipe");
    output.write(b"anyone?").expect("write");
    let err = output.flush().unwrap_err();
    assert!(matches!(err, NodeError::Reset { device: 0xdead_beef }));
    assert_eq!(node.registry().open_outputs(), 0);
    // 2, 4, 8, 16 ms
    assert_eq!(bus.stats().frames_sent, 4);
}

#[test]
fn advertisement_request_is_answered_over_bus() {
    let pair = pair();
    pair.client
        .send_command(SERVER, CONTROL, CMD_ADVERTISEMENT_DATA, &[])
        .expect("request");

    let report = next_report(&pair.reports, |r| {
        r.device == SERVER && r.service_number == CONTROL && r.command == CMD_ADVERTISEMENT_DATA
    });
    let mut expected = 0u32.to_le_bytes().to_vec();
    expected.extend_from_slice(&ECHO_SERVICE_CLASS.to_le_bytes());
    assert_eq!(report.data, expected);
}

#[test]
fn events_are_broadcast() {
    let pair = pair();
    pair.server.send_event(1, 0x0042, 7).expect("event");

    let report = next_report(&pair.reports, |r| r.device == SERVER && r.command == CMD_EVENT);
    assert_eq!(report.data, [0x42, 0, 0, 0, 7, 0, 0, 0]);

    let err = pair.server.send_event(1, 0x1_0000, 0).unwrap_err();
    assert!(matches!(err, NodeError::InvalidEvent(0x1_0000)));
}

#[test]
fn input_ports_stay_unique_across_many_opens() {
    let bus = LoopbackBus::new();
    let node = Node::builder(Arc::new(bus.attach()))
        .config(NodeConfig {
            max_input_pipes: 300,
            ..config(CLIENT)
        })
        .build()
        .expect("node should build");

    let pipes: Vec<_> = (0..300)
        .map(|_| {
            node.open_input_pipe(Arc::new(Collector::default()))
                .expect("open")
        })
        .collect();
    let mut ports: Vec<u16> = pipes.iter().map(|pipe| pipe.port()).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 300);
}

#[test]
fn colliding_port_draw_is_retried() {
    let bus = LoopbackBus::new();
    let mut draws = vec![12u16, 12, 12, 99].into_iter();
    let node = Node::builder(Arc::new(bus.attach()))
        .config(config(CLIENT))
        .port_source(Box::new(move || draws.next().unwrap_or(0)))
        .build()
        .expect("node should build");

    let first = node
        .open_input_pipe(Arc::new(Collector::default()))
        .expect("first");
    let second = node
        .open_input_pipe(Arc::new(Collector::default()))
        .expect("second");
    assert_eq!(first.port(), 12);
    assert_eq!(second.port(), 99);
}
