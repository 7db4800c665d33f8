//! Inbound packet routing.
//!
//! A frame is walked packet by packet. CRC-ACK packets feed the output
//! pipe waiters; reports go to every service's `observe` hook; commands
//! for this device (or for a class it hosts) go to the pipe registry or
//! to the addressed service.

use jdpipe_frame::{Frame, Packet, CMD_ADVERTISEMENT_DATA, CONTROL, CRC_ACK, PIPE};

use crate::node::Node;

pub(crate) fn process_frame(node: &Node, mut frame: Frame) {
    if frame.ack_requested() && frame.is_command() && frame.device_identifier == node.device_id() {
        // Ack before handling, which may take a while.
        if let Err(err) = node.inner.tx.push(CRC_ACK, frame.crc, &[]) {
            tracing::warn!(error = %err, "failed to queue ack");
        }
        node.inner.tx.flush();
    }

    loop {
        if let Some(packet) = frame.first_packet() {
            handle_packet(node, packet);
        }
        if !frame.shift_frame() {
            break;
        }
    }
}

fn handle_packet(node: &Node, mut packet: Packet) {
    node.inner.registry.process_ack(&packet);

    if !packet.is_command() {
        for service in &node.inner.services {
            service.observe(node, &packet);
        }
        return;
    }

    let mut matched = packet.device_identifier == node.device_id();
    if packet.targets_service_class() {
        let class = packet.device_identifier;
        if let Some(number) = u32::try_from(class)
            .ok()
            .and_then(|class| node.service_number(class))
        {
            packet.service_number = number;
            matched = true;
        }
    }
    if !matched {
        return;
    }

    tracing::trace!(
        service = packet.service_number,
        command = format_args!("{:#06x}", packet.service_command),
        size = packet.data.len(),
        "command"
    );

    match packet.service_number {
        CONTROL => handle_control(node, &packet),
        PIPE => {
            node.inner.registry.handle_input_packet(&packet);
        }
        number => match node.inner.services.get(usize::from(number).wrapping_sub(1)) {
            Some(service) => service.handle_packet(node, &packet),
            None => tracing::trace!(service = number, "no such service"),
        },
    }
}

fn handle_control(node: &Node, packet: &Packet) {
    match packet.service_command {
        CMD_ADVERTISEMENT_DATA => {
            if let Err(err) = node.announce() {
                tracing::warn!(error = %err, "announce failed");
            }
        }
        command => tracing::trace!(command, "unhandled control command"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use jdpipe_frame::{PipeCommand, FLAG_ACK_REQUESTED, FLAG_COMMAND, FLAG_IDENTIFIER_IS_SERVICE_CLASS};

    use super::*;
    use crate::node::Service;
    use crate::testutil::{Delivery, RecordingSink, RecordingTransport};

    const ME: u64 = 0x0102_0304_0506_0708;

    #[derive(Default)]
    struct Probe {
        class: u32,
        handled: Mutex<Vec<(u8, u16)>>,
        observed: Mutex<Vec<u64>>,
    }

    impl Service for Probe {
        fn service_class(&self) -> u32 {
            self.class
        }

        fn handle_packet(&self, _node: &Node, packet: &Packet) {
            self.handled
                .lock()
                .expect("handled lock")
                .push((packet.service_number, packet.service_command));
        }

        fn observe(&self, _node: &Node, packet: &Packet) {
            self.observed
                .lock()
                .expect("observed lock")
                .push(packet.device_identifier);
        }
    }

    fn node_with(probe: &Arc<Probe>) -> (Node, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let node = Node::builder(transport.clone())
            .device_id(ME)
            .service(probe.clone())
            .build()
            .expect("node should build");
        (node, transport)
    }

    fn frame(device: u64, flags: u8, packets: &[(u8, u16, &[u8])]) -> Frame {
        let mut frame = Frame::new(device, flags);
        for (number, command, data) in packets {
            assert!(frame.push_in_frame(*number, *command, data));
        }
        frame.seal();
        frame
    }

    #[test]
    fn acks_command_frames_for_this_device_once() {
        let probe = Arc::new(Probe::default());
        let (node, transport) = node_with(&probe);
        let incoming = frame(
            ME,
            FLAG_COMMAND | FLAG_ACK_REQUESTED,
            &[(1, 0x80, b"a"), (1, 0x81, b"b")],
        );
        let crc = incoming.crc;

        node.process_frame(incoming);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let ack = sent[0].first_packet().expect("ack packet");
        assert_eq!(ack.service_number, CRC_ACK);
        assert_eq!(ack.service_command, crc);
        assert!(ack.data.is_empty());
        assert_eq!(sent[0].device_identifier, ME);
        assert_eq!(
            *probe.handled.lock().expect("handled lock"),
            vec![(1, 0x80), (1, 0x81)]
        );
    }

    #[test]
    fn frames_for_other_devices_are_not_acked_or_handled() {
        let probe = Arc::new(Probe::default());
        let (node, transport) = node_with(&probe);
        node.process_frame(frame(
            ME + 1,
            FLAG_COMMAND | FLAG_ACK_REQUESTED,
            &[(1, 0x80, b"")],
        ));
        assert!(transport.sent().is_empty());
        assert!(probe.handled.lock().expect("handled lock").is_empty());
    }

    #[test]
    fn reports_go_to_observers() {
        let probe = Arc::new(Probe::default());
        let (node, _) = node_with(&probe);
        node.process_frame(frame(0x77, 0, &[(2, 0x01, b"r")]));
        assert_eq!(*probe.observed.lock().expect("observed lock"), vec![0x77]);
        assert!(probe.handled.lock().expect("handled lock").is_empty());
    }

    #[test]
    fn class_commands_are_renumbered() {
        let probe = Arc::new(Probe {
            class: 0x1234_5678,
            ..Probe::default()
        });
        let (node, _) = node_with(&probe);
        node.process_frame(frame(
            0x1234_5678,
            FLAG_COMMAND | FLAG_IDENTIFIER_IS_SERVICE_CLASS,
            &[(0, 0x80, b"")],
        ));
        assert_eq!(
            *probe.handled.lock().expect("handled lock"),
            vec![(1, 0x80)]
        );
    }

    #[test]
    fn advertisement_request_is_answered() {
        let probe = Arc::new(Probe {
            class: 0xaabb_ccdd,
            ..Probe::default()
        });
        let (node, transport) = node_with(&probe);
        node.process_frame(frame(ME, FLAG_COMMAND, &[(CONTROL, CMD_ADVERTISEMENT_DATA, b"")]));
        node.flush();

        let sent = transport.sent();
        let packet = sent[0].first_packet().expect("advertisement");
        assert_eq!(packet.service_number, CONTROL);
        let mut expected = 0u32.to_le_bytes().to_vec();
        expected.extend_from_slice(&0xaabb_ccddu32.to_le_bytes());
        assert_eq!(packet.data.as_ref(), expected.as_slice());
    }

    #[test]
    fn pipe_packets_reach_input_pipes() {
        let probe = Arc::new(Probe::default());
        let (node, _) = node_with(&probe);
        let sink = Arc::new(RecordingSink::default());
        let pipe = node.open_input_pipe(sink.clone()).expect("open");
        let first = PipeCommand::new(pipe.port());

        node.process_frame(frame(
            ME,
            FLAG_COMMAND,
            &[
                (PIPE, first.raw(), b"x"),
                (PIPE, first.raw(), b"dup"),
                (PIPE, first.advance().close().raw(), b""),
            ],
        ));

        assert_eq!(
            sink.deliveries(),
            vec![
                Delivery::Data(b"x".to_vec()),
                Delivery::Data(Vec::new()),
                Delivery::Eof
            ]
        );
        assert!(!pipe.is_open());
    }

    #[test]
    fn unknown_service_number_is_ignored() {
        let probe = Arc::new(Probe::default());
        let (node, _) = node_with(&probe);
        node.process_frame(frame(ME, FLAG_COMMAND, &[(9, 0x80, b"")]));
        assert!(probe.handled.lock().expect("handled lock").is_empty());
    }
}
