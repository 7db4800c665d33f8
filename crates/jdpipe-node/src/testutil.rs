//! Mock collaborators shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use jdpipe_frame::{Frame, Packet, CRC_ACK};
use jdpipe_transport::Transport;

use crate::ipipe::{Meta, PipeSink};
use crate::registry::PipeRegistry;

/// Records every frame; optionally refuses them all.
#[derive(Default)]
pub struct RecordingTransport {
    frames: Mutex<Vec<Frame>>,
    refuse: bool,
}

impl RecordingTransport {
    pub fn refusing() -> Self {
        Self {
            frames: Mutex::new(Vec::new()),
            refuse: true,
        }
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.frames.lock().expect("frames lock").clone()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, frame: Frame, _timeout: Duration) -> bool {
        if self.refuse {
            return false;
        }
        self.frames.lock().expect("frames lock").push(frame);
        true
    }

    fn receive(&self) -> Option<Frame> {
        None
    }
}

/// Acknowledges sent frames straight into a registry, after losing the
/// first `lose` sends of every frame.
pub struct AckingTransport {
    registry: Arc<PipeRegistry>,
    lose: usize,
    ack_device: Option<u64>,
    attempts: AtomicUsize,
    sends: Mutex<Vec<Frame>>,
}

impl AckingTransport {
    pub fn new(registry: Arc<PipeRegistry>, lose: usize) -> Self {
        Self {
            registry,
            lose,
            ack_device: None,
            attempts: AtomicUsize::new(0),
            sends: Mutex::new(Vec::new()),
        }
    }

    /// Acks claim to come from `device` instead of the frame's target.
    pub fn acking_as(mut self, device: u64) -> Self {
        self.ack_device = Some(device);
        self
    }

    /// Never acknowledge anything.
    pub fn silent(registry: Arc<PipeRegistry>) -> Self {
        Self::new(registry, usize::MAX)
    }

    /// Every send attempt, including lost ones.
    pub fn sends(&self) -> Vec<Frame> {
        self.sends.lock().expect("sends lock").clone()
    }

    /// Distinct frames that were acknowledged, in order.
    pub fn delivered(&self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = Vec::new();
        for frame in self.sends() {
            if frames.last() != Some(&frame) {
                frames.push(frame);
            }
        }
        frames
    }
}

impl Transport for AckingTransport {
    fn send(&self, frame: Frame, _timeout: Duration) -> bool {
        let previous = self.sends.lock().expect("sends lock").last().cloned();
        self.sends.lock().expect("sends lock").push(frame.clone());

        let attempt = if previous.as_ref() == Some(&frame) {
            self.attempts.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            self.attempts.store(1, Ordering::SeqCst);
            1
        };
        if attempt <= self.lose {
            return true;
        }

        let ack = Packet {
            device_identifier: self.ack_device.unwrap_or(frame.device_identifier),
            flags: 0,
            service_number: CRC_ACK,
            service_command: frame.crc,
            data: Bytes::new(),
        };
        self.registry.process_ack(&ack);
        true
    }

    fn receive(&self) -> Option<Frame> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Data(Vec<u8>),
    Meta(Vec<u8>),
    Eof,
}

/// Sink that records what it was given.
#[derive(Default)]
pub struct RecordingSink {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingSink {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().expect("deliveries lock").clone()
    }
}

impl PipeSink for RecordingSink {
    fn on_data(&self, packet: &Packet) {
        self.deliveries
            .lock()
            .expect("deliveries lock")
            .push(Delivery::Data(packet.data.to_vec()));
    }

    fn on_meta(&self, meta: Meta<'_>) {
        let delivery = match meta {
            Meta::Data(packet) => Delivery::Meta(packet.data.to_vec()),
            Meta::Eof => Delivery::Eof,
        };
        self.deliveries
            .lock()
            .expect("deliveries lock")
            .push(delivery);
    }
}
