//! JACDAC node runtime.
//!
//! A [`Node`] sits on a [`jdpipe_transport::Transport`] and provides:
//! - a TX queue coalescing packets from many producers into frames
//! - an RX queue and dispatcher routing packets to hosted [`Service`]s
//! - reliable, ordered pipes: [`OutputPipe`] (acked, retried with backoff)
//!   and [`InputPipe`] (counter-gated, deduplicated)
//! - a [`Worker`] for moving blocking pipe work off the dispatch task

pub mod config;
mod dispatch;
pub mod echo;
pub mod error;
pub mod ipipe;
pub mod node;
pub mod notify;
pub mod opipe;
pub mod registry;
pub mod rxq;
pub mod slots;
pub mod txq;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use config::{NodeConfig, RetryPolicy, WorkerConfig};
pub use echo::{EchoService, EchoStatus, CMD_OPEN, ECHO_SERVICE_CLASS};
pub use error::{NodeError, Result};
pub use ipipe::{InputPipe, Meta, PipeSink};
pub use node::{Node, NodeBuilder, NodeTask, Service};
pub use opipe::OutputPipe;
pub use registry::{PipeRegistry, PortSource, RandomPorts};
pub use slots::{SlotArena, SlotId};
pub use worker::{Job, Worker};
