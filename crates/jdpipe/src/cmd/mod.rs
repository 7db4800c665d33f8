use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod decode;
pub mod simulate;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode raw frames and print their packets.
    Decode(DecodeArgs),
    /// Stream data through an echo pipe between two simulated nodes.
    Simulate(SimulateArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Decode(args) => decode::run(args, format),
        Command::Simulate(args) => simulate::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct DecodeArgs {
    /// Frame bytes as hex; whitespace and `:` separators are ignored.
    #[arg(long)]
    pub hex: Option<String>,
    /// File of concatenated raw frames.
    #[arg(long)]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Bytes to stream through the echo pipe.
    #[arg(long, default_value = "1024")]
    pub bytes: usize,
    /// Drop every Nth frame on the simulated bus.
    #[arg(long, value_name = "N")]
    pub drop_every: Option<u64>,
    /// JSON file overriding node timings and capacities.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
