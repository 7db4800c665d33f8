use jdpipe_frame::{MAX_PACKET_DATA, MAX_PAYLOAD, MAX_PORT};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("jdpipe {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: jdpipe");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "build_target: {}",
        option_env!("JDPIPE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("max_frame_payload: {MAX_PAYLOAD}");
    println!("max_packet_data: {MAX_PACKET_DATA}");
    println!("max_pipe_port: {MAX_PORT}");

    Ok(SUCCESS)
}
