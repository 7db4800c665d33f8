use std::path::PathBuf;
use std::process::{Command, Output};

use jdpipe::frame::{Frame, PipeCommand, FLAG_COMMAND, PIPE};

fn jdpipe(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_jdpipe"))
        .arg("--log-level")
        .arg("error")
        .args(args)
        .output()
        .expect("jdpipe should run")
}

fn unique_temp_file(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "jdpipe-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn pipe_frame() -> Frame {
    let mut frame = Frame::new(0x0102_0304_0506_0708, FLAG_COMMAND);
    let word = PipeCommand::new(0x1ab).advance().meta();
    assert!(frame.push_in_frame(PIPE, word.raw(), b"\x01\x02\x03"));
    frame.seal();
    frame
}

#[test]
fn decode_hex_prints_pipe_word_as_json() {
    let hex = to_hex(&pipe_frame().to_bytes());
    let output = jdpipe(&["--format", "json", "decode", "--hex", &hex]);

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("one json line per packet");
    assert_eq!(line["device"], "0102030405060708");
    assert_eq!(line["service"], "PIPE");
    assert_eq!(line["pipe"]["port"], 0x1ab);
    assert_eq!(line["pipe"]["counter"], 1);
    assert_eq!(line["pipe"]["meta"], true);
    assert_eq!(line["data"], "010203");
}

#[test]
fn decode_file_reads_concatenated_frames() {
    let path = unique_temp_file("frames");
    let mut stream = pipe_frame().to_bytes().to_vec();
    stream.extend_from_slice(&pipe_frame().to_bytes());
    std::fs::write(&path, &stream).expect("frames file should be writable");

    let output = jdpipe(&[
        "--format",
        "pretty",
        "decode",
        "--file",
        path.to_str().expect("utf-8 temp path"),
    ]);
    let _ = std::fs::remove_file(&path);

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 2);
    assert!(stdout.contains("port=427 counter=1 meta"));
}

#[test]
fn decode_bad_crc_exits_60() {
    let mut bytes = pipe_frame().to_bytes().to_vec();
    bytes[1] ^= 0x5a;
    let output = jdpipe(&["decode", "--hex", &to_hex(&bytes)]);

    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("crc mismatch"));
}

#[test]
fn decode_requires_an_input() {
    let output = jdpipe(&["decode"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn simulate_reports_matching_echo() {
    let output = jdpipe(&["--format", "json", "simulate", "--bytes", "600"]);

    assert!(output.status.success(), "{output:?}");
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("report should be json");
    assert_eq!(report["matched"], true);
    assert_eq!(report["bytes_received"], 600);
    assert_eq!(report["frames_dropped"], 0);
}

#[test]
fn simulate_rejects_unknown_config_keys() {
    let path = unique_temp_file("config");
    std::fs::write(&path, r#"{"bogus": 1}"#).expect("config should be writable");

    let output = jdpipe(&[
        "simulate",
        "--config",
        path.to_str().expect("utf-8 temp path"),
    ]);
    let _ = std::fs::remove_file(&path);

    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn version_extended_lists_limits() {
    let output = jdpipe(&["version", "--extended"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("name: jdpipe"));
    assert!(stdout.contains("max_packet_data: 232"));
}
