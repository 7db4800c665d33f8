use std::fs::File;
use std::io::{BufReader, Cursor, Read};

use jdpipe_frame::service::{flag_names, service_name};
use jdpipe_frame::{Frame, FrameReader, Packet, PIPE};
use serde::Serialize;

use crate::cmd::DecodeArgs;
use crate::exit::{frame_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{hex_preview, print_json, print_table, OutputFormat};

const PREVIEW_BYTES: usize = 16;

#[derive(Serialize, Debug, PartialEq, Eq)]
struct PipeWord {
    port: u16,
    counter: u16,
    meta: bool,
    close: bool,
}

#[derive(Serialize, Debug)]
struct PacketRecord {
    frame: usize,
    device: String,
    flags: String,
    crc: String,
    service_number: u8,
    service: &'static str,
    command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipe: Option<PipeWord>,
    size: usize,
    data: String,
}

impl PacketRecord {
    fn new(index: usize, frame: &Frame, packet: &Packet) -> Self {
        let pipe = (packet.service_number == PIPE).then(|| {
            let word = packet.pipe_command();
            PipeWord {
                port: word.port(),
                counter: word.counter(),
                meta: word.is_meta(),
                close: word.is_close(),
            }
        });
        Self {
            frame: index,
            device: format!("{:016x}", frame.device_identifier),
            flags: flag_names(frame.flags),
            crc: format!("{:04x}", frame.crc),
            service_number: packet.service_number,
            service: service_name(packet.service_number),
            command: format!("{:#06x}", packet.service_command),
            pipe,
            size: packet.data.len(),
            data: hex_preview(&packet.data, PREVIEW_BYTES),
        }
    }

    fn command_text(&self) -> String {
        match &self.pipe {
            Some(word) => {
                let mut text = format!("port={} counter={}", word.port, word.counter);
                if word.meta {
                    text.push_str(" meta");
                }
                if word.close {
                    text.push_str(" close");
                }
                text
            }
            None => self.command.clone(),
        }
    }
}

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let records = match (&args.hex, &args.file) {
        (Some(hex), _) => decode_stream(Cursor::new(parse_hex(hex)?))?,
        (None, Some(path)) => {
            let file = File::open(path).map_err(|err| {
                io_error(&format!("failed opening {}", path.display()), err)
            })?;
            decode_stream(BufReader::new(file))?
        }
        (None, None) => return Err(CliError::new(USAGE, "one of --hex or --file is required")),
    };

    print_records(&records, format);
    Ok(SUCCESS)
}

fn decode_stream<R: Read>(input: R) -> CliResult<Vec<PacketRecord>> {
    let mut reader = FrameReader::new(input);
    let mut records = Vec::new();
    let mut index = 0;
    while let Some(frame) = reader
        .next_frame()
        .map_err(|err| frame_error(&format!("frame {index}"), err))?
    {
        tracing::debug!(
            frame = index,
            size = frame.size(),
            device = format_args!("{:016x}", frame.device_identifier),
            "decoded frame"
        );
        records.extend(frame.packets().map(|packet| PacketRecord::new(index, &frame, &packet)));
        index += 1;
    }
    Ok(records)
}

fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();
    if digits.len() % 2 != 0 {
        return Err(CliError::new(USAGE, "hex input has an odd number of digits"));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).unwrap_or("");
            u8::from_str_radix(text, 16)
                .map_err(|_| CliError::new(USAGE, format!("invalid hex byte: {text:?}")))
        })
        .collect()
}

fn print_records(records: &[PacketRecord], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for record in records {
                print_json(record);
            }
        }
        OutputFormat::Table => {
            let rows = records
                .iter()
                .map(|record| {
                    vec![
                        record.frame.to_string(),
                        record.device.clone(),
                        record.flags.clone(),
                        format!("{} ({})", record.service_number, record.service),
                        record.command_text(),
                        record.size.to_string(),
                        record.data.clone(),
                    ]
                })
                .collect();
            print_table(
                &["FRAME", "DEVICE", "FLAGS", "SERVICE", "COMMAND", "SIZE", "DATA"],
                rows,
            );
        }
        OutputFormat::Pretty => {
            for record in records {
                println!(
                    "frame={} device={} flags={} crc={} service={} ({}) {} size={} data={}",
                    record.frame,
                    record.device,
                    record.flags,
                    record.crc,
                    record.service_number,
                    record.service,
                    record.command_text(),
                    record.size,
                    record.data
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use jdpipe_frame::{PipeCommand, FLAG_COMMAND};

    use super::*;

    fn wire(frame: &Frame) -> Vec<u8> {
        frame.to_bytes().to_vec()
    }

    #[test]
    fn parse_hex_accepts_separators() {
        assert_eq!(parse_hex("0a ff:10\n").expect("hex"), vec![0x0a, 0xff, 0x10]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn pipe_words_are_broken_out() {
        let mut frame = Frame::new(0x42, FLAG_COMMAND);
        let word = PipeCommand::new(7).advance().advance().close();
        assert!(frame.push_in_frame(PIPE, word.raw(), b""));
        assert!(frame.push_in_frame(2, 0x80, b"hi"));
        frame.seal();

        let records = decode_stream(Cursor::new(wire(&frame))).expect("decode");
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[0].pipe,
            Some(PipeWord {
                port: 7,
                counter: 2,
                meta: false,
                close: true,
            })
        );
        assert_eq!(records[0].command_text(), "port=7 counter=2 close");
        assert_eq!(records[1].pipe, None);
        assert_eq!(records[1].command, "0x0080");
        assert_eq!(records[1].data, "6869");
        assert_eq!(records[1].flags, "COMMAND");
    }

    #[test]
    fn frames_are_numbered_in_order() {
        let mut stream = Vec::new();
        for device in 1..=3u64 {
            let mut frame = Frame::new(device, 0);
            assert!(frame.push_in_frame(1, 0x01, &[device as u8]));
            frame.seal();
            stream.extend(wire(&frame));
        }
        let records = decode_stream(Cursor::new(stream)).expect("decode");
        let frames: Vec<usize> = records.iter().map(|r| r.frame).collect();
        assert_eq!(frames, vec![0, 1, 2]);
    }

    #[test]
    fn corrupt_crc_is_data_invalid() {
        let mut frame = Frame::new(0x42, 0);
        assert!(frame.push_in_frame(1, 0x01, b"x"));
        frame.seal();
        let mut bytes = wire(&frame);
        bytes[0] ^= 0xff;

        let err = decode_stream(Cursor::new(bytes)).expect_err("crc should fail");
        assert_eq!(err.code, crate::exit::DATA_INVALID);
    }
}
