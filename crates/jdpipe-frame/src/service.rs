//! Reserved service numbers, frame flags and well-known commands.
//!
//! Service numbers 0x00-0x3b index the services hosted by a device.
//! The top of the 6-bit range is reserved for bus plumbing.

/// Control service (announce, reset, identify).
pub const CONTROL: u8 = 0x00;

/// Pipe data; the service command carries a [`crate::PipeCommand`].
pub const PIPE: u8 = 0x3e;

/// Acknowledgement; the service command carries the acked frame CRC.
pub const CRC_ACK: u8 = 0x3f;

/// The frame is a command addressed to `device_identifier`.
pub const FLAG_COMMAND: u8 = 0x01;

/// The receiver must answer with a [`CRC_ACK`] packet.
pub const FLAG_ACK_REQUESTED: u8 = 0x02;

/// `device_identifier` holds a service class rather than a device id.
pub const FLAG_IDENTIFIER_IS_SERVICE_CLASS: u8 = 0x04;

/// Control service: list of hosted service classes.
pub const CMD_ADVERTISEMENT_DATA: u16 = 0x00;

/// Event report: `[event_id u32, arg u32]`.
pub const CMD_EVENT: u16 = 0x81;

/// Returns a human-readable name for a service number.
pub fn service_name(number: u8) -> &'static str {
    match number {
        CONTROL => "CONTROL",
        PIPE => "PIPE",
        CRC_ACK => "CRC_ACK",
        0x3c..=0x3d => "RESERVED",
        _ => "SERVICE",
    }
}

/// Render frame flags as `COMMAND|ACK_REQUESTED`-style text.
pub fn flag_names(flags: u8) -> String {
    let mut names = Vec::new();
    if flags & FLAG_COMMAND != 0 {
        names.push("COMMAND");
    }
    if flags & FLAG_ACK_REQUESTED != 0 {
        names.push("ACK_REQUESTED");
    }
    if flags & FLAG_IDENTIFIER_IS_SERVICE_CLASS != 0 {
        names.push("SERVICE_CLASS");
    }
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_for_reserved_numbers() {
        assert_eq!(service_name(PIPE), "PIPE");
        assert_eq!(service_name(CRC_ACK), "CRC_ACK");
        assert_eq!(service_name(3), "SERVICE");
    }

    #[test]
    fn flag_rendering() {
        assert_eq!(flag_names(0), "-");
        assert_eq!(
            flag_names(FLAG_COMMAND | FLAG_ACK_REQUESTED),
            "COMMAND|ACK_REQUESTED"
        );
    }
}
