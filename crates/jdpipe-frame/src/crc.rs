//! CRC-16/CCITT-FALSE as used by the JACDAC frame header.

/// Initial register value.
pub const CRC16_INIT: u16 = 0xffff;

/// Feed `data` into a running CRC.
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for &byte in data {
        let mut x = ((crc >> 8) as u8) ^ byte;
        x ^= x >> 4;
        let x = x as u16;
        crc = (crc << 8) ^ (x << 12) ^ (x << 5) ^ x;
    }
    crc
}

/// CRC over a whole buffer.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(CRC16_INIT, data)
}
