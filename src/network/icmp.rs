//! ICMP echo.
//!
//! Outgoing echo requests carry the boot tick in the first four payload
//! bytes so a matching reply yields an RTT without extra bookkeeping.

use super::ip::checksum;

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_ECHO_REQUEST: u8 = 8;
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub id: u16,
    pub seq: u16,
}

pub fn parse(packet: &[u8]) -> Option<(IcmpHeader, &[u8])> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    if checksum(packet) != 0 {
        return None;
    }
    let header = IcmpHeader {
        icmp_type: packet[0],
        code: packet[1],
        id: u16::from_be_bytes([packet[4], packet[5]]),
        seq: u16::from_be_bytes([packet[6], packet[7]]),
    };
    Some((header, &packet[HEADER_LEN..]))
}

/// Write a checksummed echo message, returning its total length.
pub fn write_echo(
    buf: &mut [u8],
    icmp_type: u8,
    id: u16,
    seq: u16,
    payload: &[u8],
) -> usize {
    let len = HEADER_LEN + payload.len();
    buf[0] = icmp_type;
    buf[1] = 0;
    buf[2..4].copy_from_slice(&[0, 0]);
    buf[4..6].copy_from_slice(&id.to_be_bytes());
    buf[6..8].copy_from_slice(&seq.to_be_bytes());
    buf[HEADER_LEN..len].copy_from_slice(payload);
    let sum = checksum(&buf[..len]);
    buf[2..4].copy_from_slice(&sum.to_be_bytes());
    len
}

/// RTT in ticks when the reply payload opens with a boot-tick stamp.
pub fn rtt_from_reply(payload: &[u8], now: u32) -> Option<u32> {
    if payload.len() < 4 {
        return None;
    }
    let stamp = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if stamp > now {
        return None;
    }
    Some(now - stamp)
}
