//! IPv4 header codec.
//!
//! Fixed 20-byte headers, no options. DF is always set; fragmentation is
//! neither produced nor reassembled.

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const HEADER_LEN: usize = 20;
pub const DEFAULT_TTL: u8 = 64;
/// Identification field on every packet we originate.
pub const IP_ID: u16 = 0x1234;
pub const FLAG_DF: u16 = 0x4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr([a, b, c, d])
    }

    pub const BROADCAST: Ipv4Addr = Ipv4Addr([255; 4]);
    /// All-hosts IGMPv3 group address.
    pub const IGMP_ALL_HOSTS: Ipv4Addr = Ipv4Addr([224, 0, 0, 22]);

    /// True when `self` and `other` fall in the same subnet.
    pub fn same_subnet(&self, other: Ipv4Addr, mask: Ipv4Addr) -> bool {
        self.0
            .iter()
            .zip(other.0.iter())
            .zip(mask.0.iter())
            .all(|((a, b), m)| a & m == b & m)
    }
}

impl core::fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// RFC 1071 one's-complement sum over `data`, odd tail zero-padded.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub total_len: u16,
    pub protocol: u8,
    pub ttl: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

/// Write a header for `payload_len` bytes of `protocol` into `buf` and
/// return the payload offset.
pub fn write_header(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload_len: usize,
) -> usize {
    let total = (HEADER_LEN + payload_len) as u16;
    buf[0] = 0x45;
    buf[1] = 0;
    buf[2..4].copy_from_slice(&total.to_be_bytes());
    buf[4..6].copy_from_slice(&IP_ID.to_be_bytes());
    buf[6..8].copy_from_slice(&FLAG_DF.to_be_bytes());
    buf[8] = DEFAULT_TTL;
    buf[9] = protocol;
    buf[10..12].copy_from_slice(&[0, 0]);
    buf[12..16].copy_from_slice(&src.0);
    buf[16..20].copy_from_slice(&dst.0);
    let sum = checksum(&buf[..HEADER_LEN]);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());
    HEADER_LEN
}

/// Parse and validate a header; bad checksum, short packet, or options
/// drop the packet.
pub fn parse(packet: &[u8]) -> Option<(Ipv4Header, &[u8])> {
    if packet.len() < HEADER_LEN || packet[0] != 0x45 {
        return None;
    }
    if checksum(&packet[..HEADER_LEN]) != 0 {
        return None;
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]);
    if (total_len as usize) < HEADER_LEN || packet.len() < total_len as usize {
        return None;
    }
    let header = Ipv4Header {
        total_len,
        ttl: packet[8],
        protocol: packet[9],
        src: Ipv4Addr([packet[12], packet[13], packet[14], packet[15]]),
        dst: Ipv4Addr([packet[16], packet[17], packet[18], packet[19]]),
    };
    Some((header, &packet[HEADER_LEN..total_len as usize]))
}
