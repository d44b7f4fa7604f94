//! Ethernet II framing.

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const HEADER_LEN: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    /// All-hosts IGMPv3 group, permanently in the ARP cache.
    pub const IGMP_ALL_HOSTS: MacAddr = MacAddr([0x01, 0x00, 0x5E, 0x00, 0x00, 0x16]);

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xFF; 6]
    }
}

impl core::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

/// Split a raw frame into header and payload.
pub fn parse(frame: &[u8]) -> Option<(EthHeader, &[u8])> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    let header = EthHeader {
        dst: MacAddr(dst),
        src: MacAddr(src),
        ethertype: u16::from_be_bytes([frame[12], frame[13]]),
    };
    Some((header, &frame[HEADER_LEN..]))
}

/// Write a header into `buf` and return the payload offset.
pub fn write_header(buf: &mut [u8], dst: MacAddr, src: MacAddr, ethertype: u16) -> usize {
    buf[0..6].copy_from_slice(&dst.0);
    buf[6..12].copy_from_slice(&src.0);
    buf[12..14].copy_from_slice(&ethertype.to_be_bytes());
    HEADER_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut buf = [0u8; 64];
        let dst = MacAddr([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let src = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let off = write_header(&mut buf, dst, src, ETHERTYPE_ARP);
        assert_eq!(off, HEADER_LEN);
        let (hdr, payload) = parse(&buf).expect("parses");
        assert_eq!(hdr.dst, dst);
        assert_eq!(hdr.src, src);
        assert_eq!(hdr.ethertype, ETHERTYPE_ARP);
        assert_eq!(payload.len(), 64 - HEADER_LEN);
    }

    #[test]
    fn runt_frame_is_rejected() {
        assert!(parse(&[0u8; 13]).is_none());
    }

    #[test]
    fn mac_formatting() {
        let mac = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        assert_eq!(crate::format!("{}", mac), "52:54:00:12:34:56");
        assert!(MacAddr::BROADCAST.is_broadcast());
    }
}
