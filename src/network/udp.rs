//! UDP with a fixed table of port handlers.

use super::ip::Ipv4Addr;

pub const HEADER_LEN: usize = 8;
pub const MAX_HANDLERS: usize = 16;

/// Called for each datagram arriving on a bound port.
pub type UdpHandler = fn(src_ip: Ipv4Addr, src_port: u16, payload: &[u8]);

#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
}

pub fn parse(packet: &[u8]) -> Option<(UdpHeader, &[u8])> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let length = u16::from_be_bytes([packet[4], packet[5]]);
    if (length as usize) < HEADER_LEN || packet.len() < length as usize {
        return None;
    }
    let header = UdpHeader {
        src_port: u16::from_be_bytes([packet[0], packet[1]]),
        dst_port: u16::from_be_bytes([packet[2], packet[3]]),
        length,
    };
    Some((header, &packet[HEADER_LEN..length as usize]))
}

/// Write a datagram with checksum zero (valid for IPv4), returning its
/// total length.
pub fn write_datagram(buf: &mut [u8], src_port: u16, dst_port: u16, payload: &[u8]) -> usize {
    let len = HEADER_LEN + payload.len();
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    buf[6..8].copy_from_slice(&[0, 0]);
    buf[HEADER_LEN..len].copy_from_slice(payload);
    len
}

pub struct UdpTable {
    handlers: [Option<(u16, UdpHandler)>; MAX_HANDLERS],
}

impl UdpTable {
    pub const fn new() -> UdpTable {
        UdpTable { handlers: [None; MAX_HANDLERS] }
    }

    /// Bind `handler` to `port`. Rebinding a bound port replaces the
    /// handler; a full table reports failure.
    pub fn bind(&mut self, port: u16, handler: UdpHandler) -> Result<(), super::NetError> {
        if let Some(slot) = self.handlers.iter_mut().find(|s| matches!(s, Some((p, _)) if *p == port)) {
            *slot = Some((port, handler));
            return Ok(());
        }
        match self.handlers.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some((port, handler));
                Ok(())
            }
            None => Err(super::NetError::Unavailable),
        }
    }

    pub fn unbind(&mut self, port: u16) {
        for slot in self.handlers.iter_mut() {
            if matches!(slot, Some((p, _)) if *p == port) {
                *slot = None;
            }
        }
    }

    pub fn handler_for(&self, port: u16) -> Option<UdpHandler> {
        self.handlers
            .iter()
            .flatten()
            .find(|(p, _)| *p == port)
            .map(|(_, h)| *h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn count_hits(_src: Ipv4Addr, _port: u16, _payload: &[u8]) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    fn other(_src: Ipv4Addr, _port: u16, _payload: &[u8]) {}

    #[test]
    fn datagram_round_trip() {
        let mut buf = [0u8; 64];
        let len = write_datagram(&mut buf, 49200, 53, b"query");
        let (hdr, payload) = parse(&buf[..len]).expect("valid");
        assert_eq!(hdr.src_port, 49200);
        assert_eq!(hdr.dst_port, 53);
        assert_eq!(payload, b"query");
    }

    #[test]
    fn truncated_datagram_is_dropped() {
        let mut buf = [0u8; 64];
        let len = write_datagram(&mut buf, 1, 2, b"hello");
        assert!(parse(&buf[..len - 2]).is_none());
    }

    #[test]
    fn bind_demux_and_capacity() {
        let mut table = UdpTable::new();
        table.bind(7, count_hits).expect("binds");
        assert!(table.handler_for(7).is_some());
        assert!(table.handler_for(8).is_none());

        let h = table.handler_for(7).expect("bound");
        h(Ipv4Addr::new(10, 0, 2, 2), 5000, b"ping");
        assert!(HITS.load(Ordering::SeqCst) >= 1);

        for port in 100..115 {
            table.bind(port, other).expect("room");
        }
        assert!(table.bind(9999, other).is_err());
        // Rebinding an existing port still works when full.
        assert!(table.bind(7, other).is_ok());
    }
}
