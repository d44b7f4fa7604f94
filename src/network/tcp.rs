//! TCP, client side.
//!
//! Sixteen protocol control blocks, active open only; listen/accept are
//! not wired up. Headers are always five words, the advertised window is
//! fixed at 8192, and the checksum runs over the IPv4 pseudo-header.

use super::ip::Ipv4Addr;

pub const MAX_CONNECTIONS: usize = 16;
pub const EPHEMERAL_BASE: u16 = 49152;
pub const WINDOW_SIZE: u16 = 8192;
pub const RX_BUFFER_SIZE: usize = 4096;
pub const HEADER_LEN: usize = 20;

pub const CONNECT_TIMEOUT_MS: u32 = 5000;
/// First retransmit after 50 ticks, doubling per try.
pub const RETRANSMIT_BASE_TICKS: u32 = 50;
pub const MAX_RETRANSMITS: u32 = 5;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    SynSent,
    Established,
    CloseWait,
    LastAck,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
}

/// Checksum input: 96-bit pseudo-header then the segment itself.
fn pseudo_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for pair in src.0.chunks(2).chain(dst.0.chunks(2)) {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    sum += u32::from(super::ip::PROTO_TCP);
    sum += segment.len() as u32;

    let mut chunks = segment.chunks_exact(2);
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

/// Parse a segment arriving for `dst` from `src`; bad checksums drop it.
pub fn parse<'a>(src: Ipv4Addr, dst: Ipv4Addr, segment: &'a [u8]) -> Option<(TcpHeader, &'a [u8])> {
    if segment.len() < HEADER_LEN {
        return None;
    }
    if pseudo_checksum(src, dst, segment) != 0 {
        return None;
    }
    let data_offset = usize::from(segment[12] >> 4) * 4;
    if data_offset < HEADER_LEN || segment.len() < data_offset {
        return None;
    }
    let header = TcpHeader {
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
        flags: segment[13],
        window: u16::from_be_bytes([segment[14], segment[15]]),
    };
    Some((header, &segment[data_offset..]))
}

/// Write a checksummed segment, returning its total length.
pub fn write_segment(
    buf: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    hdr: &TcpHeader,
    payload: &[u8],
) -> usize {
    let len = HEADER_LEN + payload.len();
    buf[0..2].copy_from_slice(&hdr.src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&hdr.dst_port.to_be_bytes());
    buf[4..8].copy_from_slice(&hdr.seq.to_be_bytes());
    buf[8..12].copy_from_slice(&hdr.ack.to_be_bytes());
    buf[12] = 5 << 4;
    buf[13] = hdr.flags;
    buf[14..16].copy_from_slice(&hdr.window.to_be_bytes());
    buf[16..18].copy_from_slice(&[0, 0]); // checksum
    buf[18..20].copy_from_slice(&[0, 0]); // urgent
    buf[HEADER_LEN..len].copy_from_slice(payload);
    let sum = pseudo_checksum(src, dst, &buf[..len]);
    buf[16..18].copy_from_slice(&sum.to_be_bytes());
    len
}

/// Initial send sequence derived from the boot tick.
pub fn initial_sequence(ticks: u32) -> u32 {
    ticks.wrapping_mul(1_234_567)
}

pub struct Pcb {
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub state: TcpState,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub rx: heapless::Deque<u8, RX_BUFFER_SIZE>,
    /// Connect retransmit bookkeeping.
    pub retries: u32,
    pub retrans_at: u32,
    pub retrans_interval: u32,
}

impl Pcb {
    pub fn new(local_port: u16, remote_ip: Ipv4Addr, remote_port: u16, iss: u32, now: u32) -> Pcb {
        Pcb {
            local_port,
            remote_ip,
            remote_port,
            state: TcpState::SynSent,
            snd_nxt: iss.wrapping_add(1), // SYN consumes one
            rcv_nxt: 0,
            rx: heapless::Deque::new(),
            retries: 0,
            retrans_at: now + RETRANSMIT_BASE_TICKS,
            retrans_interval: RETRANSMIT_BASE_TICKS,
        }
    }

    pub fn iss(&self) -> u32 {
        self.snd_nxt.wrapping_sub(1)
    }

    /// Apply one incoming segment. Returns true when an ACK should go
    /// back to the peer.
    pub fn on_segment(&mut self, hdr: &TcpHeader, data: &[u8]) -> bool {
        if hdr.flags & FLAG_RST != 0 {
            self.state = TcpState::Closed;
            return false;
        }
        match self.state {
            TcpState::SynSent => {
                if hdr.flags & (FLAG_SYN | FLAG_ACK) == FLAG_SYN | FLAG_ACK
                    && hdr.ack == self.snd_nxt
                {
                    self.rcv_nxt = hdr.seq.wrapping_add(1);
                    self.state = TcpState::Established;
                    return true;
                }
                false
            }
            TcpState::Established | TcpState::CloseWait => {
                let mut ack = false;
                if !data.is_empty() {
                    if hdr.seq == self.rcv_nxt && self.rx.len() + data.len() <= RX_BUFFER_SIZE {
                        for &b in data {
                            let _ = self.rx.push_back(b);
                        }
                        self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
                    }
                    // Out-of-order or overflowing data still gets a
                    // (duplicate) ACK carrying the expected sequence.
                    ack = true;
                }
                if hdr.flags & FLAG_FIN != 0 && self.state == TcpState::Established {
                    self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                    self.state = TcpState::CloseWait;
                    ack = true;
                }
                ack
            }
            TcpState::LastAck => {
                if hdr.flags & FLAG_ACK != 0 {
                    self.state = TcpState::Closed;
                }
                false
            }
            TcpState::Closed => false,
        }
    }

    /// Drain buffered data into `buf`. 0 means "nothing yet", -2 means
    /// the peer is gone and the buffer is dry.
    pub fn read(&mut self, buf: &mut [u8]) -> i32 {
        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            return n as i32;
        }
        match self.state {
            TcpState::Closed | TcpState::CloseWait | TcpState::LastAck => -2,
            _ => 0,
        }
    }
}

pub struct TcpTable {
    pub pcbs: [Option<Pcb>; MAX_CONNECTIONS],
    next_ephemeral: u16,
}

impl TcpTable {
    pub const fn new() -> TcpTable {
        TcpTable {
            pcbs: [const { None }; MAX_CONNECTIONS],
            next_ephemeral: EPHEMERAL_BASE,
        }
    }

    pub fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_ephemeral;
        self.next_ephemeral = self.next_ephemeral.checked_add(1).unwrap_or(EPHEMERAL_BASE);
        port
    }

    pub fn alloc(&mut self, pcb: Pcb) -> Option<usize> {
        let slot = self.pcbs.iter().position(|p| p.is_none())?;
        self.pcbs[slot] = Some(pcb);
        Some(slot)
    }

    pub fn get_mut(&mut self, sock: usize) -> Option<&mut Pcb> {
        self.pcbs.get_mut(sock)?.as_mut()
    }

    /// PCB owning a segment addressed to `local_port` from the given
    /// remote endpoint.
    pub fn demux(&mut self, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Option<usize> {
        self.pcbs.iter().position(|p| {
            matches!(p, Some(pcb) if pcb.local_port == local_port
                && pcb.remote_ip == remote_ip
                && pcb.remote_port == remote_port)
        })
    }

    pub fn release(&mut self, sock: usize) {
        if sock < MAX_CONNECTIONS {
            self.pcbs[sock] = None;
        }
    }
}
