//! ARP, RFC 826 for IPv4 over Ethernet.
//!
//! The cache holds 64 entries with 300 second aging. Broadcast and the
//! all-hosts multicast group are permanent. Senders outside our subnet
//! are never cached, so a host on another segment cannot poison us.

use super::ethernet::MacAddr;
use super::ip::Ipv4Addr;
use crate::time::TICK_HZ;

pub const MAX_ENTRIES: usize = 64;
pub const ENTRY_TTL_TICKS: u32 = 300 * TICK_HZ;
pub const RESOLVE_ATTEMPTS: u32 = 3;
pub const RESOLVE_TIMEOUT_MS: u32 = 200;

pub const OP_REQUEST: u16 = 1;
pub const OP_REPLY: u16 = 2;
pub const PACKET_LEN: usize = 28;

#[derive(Debug, Clone, Copy)]
pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub added_tick: u32,
    pub permanent: bool,
}

pub struct ArpCache {
    entries: heapless::Vec<ArpEntry, MAX_ENTRIES>,
}

impl ArpCache {
    pub fn new() -> ArpCache {
        let mut cache = ArpCache { entries: heapless::Vec::new() };
        cache.add_permanent(Ipv4Addr::BROADCAST, MacAddr::BROADCAST);
        cache.add_permanent(Ipv4Addr::IGMP_ALL_HOSTS, MacAddr::IGMP_ALL_HOSTS);
        cache
    }

    pub fn add_permanent(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        let _ = self.entries.push(ArpEntry { ip, mac, added_tick: 0, permanent: true });
    }

    /// Insert or refresh a mapping. A changed MAC for a known IP is a
    /// gratuitous update; take it and log it.
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr, now: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.ip == ip) {
            if entry.permanent {
                return;
            }
            if entry.mac != mac {
                log_info!("[ARP] {} moved {} -> {}", ip, entry.mac, mac);
            }
            entry.mac = mac;
            entry.added_tick = now;
            return;
        }
        if self.entries.is_full() {
            self.evict_oldest();
        }
        let _ = self.entries.push(ArpEntry { ip, mac, added_tick: now, permanent: false });
    }

    fn evict_oldest(&mut self) {
        let victim = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.permanent)
            .min_by_key(|(_, e)| e.added_tick)
            .map(|(i, _)| i);
        if let Some(i) = victim {
            self.entries.swap_remove(i);
        }
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries.iter().find(|e| e.ip == ip).map(|e| e.mac)
    }

    /// Drop non-permanent entries older than the TTL.
    pub fn age(&mut self, now: u32) {
        let mut i = 0;
        while i < self.entries.len() {
            let e = &self.entries[i];
            if !e.permanent && now.wrapping_sub(e.added_tick) > ENTRY_TTL_TICKS {
                self.entries.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ArpPacket {
    pub op: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

/// Parse an ARP payload; anything but IPv4-over-Ethernet is dropped.
pub fn parse(payload: &[u8]) -> Option<ArpPacket> {
    if payload.len() < PACKET_LEN {
        return None;
    }
    let htype = u16::from_be_bytes([payload[0], payload[1]]);
    let ptype = u16::from_be_bytes([payload[2], payload[3]]);
    if htype != 1 || ptype != 0x0800 || payload[4] != 6 || payload[5] != 4 {
        return None;
    }
    let mut sender_mac = [0u8; 6];
    let mut target_mac = [0u8; 6];
    sender_mac.copy_from_slice(&payload[8..14]);
    target_mac.copy_from_slice(&payload[18..24]);
    Some(ArpPacket {
        op: u16::from_be_bytes([payload[6], payload[7]]),
        sender_mac: MacAddr(sender_mac),
        sender_ip: Ipv4Addr([payload[14], payload[15], payload[16], payload[17]]),
        target_mac: MacAddr(target_mac),
        target_ip: Ipv4Addr([payload[24], payload[25], payload[26], payload[27]]),
    })
}

/// Serialize a packet into `buf`, returning the payload length.
pub fn write_packet(buf: &mut [u8], pkt: &ArpPacket) -> usize {
    buf[0..2].copy_from_slice(&1u16.to_be_bytes());
    buf[2..4].copy_from_slice(&0x0800u16.to_be_bytes());
    buf[4] = 6;
    buf[5] = 4;
    buf[6..8].copy_from_slice(&pkt.op.to_be_bytes());
    buf[8..14].copy_from_slice(&pkt.sender_mac.0);
    buf[14..18].copy_from_slice(&pkt.sender_ip.0);
    buf[18..24].copy_from_slice(&pkt.target_mac.0);
    buf[24..28].copy_from_slice(&pkt.target_ip.0);
    PACKET_LEN
}
