//! The stack proper: one device, one IPv4 identity, and the protocol
//! tables. `tick` drains the NIC and dispatches; blocking operations
//! (ARP resolve, TCP connect/receive) pump `tick` under a deadline.

use super::arp::{self, ArpCache};
use super::device::NetworkDevice;
use super::ethernet::{self, MacAddr, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use super::icmp;
use super::ip::{self, Ipv4Addr};
use super::tcp::{self, Pcb, TcpHeader, TcpState, TcpTable};
use super::udp::{self, UdpHandler, UdpTable};
use super::NetError;
use crate::time;

/// Ethernet payload budget; frames are built in fixed buffers.
const FRAME_BUF: usize = 1518;
/// Frames drained per tick before yielding back to the caller.
const RX_BURST: usize = 8;
/// ARP cache aging cadence.
const AGE_INTERVAL_TICKS: u32 = 10 * time::TICK_HZ;

#[derive(Debug, Clone, Copy)]
pub struct NetworkConfig {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    /// Fall back to the broadcast MAC for gateway/DNS when ARP times
    /// out. Emulator workaround, off unless explicitly enabled.
    pub qemu_arp_compat: bool,
}

impl Default for NetworkConfig {
    fn default() -> NetworkConfig {
        NetworkConfig {
            ip: Ipv4Addr::new(10, 0, 2, 15),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 2, 2),
            dns: Ipv4Addr::new(10, 0, 2, 3),
            qemu_arp_compat: false,
        }
    }
}

pub struct NetworkStack<D: NetworkDevice> {
    device: D,
    config: NetworkConfig,
    arp: ArpCache,
    udp: UdpTable,
    tcp: TcpTable,
    last_age_tick: u32,
}

impl<D: NetworkDevice> NetworkStack<D> {
    pub fn new(device: D, config: NetworkConfig) -> NetworkStack<D> {
        NetworkStack {
            device,
            config,
            arp: ArpCache::new(),
            udp: UdpTable::new(),
            tcp: TcpTable::new(),
            last_age_tick: time::ticks(),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Access to the underlying device, mainly for scripted test rigs.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn mac(&self) -> MacAddr {
        self.device.mac()
    }

    pub fn link_up(&self) -> bool {
        self.device.link_up()
    }

    pub fn arp_lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.arp.lookup(ip)
    }

    pub fn arp_add_entry(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        self.arp.insert(ip, mac, time::ticks());
    }

    pub fn print_config(&self) {
        log_info!(
            "[NET] ip {} mask {} gw {} dns {} mac {} link {}",
            self.config.ip,
            self.config.netmask,
            self.config.gateway,
            self.config.dns,
            self.device.mac(),
            if self.device.link_up() { "up" } else { "down" }
        );
    }

    /// One pass: drain a burst of frames, run timers.
    pub fn tick(&mut self) {
        let mut buf = [0u8; FRAME_BUF];
        for _ in 0..RX_BURST {
            match self.device.receive(&mut buf) {
                Some(len) => {
                    let frame = &buf[..len];
                    self.handle_frame(frame);
                }
                None => break,
            }
        }

        let now = time::ticks();
        if now.wrapping_sub(self.last_age_tick) >= AGE_INTERVAL_TICKS {
            self.arp.age(now);
            self.last_age_tick = now;
        }
        self.tcp_timers(now);
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let Some((eth, payload)) = ethernet::parse(frame) else {
            return;
        };
        if eth.dst != self.device.mac() && !eth.dst.is_broadcast() {
            return;
        }
        match eth.ethertype {
            ETHERTYPE_ARP => self.handle_arp(payload),
            ETHERTYPE_IPV4 => self.handle_ipv4(payload),
            _ => {}
        }
    }

    // ===== ARP =====

    fn handle_arp(&mut self, payload: &[u8]) {
        let Some(pkt) = arp::parse(payload) else {
            return;
        };
        // Only neighbors get cached; a remote subnet cannot seed us.
        if pkt.sender_ip.same_subnet(self.config.ip, self.config.netmask) {
            self.arp.insert(pkt.sender_ip, pkt.sender_mac, time::ticks());
        }
        if pkt.op == arp::OP_REQUEST && pkt.target_ip == self.config.ip {
            self.send_arp_reply(pkt.sender_mac, pkt.sender_ip);
        }
    }

    fn send_arp_reply(&mut self, to_mac: MacAddr, to_ip: Ipv4Addr) {
        let reply = arp::ArpPacket {
            op: arp::OP_REPLY,
            sender_mac: self.device.mac(),
            sender_ip: self.config.ip,
            target_mac: to_mac,
            target_ip: to_ip,
        };
        let mut frame = [0u8; ethernet::HEADER_LEN + arp::PACKET_LEN];
        let off = ethernet::write_header(&mut frame, to_mac, self.device.mac(), ETHERTYPE_ARP);
        arp::write_packet(&mut frame[off..], &reply);
        let _ = self.device.send(&frame);
    }

    fn send_arp_request(&mut self, ip: Ipv4Addr) {
        let request = arp::ArpPacket {
            op: arp::OP_REQUEST,
            sender_mac: self.device.mac(),
            sender_ip: self.config.ip,
            target_mac: MacAddr([0; 6]),
            target_ip: ip,
        };
        let mut frame = [0u8; ethernet::HEADER_LEN + arp::PACKET_LEN];
        let off =
            ethernet::write_header(&mut frame, MacAddr::BROADCAST, self.device.mac(), ETHERTYPE_ARP);
        arp::write_packet(&mut frame[off..], &request);
        let _ = self.device.send(&frame);
    }

    /// Resolve `ip`, broadcasting up to 3 requests with 200 ms deadlines
    /// pumped through `tick`.
    pub fn resolve(&mut self, ip: Ipv4Addr) -> Result<MacAddr, NetError> {
        if let Some(mac) = self.arp.lookup(ip) {
            return Ok(mac);
        }
        for _ in 0..arp::RESOLVE_ATTEMPTS {
            self.send_arp_request(ip);
            let deadline = time::ticks().wrapping_add(time::ms_to_ticks(arp::RESOLVE_TIMEOUT_MS));
            while (time::ticks() as i32).wrapping_sub(deadline as i32) < 0 {
                self.tick();
                if let Some(mac) = self.arp.lookup(ip) {
                    return Ok(mac);
                }
            }
        }
        if self.config.qemu_arp_compat && (ip == self.config.gateway || ip == self.config.dns) {
            log_warn!("[ARP] {} unresolved, compat fallback to broadcast", ip);
            return Ok(MacAddr::BROADCAST);
        }
        Err(NetError::Timeout)
    }

    // ===== IPv4 =====

    /// Route, resolve, frame, and transmit one IPv4 payload.
    pub fn send_ipv4(&mut self, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Result<(), NetError> {
        if !self.device.link_up() {
            return Err(NetError::Unavailable);
        }
        if payload.len() > FRAME_BUF - ethernet::HEADER_LEN - ip::HEADER_LEN {
            return Err(NetError::Protocol);
        }
        let next_hop = if dst.same_subnet(self.config.ip, self.config.netmask)
            || dst == Ipv4Addr::BROADCAST
        {
            dst
        } else {
            self.config.gateway
        };
        let mac = self.resolve(next_hop)?;

        let mut frame = [0u8; FRAME_BUF];
        let mut off = ethernet::write_header(&mut frame, mac, self.device.mac(), ETHERTYPE_IPV4);
        off += ip::write_header(&mut frame[off..], self.config.ip, dst, proto, payload.len());
        frame[off..off + payload.len()].copy_from_slice(payload);
        self.device.send(&frame[..off + payload.len()])
    }

    fn handle_ipv4(&mut self, packet: &[u8]) {
        let Some((hdr, payload)) = ip::parse(packet) else {
            return;
        };
        if hdr.dst != self.config.ip {
            return;
        }
        // Neighbors we hear from are worth caching, but that already
        // happened at the ARP layer; IP carries no MAC to learn.
        match hdr.protocol {
            ip::PROTO_ICMP => self.handle_icmp(hdr.src, payload),
            ip::PROTO_UDP => self.handle_udp(hdr.src, payload),
            ip::PROTO_TCP => self.handle_tcp(hdr.src, payload),
            _ => {}
        }
    }

    // ===== ICMP =====

    fn handle_icmp(&mut self, src: Ipv4Addr, packet: &[u8]) {
        let Some((hdr, payload)) = icmp::parse(packet) else {
            return;
        };
        match hdr.icmp_type {
            icmp::TYPE_ECHO_REQUEST => {
                let mut reply = [0u8; FRAME_BUF - ethernet::HEADER_LEN - ip::HEADER_LEN];
                if icmp::HEADER_LEN + payload.len() > reply.len() {
                    return;
                }
                let len = icmp::write_echo(&mut reply, icmp::TYPE_ECHO_REPLY, hdr.id, hdr.seq, payload);
                let _ = self.send_ipv4(src, ip::PROTO_ICMP, &reply[..len]);
            }
            icmp::TYPE_ECHO_REPLY => {
                let now = time::ticks();
                match icmp::rtt_from_reply(payload, now) {
                    Some(rtt) => log_info!(
                        "[ICMP] reply from {} id={} seq={} rtt={}ms",
                        src,
                        hdr.id,
                        hdr.seq,
                        rtt * (1000 / time::TICK_HZ)
                    ),
                    None => log_info!("[ICMP] reply from {} id={} seq={}", src, hdr.id, hdr.seq),
                }
            }
            _ => {}
        }
    }

    /// Echo request stamped with the current tick for RTT measurement.
    pub fn send_echo_request(&mut self, dst: Ipv4Addr, id: u16, seq: u16) -> Result<(), NetError> {
        let mut payload = [0u8; 16];
        payload[..4].copy_from_slice(&time::ticks().to_be_bytes());
        payload[4..16].copy_from_slice(b"vesper-ping!");
        let mut packet = [0u8; icmp::HEADER_LEN + 16];
        let len = icmp::write_echo(&mut packet, icmp::TYPE_ECHO_REQUEST, id, seq, &payload);
        self.send_ipv4(dst, ip::PROTO_ICMP, &packet[..len])
    }

    // ===== UDP =====

    pub fn udp_bind(&mut self, port: u16, handler: UdpHandler) -> Result<(), NetError> {
        self.udp.bind(port, handler)
    }

    pub fn udp_unbind(&mut self, port: u16) {
        self.udp.unbind(port)
    }

    pub fn send_udp(
        &mut self,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let mut packet = [0u8; FRAME_BUF - ethernet::HEADER_LEN - ip::HEADER_LEN];
        if udp::HEADER_LEN + payload.len() > packet.len() {
            return Err(NetError::Protocol);
        }
        let len = udp::write_datagram(&mut packet, src_port, dst_port, payload);
        self.send_ipv4(dst, ip::PROTO_UDP, &packet[..len])
    }

    fn handle_udp(&mut self, src: Ipv4Addr, packet: &[u8]) {
        let Some((hdr, payload)) = udp::parse(packet) else {
            return;
        };
        if let Some(handler) = self.udp.handler_for(hdr.dst_port) {
            handler(src, hdr.src_port, payload);
        }
    }

    // ===== TCP =====

    fn send_tcp(
        &mut self,
        dst: Ipv4Addr,
        hdr: &TcpHeader,
        payload: &[u8],
    ) -> Result<(), NetError> {
        let mut packet = [0u8; FRAME_BUF - ethernet::HEADER_LEN - ip::HEADER_LEN];
        if tcp::HEADER_LEN + payload.len() > packet.len() {
            return Err(NetError::Protocol);
        }
        let len = tcp::write_segment(&mut packet, self.config.ip, dst, hdr, payload);
        self.send_ipv4(dst, ip::PROTO_TCP, &packet[..len])
    }

    fn handle_tcp(&mut self, src: Ipv4Addr, packet: &[u8]) {
        let Some((hdr, data)) = tcp::parse(src, self.config.ip, packet) else {
            return;
        };
        let Some(sock) = self.tcp.demux(hdr.dst_port, src, hdr.src_port) else {
            return;
        };
        let (wants_ack, reply) = {
            let pcb = match self.tcp.get_mut(sock) {
                Some(p) => p,
                None => return,
            };
            let ack = pcb.on_segment(&hdr, data);
            let reply = TcpHeader {
                src_port: pcb.local_port,
                dst_port: pcb.remote_port,
                seq: pcb.snd_nxt,
                ack: pcb.rcv_nxt,
                flags: tcp::FLAG_ACK,
                window: tcp::WINDOW_SIZE,
            };
            (ack, reply)
        };
        if wants_ack {
            let _ = self.send_tcp(src, &reply, &[]);
        }
    }

    fn tcp_timers(&mut self, now: u32) {
        for sock in 0..tcp::MAX_CONNECTIONS {
            let resend = {
                let Some(pcb) = self.tcp.get_mut(sock) else {
                    continue;
                };
                if pcb.state != TcpState::SynSent
                    || (now as i32).wrapping_sub(pcb.retrans_at as i32) < 0
                {
                    continue;
                }
                if pcb.retries >= tcp::MAX_RETRANSMITS {
                    pcb.state = TcpState::Closed;
                    None
                } else {
                    pcb.retries += 1;
                    pcb.retrans_interval *= 2;
                    pcb.retrans_at = now.wrapping_add(pcb.retrans_interval);
                    Some((
                        pcb.remote_ip,
                        TcpHeader {
                            src_port: pcb.local_port,
                            dst_port: pcb.remote_port,
                            seq: pcb.iss(),
                            ack: 0,
                            flags: tcp::FLAG_SYN,
                            window: tcp::WINDOW_SIZE,
                        },
                    ))
                }
            };
            if let Some((dst, syn)) = resend {
                let _ = self.send_tcp(dst, &syn, &[]);
            }
        }
    }

    /// Active open: SYN, pump for SYN|ACK, ACK. Retransmits with
    /// doubling backoff; gives up after 5 seconds.
    pub fn tcp_connect(&mut self, ip: Ipv4Addr, port: u16) -> Result<usize, NetError> {
        let now = time::ticks();
        let local_port = self.tcp.ephemeral_port();
        let iss = tcp::initial_sequence(now);
        let pcb = Pcb::new(local_port, ip, port, iss, now);
        let sock = self.tcp.alloc(pcb).ok_or(NetError::Unavailable)?;

        let syn = TcpHeader {
            src_port: local_port,
            dst_port: port,
            seq: iss,
            ack: 0,
            flags: tcp::FLAG_SYN,
            window: tcp::WINDOW_SIZE,
        };
        if let Err(e) = self.send_tcp(ip, &syn, &[]) {
            self.tcp.release(sock);
            return Err(e);
        }

        let deadline = now.wrapping_add(time::ms_to_ticks(tcp::CONNECT_TIMEOUT_MS));
        loop {
            self.tick();
            match self.tcp.get_mut(sock).map(|p| p.state) {
                Some(TcpState::Established) => return Ok(sock),
                Some(TcpState::Closed) | None => {
                    self.tcp.release(sock);
                    return Err(NetError::Unavailable);
                }
                _ => {}
            }
            if (time::ticks() as i32).wrapping_sub(deadline as i32) >= 0 {
                self.tcp.release(sock);
                return Err(NetError::Timeout);
            }
        }
    }

    pub fn tcp_send(&mut self, sock: usize, data: &[u8]) -> Result<usize, NetError> {
        let (dst, hdr) = {
            let pcb = self.tcp.get_mut(sock).ok_or(NetError::Unavailable)?;
            if pcb.state != TcpState::Established {
                return Err(NetError::Unavailable);
            }
            let hdr = TcpHeader {
                src_port: pcb.local_port,
                dst_port: pcb.remote_port,
                seq: pcb.snd_nxt,
                ack: pcb.rcv_nxt,
                flags: tcp::FLAG_ACK | tcp::FLAG_PSH,
                window: tcp::WINDOW_SIZE,
            };
            (pcb.remote_ip, hdr)
        };
        // The sequence space moves only once the segment is on the wire;
        // a failed transmit leaves snd_nxt where the peer expects it.
        self.send_tcp(dst, &hdr, data)?;
        if let Some(pcb) = self.tcp.get_mut(sock) {
            pcb.snd_nxt = pcb.snd_nxt.wrapping_add(data.len() as u32);
        }
        Ok(data.len())
    }

    /// Drain buffered bytes, pumping the stack while the connection is
    /// open and nothing has arrived. 0 on timeout, -2 on orderly EOF.
    pub fn tcp_receive(&mut self, sock: usize, buf: &mut [u8]) -> i32 {
        let deadline = time::ticks().wrapping_add(time::ms_to_ticks(tcp::CONNECT_TIMEOUT_MS));
        loop {
            let n = match self.tcp.get_mut(sock) {
                Some(pcb) => pcb.read(buf),
                None => return -2,
            };
            if n != 0 {
                return n;
            }
            if (time::ticks() as i32).wrapping_sub(deadline as i32) >= 0 {
                return 0;
            }
            self.tick();
        }
    }

    /// Send FIN|ACK and release the slot once the peer acknowledges (or
    /// immediately when the connection is already dead).
    pub fn tcp_close(&mut self, sock: usize) {
        let fin = {
            let Some(pcb) = self.tcp.get_mut(sock) else {
                return;
            };
            match pcb.state {
                TcpState::Established | TcpState::CloseWait => {
                    let hdr = TcpHeader {
                        src_port: pcb.local_port,
                        dst_port: pcb.remote_port,
                        seq: pcb.snd_nxt,
                        ack: pcb.rcv_nxt,
                        flags: tcp::FLAG_FIN | tcp::FLAG_ACK,
                        window: tcp::WINDOW_SIZE,
                    };
                    Some((pcb.remote_ip, hdr))
                }
                _ => None,
            }
        };
        if let Some((dst, hdr)) = fin {
            if self.send_tcp(dst, &hdr, &[]).is_ok() {
                if let Some(pcb) = self.tcp.get_mut(sock) {
                    pcb.snd_nxt = pcb.snd_nxt.wrapping_add(1); // FIN consumes one
                    pcb.state = TcpState::LastAck;
                }
            }
        } else {
            self.tcp.release(sock);
        }
    }

    pub fn tcp_state(&mut self, sock: usize) -> Option<TcpState> {
        self.tcp.get_mut(sock).map(|p| p.state)
    }
}
