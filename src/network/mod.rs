//! Networking: Ethernet, ARP, IPv4, ICMP, UDP, and client-side TCP over
//! one NIC. Protocol state lives in [`stack::NetworkStack`]; the kernel
//! owns a single instance pumped by a dedicated high-priority task.

pub mod arp;
pub mod device;
pub mod ethernet;
pub mod icmp;
pub mod ip;
pub mod stack;
pub mod tcp;
pub mod udp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Link down, no NIC, or a table is full.
    Unavailable,
    /// A deadline-based loop expired (ARP, TCP connect, receive).
    Timeout,
    /// Malformed or oversized packet.
    Protocol,
    /// No way to reach the destination.
    NoRoute,
}

impl NetError {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetError::Unavailable => "unavailable",
            NetError::Timeout => "timeout",
            NetError::Protocol => "protocol error",
            NetError::NoRoute => "no route",
        }
    }
}

#[cfg(target_arch = "x86")]
mod kernel {
    use super::device::NetworkDevice;
    use super::ethernet::MacAddr;
    use super::stack::{NetworkConfig, NetworkStack};
    use super::NetError;
    use spin::Mutex;

    /// The stack's view of the E1000 behind its driver lock.
    pub struct KernelNic {
        mac: MacAddr,
    }

    impl NetworkDevice for KernelNic {
        fn mac(&self) -> MacAddr {
            self.mac
        }

        fn link_up(&self) -> bool {
            crate::drivers::e1000::with_nic(|nic| nic.is_link_up()).unwrap_or(false)
        }

        fn send(&mut self, frame: &[u8]) -> Result<(), NetError> {
            match crate::drivers::e1000::with_nic(|nic| nic.send(frame)) {
                Some(Ok(())) => Ok(()),
                Some(Err(e)) => {
                    log_warn!("[NET] tx failed: {}", e);
                    Err(NetError::Unavailable)
                }
                None => Err(NetError::Unavailable),
            }
        }

        fn receive(&mut self, buf: &mut [u8]) -> Option<usize> {
            crate::drivers::e1000::with_nic(|nic| nic.receive(buf)).flatten()
        }
    }

    static STACK: Mutex<Option<NetworkStack<KernelNic>>> = Mutex::new(None);

    /// Bring the stack up over the E1000. Without a NIC the stack stays
    /// down and every operation reports `Unavailable`.
    pub fn init() -> Result<(), NetError> {
        let mac = crate::drivers::e1000::with_nic(|nic| MacAddr(nic.mac()))
            .ok_or(NetError::Unavailable)?;
        let stack = NetworkStack::new(KernelNic { mac }, NetworkConfig::default());
        stack.print_config();
        *STACK.lock() = Some(stack);
        Ok(())
    }

    /// One stack pass; the network task calls this in its loop.
    pub fn tick() {
        if let Some(stack) = STACK.lock().as_mut() {
            stack.tick();
        }
    }

    pub fn with_stack<R>(f: impl FnOnce(&mut NetworkStack<KernelNic>) -> R) -> Option<R> {
        STACK.lock().as_mut().map(f)
    }
}

#[cfg(target_arch = "x86")]
pub use kernel::{init, tick, with_stack, KernelNic};
