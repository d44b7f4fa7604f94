//! Link-layer device abstraction the stack runs on.

use super::ethernet::MacAddr;
use super::NetError;

/// One NIC as the stack sees it. The E1000 driver implements this on
/// hardware; tests use scripted devices.
pub trait NetworkDevice {
    fn mac(&self) -> MacAddr;
    fn link_up(&self) -> bool;
    fn send(&mut self, frame: &[u8]) -> Result<(), NetError>;
    /// Copy the next pending frame into `buf`, returning its length.
    fn receive(&mut self, buf: &mut [u8]) -> Option<usize>;
}

#[cfg(test)]
pub mod testdev {
    //! Scripted peer for stack tests. Frames queued with `push_rx` appear
    //! on `receive`; everything sent lands in `sent`. Each empty receive
    //! poll advances the clock so deadline loops terminate.

    use super::*;
    use std::collections::VecDeque;
    use std::vec::Vec;

    pub struct ScriptedDevice {
        pub mac: MacAddr,
        pub rx: VecDeque<Vec<u8>>,
        pub sent: Vec<Vec<u8>>,
        pub link: bool,
        /// Ticks added per empty poll.
        pub tick_step: u32,
    }

    impl ScriptedDevice {
        pub fn new(mac: [u8; 6]) -> ScriptedDevice {
            ScriptedDevice {
                mac: MacAddr(mac),
                rx: VecDeque::new(),
                sent: Vec::new(),
                link: true,
                tick_step: 5,
            }
        }

        pub fn push_rx(&mut self, frame: &[u8]) {
            self.rx.push_back(frame.to_vec());
        }
    }

    impl NetworkDevice for ScriptedDevice {
        fn mac(&self) -> MacAddr {
            self.mac
        }

        fn link_up(&self) -> bool {
            self.link
        }

        fn send(&mut self, frame: &[u8]) -> Result<(), NetError> {
            if !self.link {
                return Err(NetError::Unavailable);
            }
            self.sent.push(frame.to_vec());
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8]) -> Option<usize> {
            match self.rx.pop_front() {
                Some(frame) => {
                    let len = frame.len().min(buf.len());
                    buf[..len].copy_from_slice(&frame[..len]);
                    Some(len)
                }
                None => {
                    crate::time::advance(self.tick_step);
                    None
                }
            }
        }
    }
}
