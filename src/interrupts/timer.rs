//! PIT channel 0, the preemption heartbeat.

/// PIT input clock in Hz.
pub const PIT_BASE_HZ: u32 = 1_193_182;

/// Reload value for a target tick rate. The PIT treats 0 as 65536, which
/// covers rates below ~18.2 Hz.
pub fn divisor_for(hz: u32) -> u16 {
    let d = PIT_BASE_HZ / hz.max(1);
    if d > 0xFFFF {
        0
    } else {
        d as u16
    }
}

#[cfg(target_arch = "x86")]
mod hw {
    use super::*;
    use crate::arch::x86::port::outb;
    use crate::interrupts::pic;

    const PIT_CHANNEL0: u16 = 0x40;
    const PIT_COMMAND: u16 = 0x43;
    // Channel 0, lobyte/hibyte, rate generator.
    const PIT_MODE: u8 = 0x36;

    /// Program the PIT and unmask IRQ 0.
    pub fn init(hz: u32) {
        let divisor = divisor_for(hz);
        unsafe {
            outb(PIT_COMMAND, PIT_MODE);
            outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
            outb(PIT_CHANNEL0, (divisor >> 8) as u8);
        }
        pic::unmask(0);
        log_info!("[PIT] {} Hz (divisor {})", hz, divisor);
    }
}

#[cfg(target_arch = "x86")]
pub use hw::init;
