//! Vesper kernel core.
//!
//! 32-bit x86 kernel: physical/virtual memory management, preemptive
//! scheduler with Ring 3 support, INT 0x80 syscalls, and a hand-rolled
//! Ethernet/ARP/IPv4/ICMP/UDP/TCP stack over an E1000-class NIC.
//!
//! Hardware access (inline asm, port IO, MMIO) is confined to
//! `cfg(target_arch = "x86")` code; everything algorithmic runs on the
//! host under `cargo test`.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod arch;
pub mod boot;
pub mod drivers;
pub mod interrupts;
pub mod memory;
pub mod network;
pub mod panic;
pub mod sched;
pub mod syscall;
pub mod time;

pub use alloc::format;

/// Kernel entry, called from the boot shim with the multiboot2 magic and
/// info pointer. Never returns.
#[cfg(target_arch = "x86")]
pub fn kernel_main(magic: u32, mbi: *const u8) -> ! {
    crate::log::init();
    log_info!("[BOOT] Vesper kernel starting");

    let boot_info = match unsafe { crate::boot::parse(magic, mbi) } {
        Ok(info) => info,
        Err(e) => {
            log_err!("[BOOT] bad boot info: {}", e);
            crate::arch::x86::halt_loop();
        }
    };

    crate::arch::x86::gdt::init();
    crate::interrupts::init();
    if let Err(e) = unsafe { crate::memory::init(&boot_info) } {
        log_err!("[BOOT] memory init failed: {}", e.as_str());
        crate::arch::x86::halt_loop();
    }
    crate::sched::init();
    crate::syscall::init();
    crate::interrupts::timer::init(crate::time::TICK_HZ);

    crate::drivers::init();
    if let Err(e) = crate::network::init() {
        log_warn!("[BOOT] network stays down: {}", e.as_str());
    }

    crate::sched::spawn_housekeeping();

    log_info!("[BOOT] kernel online");
    crate::sched::enter();
}
