//! x86 (32-bit) CPU primitives: control registers, interrupt flag, halt,
//! port IO, GDT/TSS.

pub mod gdt;
pub mod port;

#[cfg(target_arch = "x86")]
mod cpu {
    use core::arch::asm;

    /// Load CR3 and turn on paging. CR4.PSE is set first so 4 MiB
    /// directory entries are honored; CR0.WP keeps the kernel honest about
    /// read-only pages.
    pub unsafe fn enable_paging(pd_phys: u32) {
        unsafe {
            let mut cr4: u32;
            asm!("mov {}, cr4", out(reg) cr4, options(nostack, preserves_flags));
            cr4 |= 1 << 4; // PSE
            asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));

            asm!("mov cr3, {}", in(reg) pd_phys, options(nostack, preserves_flags));

            let mut cr0: u32;
            asm!("mov {}, cr0", out(reg) cr0, options(nostack, preserves_flags));
            cr0 |= (1 << 31) | (1 << 16); // PG | WP
            asm!("mov cr0, {}", in(reg) cr0, options(nostack));
        }
    }

    pub unsafe fn load_cr3(pd_phys: u32) {
        unsafe {
            asm!("mov cr3, {}", in(reg) pd_phys, options(nostack, preserves_flags));
        }
    }

    pub fn read_cr3() -> u32 {
        let v: u32;
        unsafe {
            asm!("mov {}, cr3", out(reg) v, options(nostack, preserves_flags));
        }
        v
    }

    /// Faulting address of the last page fault.
    pub fn read_cr2() -> u32 {
        let v: u32;
        unsafe {
            asm!("mov {}, cr2", out(reg) v, options(nostack, preserves_flags));
        }
        v
    }

    #[inline]
    pub fn enable_interrupts() {
        unsafe { asm!("sti", options(nostack, preserves_flags)) }
    }

    #[inline]
    pub fn disable_interrupts() {
        unsafe { asm!("cli", options(nostack, preserves_flags)) }
    }

    /// Sleep until the next interrupt.
    #[inline]
    pub fn halt() {
        unsafe { asm!("hlt", options(nostack, preserves_flags)) }
    }

    /// Dead end for unrecoverable states: interrupts off, halt forever.
    pub fn halt_loop() -> ! {
        loop {
            unsafe {
                asm!("cli", "hlt", options(nostack, preserves_flags));
            }
        }
    }
}

#[cfg(target_arch = "x86")]
pub use cpu::*;
