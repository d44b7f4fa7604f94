//! IDT construction and loading.

/// 32-bit interrupt gate, DPL 0.
pub const GATE_INTERRUPT: u8 = 0x8E;
/// 32-bit trap gate, DPL 0 (interrupts stay enabled).
pub const GATE_TRAP: u8 = 0x8F;
/// Interrupt gate callable from Ring 3 (the syscall vector).
pub const GATE_USER: u8 = 0xEE;

/// Encode one 8-byte IDT gate.
pub const fn encode_gate(offset: u32, selector: u16, type_attr: u8) -> u64 {
    let lo = (offset & 0xFFFF) as u64;
    let hi = ((offset >> 16) & 0xFFFF) as u64;
    lo | ((selector as u64) << 16) | ((type_attr as u64) << 40) | (hi << 48)
}

#[cfg(target_arch = "x86")]
mod install {
    use super::*;
    use crate::arch::x86::gdt::KERNEL_CS;
    use core::arch::asm;
    use core::cell::UnsafeCell;

    const IDT_ENTRIES: usize = 256;

    #[repr(C, packed)]
    struct IdtPointer {
        limit: u16,
        base: u32,
    }

    struct IdtCell(UnsafeCell<[u64; IDT_ENTRIES]>);
    unsafe impl Sync for IdtCell {}

    static IDT: IdtCell = IdtCell(UnsafeCell::new([0; IDT_ENTRIES]));

    extern "C" {
        // Stub addresses: vectors 0..47 then 0x80, built in stubs.rs.
        static isr_stub_table: [u32; 49];
    }

    /// Fill the IDT from the stub table and load it. Vector 0x80 is the
    /// only gate a user task may raise directly.
    pub fn init() {
        unsafe {
            let idt = &mut *IDT.0.get();
            for vector in 0..48 {
                idt[vector] = encode_gate(isr_stub_table[vector], KERNEL_CS, GATE_INTERRUPT);
            }
            idt[0x80] = encode_gate(isr_stub_table[48], KERNEL_CS, GATE_USER);

            let ptr = IdtPointer {
                limit: (IDT_ENTRIES * 8 - 1) as u16,
                base: IDT.0.get() as u32,
            };
            asm!("lidt [{}]", in(reg) &ptr, options(nostack, preserves_flags));
        }
        log_info!("[IDT] 48 vectors + syscall gate loaded");
    }
}

#[cfg(target_arch = "x86")]
pub use install::init;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::gdt::KERNEL_CS;

    #[test]
    fn gate_splits_offset_around_selector() {
        let g = encode_gate(0xDEAD_BEEF, KERNEL_CS, GATE_INTERRUPT);
        assert_eq!(g & 0xFFFF, 0xBEEF);
        assert_eq!((g >> 16) & 0xFFFF, KERNEL_CS as u64);
        assert_eq!((g >> 32) & 0xFF, 0); // reserved byte
        assert_eq!((g >> 40) & 0xFF, 0x8E);
        assert_eq!((g >> 48) & 0xFFFF, 0xDEAD);
    }

    #[test]
    fn syscall_gate_is_ring3_callable() {
        // DPL bits 5..6 of the attribute byte.
        assert_eq!((GATE_USER >> 5) & 3, 3);
        assert_eq!((GATE_INTERRUPT >> 5) & 3, 0);
    }
}
