//! 8259 PIC pair.
//!
//! Remapped so IRQ 0..15 land on vectors 32..47, clear of CPU exceptions.

pub const PIC1_OFFSET: u8 = 32;
pub const PIC2_OFFSET: u8 = 40;

#[cfg(target_arch = "x86")]
mod hw {
    use super::*;
    use crate::arch::x86::port::{inb, io_wait, outb};

    const PIC1_COMMAND: u16 = 0x20;
    const PIC1_DATA: u16 = 0x21;
    const PIC2_COMMAND: u16 = 0xA0;
    const PIC2_DATA: u16 = 0xA1;

    const PIC_EOI: u8 = 0x20;
    const ICW1_INIT: u8 = 0x10;
    const ICW1_ICW4: u8 = 0x01;
    const ICW4_8086: u8 = 0x01;

    /// Remap both PICs and restore the saved masks.
    pub fn init() {
        unsafe {
            let mask1 = inb(PIC1_DATA);
            let mask2 = inb(PIC2_DATA);

            outb(PIC1_COMMAND, ICW1_INIT | ICW1_ICW4);
            io_wait();
            outb(PIC2_COMMAND, ICW1_INIT | ICW1_ICW4);
            io_wait();
            outb(PIC1_DATA, PIC1_OFFSET);
            io_wait();
            outb(PIC2_DATA, PIC2_OFFSET);
            io_wait();
            outb(PIC1_DATA, 4); // slave on IRQ 2
            io_wait();
            outb(PIC2_DATA, 2);
            io_wait();
            outb(PIC1_DATA, ICW4_8086);
            io_wait();
            outb(PIC2_DATA, ICW4_8086);
            io_wait();

            outb(PIC1_DATA, mask1);
            outb(PIC2_DATA, mask2);
        }
        log_info!("[PIC] remapped to {}/{}", PIC1_OFFSET, PIC2_OFFSET);
    }

    /// Acknowledge `irq` (0..15). Slave IRQs need both controllers.
    pub fn end_of_interrupt(irq: u8) {
        unsafe {
            if irq >= 8 {
                outb(PIC2_COMMAND, PIC_EOI);
            }
            outb(PIC1_COMMAND, PIC_EOI);
        }
    }

    pub fn unmask(irq: u8) {
        unsafe {
            if irq < 8 {
                let m = inb(PIC1_DATA);
                outb(PIC1_DATA, m & !(1 << irq));
            } else {
                let m = inb(PIC2_DATA);
                outb(PIC2_DATA, m & !(1 << (irq - 8)));
                // Cascade line must be open for any slave IRQ.
                let m1 = inb(PIC1_DATA);
                outb(PIC1_DATA, m1 & !(1 << 2));
            }
        }
    }

    pub fn mask(irq: u8) {
        unsafe {
            if irq < 8 {
                let m = inb(PIC1_DATA);
                outb(PIC1_DATA, m | (1 << irq));
            } else {
                let m = inb(PIC2_DATA);
                outb(PIC2_DATA, m | (1 << (irq - 8)));
            }
        }
    }
}

#[cfg(target_arch = "x86")]
pub use hw::*;
