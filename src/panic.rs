//! Kernel panic path.
//!
//! A fatal fault or `panic!` dumps the saved registers, walks the frame
//! pointer chain for a bounded backtrace, flushes recent log entries to
//! the sinks, and halts with interrupts off. The frame walk is pure so
//! its cutoffs are host-tested.

pub const MAX_BACKTRACE_FRAMES: usize = 5;

/// One `(ebp, return address)` pair read during the walk.
pub trait StackReader {
    /// Read the two words at `ebp`: saved EBP and return EIP. `None` when
    /// the address cannot be read.
    fn frame_at(&self, ebp: u32) -> Option<(u32, u32)>;
}

/// Walk the saved-EBP chain. Stops at `MAX_BACKTRACE_FRAMES`, on a null
/// or non-ascending frame pointer, or on a return address below 1 MiB
/// (not kernel text).
pub fn walk_frames(reader: &impl StackReader, mut ebp: u32) -> heapless::Vec<u32, MAX_BACKTRACE_FRAMES> {
    let mut frames = heapless::Vec::new();
    while frames.len() < MAX_BACKTRACE_FRAMES {
        if ebp == 0 || ebp & 3 != 0 {
            break;
        }
        let Some((next_ebp, ret)) = reader.frame_at(ebp) else {
            break;
        };
        if ret < 0x0010_0000 {
            break;
        }
        if frames.push(ret).is_err() {
            break;
        }
        if next_ebp <= ebp {
            break;
        }
        ebp = next_ebp;
    }
    frames
}

#[cfg(target_arch = "x86")]
mod fatal {
    use super::*;
    use crate::interrupts::Registers;

    struct KernelStackReader;

    impl StackReader for KernelStackReader {
        fn frame_at(&self, ebp: u32) -> Option<(u32, u32)> {
            // The walk starts from a live kernel EBP; both words are on a
            // mapped kernel stack.
            unsafe {
                let next = (ebp as *const u32).read();
                let ret = ((ebp + 4) as *const u32).read();
                Some((next, ret))
            }
        }
    }

    /// Unrecoverable CPU exception in Ring 0. Never returns.
    pub fn fatal_fault(regs: &Registers, name: &str) -> ! {
        if let Some(logger) = crate::log::try_get_logger() {
            logger.enter_panic_mode();
        }
        log_fatal!("KERNEL PANIC: {} (vector {})", name, regs.int_no);
        log_fatal!(
            "  eip={:#010x} cs={:#06x} eflags={:#010x} err={:#x}",
            regs.eip,
            regs.cs,
            regs.eflags,
            regs.err_code
        );
        log_fatal!(
            "  eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
            regs.eax,
            regs.ebx,
            regs.ecx,
            regs.edx
        );
        log_fatal!(
            "  esi={:#010x} edi={:#010x} ebp={:#010x}",
            regs.esi,
            regs.edi,
            regs.ebp
        );
        if regs.int_no == 14 {
            log_fatal!("  cr2={:#010x}", crate::arch::x86::read_cr2());
        }
        backtrace(regs.ebp);
        crate::arch::x86::halt_loop()
    }

    fn backtrace(ebp: u32) {
        let frames = walk_frames(&KernelStackReader, ebp);
        for (i, ret) in frames.iter().enumerate() {
            log_fatal!("  #{}: {:#010x}", i, ret);
        }
    }

    /// `panic!` from kernel code (assertion failures, explicit panics).
    #[cfg(not(test))]
    #[panic_handler]
    fn panic_handler(info: &core::panic::PanicInfo) -> ! {
        crate::arch::x86::disable_interrupts();
        if let Some(logger) = crate::log::try_get_logger() {
            logger.enter_panic_mode();
        }
        log_fatal!("KERNEL PANIC: {}", info.message());
        if let Some(loc) = info.location() {
            log_fatal!("  at {}:{}", loc.file(), loc.line());
        }
        let ebp: u32;
        unsafe {
            core::arch::asm!("mov {}, ebp", out(reg) ebp, options(nostack, preserves_flags));
        }
        backtrace(ebp);
        crate::arch::x86::halt_loop()
    }
}

#[cfg(target_arch = "x86")]
pub use fatal::fatal_fault;
