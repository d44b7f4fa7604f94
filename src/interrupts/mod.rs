//! Interrupt management: IDT, legacy PIC pair, PIT tick source, exception
//! policy, and the single dispatch entry all stubs funnel into.

pub mod apic;
pub mod handlers;
pub mod idt;
pub mod pic;
mod stubs;
pub mod timer;

use core::sync::atomic::AtomicU64;
use spin::Mutex;

pub const TIMER_VECTOR: u32 = 32;
pub const KEYBOARD_VECTOR: u32 = 33;
pub const SYSCALL_VECTOR: u32 = 0x80;

/// Saved CPU state, in the exact order the entry stubs push it. Segment
/// registers first (pushed last), then PUSHA, then the vector/error pair,
/// then the CPU's own interrupt frame. `useresp`/`ss` are only valid when
/// the interrupt came from Ring 3.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub useresp: u32,
    pub ss: u32,
}

impl Registers {
    pub const fn zeroed() -> Registers {
        Registers {
            gs: 0,
            fs: 0,
            es: 0,
            ds: 0,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_dummy: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            int_no: 0,
            err_code: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            useresp: 0,
            ss: 0,
        }
    }

    /// True when the saved frame came from user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

pub struct InterruptStats {
    pub timer_ticks: AtomicU64,
    pub syscalls: AtomicU64,
    pub exceptions: AtomicU64,
    pub spurious: AtomicU64,
}

pub static INTERRUPT_STATS: InterruptStats = InterruptStats {
    timer_ticks: AtomicU64::new(0),
    syscalls: AtomicU64::new(0),
    exceptions: AtomicU64::new(0),
    spurious: AtomicU64::new(0),
};

/// Device IRQ handlers, indexed by IRQ line. Registered during driver
/// init, before interrupts are enabled, so the dispatch read is uncontended.
static IRQ_HANDLERS: Mutex<[Option<fn()>; 16]> = Mutex::new([None; 16]);

pub fn register_irq_handler(irq: u8, handler: fn()) {
    IRQ_HANDLERS.lock()[irq as usize] = Some(handler);
    #[cfg(target_arch = "x86")]
    pic::unmask(irq);
}

#[cfg(target_arch = "x86")]
pub fn init() {
    pic::init();
    idt::init();
    apic::detect();
}

/// Called from the assembly stubs with the saved frame. For IRQs the EOI
/// goes out after the handler and before any task switch.
#[cfg(target_arch = "x86")]
#[no_mangle]
extern "C" fn interrupt_dispatch(regs: &mut Registers) {
    use core::sync::atomic::Ordering;

    let int_no = regs.int_no;

    if int_no < 32 {
        INTERRUPT_STATS.exceptions.fetch_add(1, Ordering::Relaxed);
        handlers::handle_exception(regs);
        return;
    }

    if int_no == SYSCALL_VECTOR {
        INTERRUPT_STATS.syscalls.fetch_add(1, Ordering::Relaxed);
        crate::syscall::handle(regs);
        return;
    }

    let irq = (int_no - 32) as u8;
    if irq == 0 {
        INTERRUPT_STATS.timer_ticks.fetch_add(1, Ordering::Relaxed);
        crate::time::advance(1);
        let resched = crate::sched::on_tick();
        pic::end_of_interrupt(0);
        if resched {
            crate::sched::preempt(regs);
        }
        return;
    }

    let handler = IRQ_HANDLERS.lock()[irq as usize];
    match handler {
        Some(h) => h(),
        None => {
            INTERRUPT_STATS.spurious.fetch_add(1, Ordering::Relaxed);
        }
    }
    pic::end_of_interrupt(irq);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_frame_is_19_words() {
        assert_eq!(core::mem::size_of::<Registers>(), 19 * 4);
    }

    #[test]
    fn privilege_comes_from_saved_cs() {
        let mut regs = Registers::zeroed();
        regs.cs = 0x08;
        assert!(!regs.from_user());
        regs.cs = 0x1B;
        assert!(regs.from_user());
    }
}
