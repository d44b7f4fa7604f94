//! CPU exception policy.
//!
//! Classification is pure so the rules are host-testable; the actual
//! recovery actions run in the dispatch path.

use super::Registers;

pub const EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "SIMD floating point",
    "virtualization",
    "control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "hypervisor injection",
    "VMM communication",
    "security exception",
    "reserved",
];

/// What the kernel does about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Fault raised from Ring 3: kill the offending task, keep running.
    TerminateUserTask,
    /// Kernel divide error: zero the result and step past the DIV.
    RecoverDivZero,
    /// Debug trap: log and resume.
    Log,
    /// Anything else in Ring 0 is unrecoverable.
    Panic,
}

/// Decide the fault response from the saved frame. The privilege the CPU
/// was at when it faulted is the RPL of the pushed CS.
pub fn classify(int_no: u32, cs: u32) -> FaultAction {
    if cs & 3 == 3 {
        return FaultAction::TerminateUserTask;
    }
    match int_no {
        0 => FaultAction::RecoverDivZero,
        1 | 3 => FaultAction::Log,
        _ => FaultAction::Panic,
    }
}

pub fn exception_name(int_no: u32) -> &'static str {
    EXCEPTION_NAMES
        .get(int_no as usize)
        .copied()
        .unwrap_or("unknown")
}

#[cfg(target_arch = "x86")]
pub fn handle_exception(regs: &mut Registers) {
    let name = exception_name(regs.int_no);
    match classify(regs.int_no, regs.cs) {
        FaultAction::TerminateUserTask => {
            if regs.int_no == 14 {
                log_err!(
                    "[FAULT] user {} at eip={:#010x} addr={:#010x} err={:#x}",
                    name,
                    regs.eip,
                    crate::arch::x86::read_cr2(),
                    regs.err_code
                );
            } else {
                log_err!("[FAULT] user {} at eip={:#010x}", name, regs.eip);
            }
            crate::sched::terminate_current(regs);
        }
        FaultAction::RecoverDivZero => {
            // DIV r/m32 is two bytes; resume after it with a zero result.
            log_warn!("[FAULT] kernel divide error at eip={:#010x}, zeroed", regs.eip);
            regs.eax = 0;
            regs.eip += 2;
        }
        FaultAction::Log => {
            log_debug!("[FAULT] {} at eip={:#010x}", name, regs.eip);
        }
        FaultAction::Panic => {
            crate::panic::fatal_fault(regs, name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_faults_terminate_regardless_of_vector() {
        for vector in [0u32, 6, 13, 14] {
            assert_eq!(classify(vector, 0x1B), FaultAction::TerminateUserTask);
        }
    }

    #[test]
    fn kernel_divide_error_recovers() {
        assert_eq!(classify(0, 0x08), FaultAction::RecoverDivZero);
    }

    #[test]
    fn kernel_page_fault_panics() {
        assert_eq!(classify(14, 0x08), FaultAction::Panic);
        assert_eq!(classify(13, 0x08), FaultAction::Panic);
    }

    #[test]
    fn debug_traps_just_log() {
        assert_eq!(classify(1, 0x08), FaultAction::Log);
        assert_eq!(classify(3, 0x08), FaultAction::Log);
    }

    #[test]
    fn names_cover_the_architectural_range() {
        assert_eq!(exception_name(0), "divide error");
        assert_eq!(exception_name(14), "page fault");
        assert_eq!(exception_name(99), "unknown");
    }
}
