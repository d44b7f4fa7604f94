//! Interrupt plumbing that can be verified without a CPU: gate and
//! descriptor encodings, fault classification, timer math, and the
//! syscall surface constants.

use vesper_kernel::arch::x86::gdt;
use vesper_kernel::interrupts::handlers::{classify, exception_name, FaultAction};
use vesper_kernel::interrupts::idt::{encode_gate, GATE_INTERRUPT, GATE_USER};
use vesper_kernel::interrupts::timer::divisor_for;
use vesper_kernel::interrupts::Registers;
use vesper_kernel::syscall::Errno;

const USER_CS_RPL3: u32 = 0x1B;
const KERNEL_CS: u32 = 0x08;

#[test]
fn user_faults_terminate_only_the_offending_task() {
    // A Ring 3 page fault (vector 14) must never panic the kernel.
    assert_eq!(classify(14, USER_CS_RPL3), FaultAction::TerminateUserTask);
    assert_eq!(classify(13, USER_CS_RPL3), FaultAction::TerminateUserTask);
    assert_eq!(classify(0, USER_CS_RPL3), FaultAction::TerminateUserTask);
}

#[test]
fn kernel_faults_classify_by_vector() {
    assert_eq!(classify(0, KERNEL_CS), FaultAction::RecoverDivZero);
    assert_eq!(classify(1, KERNEL_CS), FaultAction::Log);
    assert_eq!(classify(3, KERNEL_CS), FaultAction::Log);
    assert_eq!(classify(14, KERNEL_CS), FaultAction::Panic);
    assert_eq!(classify(13, KERNEL_CS), FaultAction::Panic);
    assert_eq!(exception_name(14), "page fault");
    assert_eq!(exception_name(0), "divide error");
}

#[test]
fn syscall_gate_is_ring3_callable_but_exceptions_are_not() {
    let user_gate = encode_gate(0x00C0_FFEE, 0x08, GATE_USER);
    let kernel_gate = encode_gate(0x00C0_FFEE, 0x08, GATE_INTERRUPT);
    // DPL lives in bits 45..=46 of the packed gate.
    assert_eq!((user_gate >> 45) & 3, 3);
    assert_eq!((kernel_gate >> 45) & 3, 0);
    // Offset reassembles.
    let lo = user_gate & 0xFFFF;
    let hi = (user_gate >> 48) & 0xFFFF;
    assert_eq!((hi << 16) | lo, 0x00C0_FFEE);
}

#[test]
fn gdt_selectors_match_the_published_layout() {
    assert_eq!(gdt::KERNEL_CS, 0x08);
    assert_eq!(gdt::KERNEL_DS, 0x10);
    assert_eq!(gdt::USER_CS, 0x1B);
    assert_eq!(gdt::USER_DS, 0x23);
    // RPL 3 is baked into the user selectors.
    assert_eq!(gdt::USER_CS & 3, 3);
    assert_eq!(gdt::USER_DS & 3, 3);
}

#[test]
fn pit_divisor_for_100hz() {
    assert_eq!(divisor_for(100), 11931);
    // Too-slow requests clamp to the 16-bit reload maximum (0 = 65536).
    assert_eq!(divisor_for(1), 0);
}

#[test]
fn interrupt_frame_matches_the_stub_layout() {
    // 19 pushed dwords: 4 segments, 8 GPRs, vector, error code, and the
    // 5-word CPU frame.
    assert_eq!(core::mem::size_of::<Registers>(), 19 * 4);

    let mut regs = Registers::zeroed();
    regs.cs = USER_CS_RPL3;
    assert!(regs.from_user());
    regs.cs = KERNEL_CS;
    assert!(!regs.from_user());
}

#[test]
fn syscall_errors_return_negative_errno() {
    assert_eq!(Errno::EPERM.as_ret(), -1);
    assert_eq!(Errno::EFAULT.as_ret(), -14);
    assert_eq!(Errno::ENOSYS.as_ret(), -38);
}
