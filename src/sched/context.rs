//! Context switching and task entry trampolines.
//!
//! A context switch stores only the callee-saved registers and ESP; the
//! rest of the CPU state lives in the interrupt frame already on the
//! outgoing task's kernel stack. Fresh stacks are primed (see
//! [`prime_stack`](super::task::prime_stack)) so the first switch into
//! them "returns" into one of the trampolines below.

#![cfg(target_arch = "x86")]

use crate::arch::x86::gdt::{USER_CS, USER_DS};
use crate::sched::task::INITIAL_EFLAGS;

core::arch::global_asm!(
    r#"
.global context_switch
context_switch:
    push ebp
    push ebx
    push esi
    push edi
    mov eax, [esp + 20]
    mov ecx, [esp + 24]
    mov [eax], esp
    mov esp, ecx
    pop edi
    pop esi
    pop ebx
    pop ebp
    ret
"#
);

extern "C" {
    /// Save ESP to `*save_esp`, adopt `load_esp`, resume whatever that
    /// stack was doing. Interrupts must be disabled across the call.
    pub fn context_switch(save_esp: *mut u32, load_esp: u32);
}

/// First frame of every kernel task. Runs with the scheduler lock
/// released and interrupts re-enabled.
#[no_mangle]
extern "C" fn task_trampoline(entry: extern "C" fn(usize), arg: usize) -> ! {
    crate::arch::x86::enable_interrupts();
    entry(arg);
    crate::sched::exit_current(0)
}

/// First frame of every user task: drop to Ring 3 with an IRET whose
/// frame carries the user selectors and IF set.
#[no_mangle]
extern "C" fn user_enter(entry: u32, user_esp: u32) -> ! {
    unsafe {
        core::arch::asm!(
            "mov ax, {uds}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "push {uds}",
            "push {uesp}",
            "push {eflags}",
            "push {ucs}",
            "push {ueip}",
            "iretd",
            uds = const USER_DS as u32,
            ucs = const USER_CS as u32,
            eflags = const INITIAL_EFLAGS,
            uesp = in(reg) user_esp,
            ueip = in(reg) entry,
            out("eax") _,
            options(noreturn),
        )
    }
}

pub fn trampoline_addr() -> u32 {
    task_trampoline as usize as u32
}

pub fn user_enter_addr() -> u32 {
    user_enter as usize as u32
}
