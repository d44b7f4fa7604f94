//! Task control blocks and stack priming.

use alloc::boxed::Box;

use crate::arch::x86::gdt::{USER_CS, USER_DS};
use crate::memory::virt::AddressSpace;

pub const MAX_TASKS: usize = 32;
/// Default quantum in timer ticks.
pub const QUANTUM_TICKS: u32 = 10;
/// Kernel stack: 16 KiB per task.
pub const TASK_STACK_WORDS: usize = 4096;
pub const STACK_CANARY: u32 = 0xDEAD_BEEF;

/// EFLAGS with IF set, the state every new task starts in.
pub const INITIAL_EFLAGS: u32 = 0x202;

/// Stable handle: an arena slot index. Valid until the slot is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Ready,
    Running,
    Sleeping,
    /// Parked on an event. Input paths still poll with yield loops, so
    /// nothing enters this state today.
    Waiting,
    /// Exited; off the ring, slot and resources still held.
    Finished,
    /// Claimed by the reaper, teardown in progress.
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    Normal = 3,
    High = 6,
}

#[repr(C, align(16))]
pub struct KernelStack(pub [u32; TASK_STACK_WORDS]);

impl KernelStack {
    pub fn boxed() -> Box<KernelStack> {
        let mut stack = Box::new(KernelStack([0; TASK_STACK_WORDS]));
        stack.0[0] = STACK_CANARY;
        stack
    }

    pub fn canary_intact(&self) -> bool {
        self.0[0] == STACK_CANARY
    }

    pub fn top(&self) -> u32 {
        self.0.as_ptr() as u32 + (TASK_STACK_WORDS as u32) * 4
    }
}

pub struct Tcb {
    pub pid: u32,
    pub name: heapless::String<16>,
    pub state: TaskState,
    pub priority: u8,
    pub quantum_left: u32,
    pub ticks_run: u64,
    pub sleep_until: u32,
    pub next: Option<TaskId>,
    pub prev: Option<TaskId>,
    /// Saved kernel ESP; where `context_switch` left this task.
    pub context_esp: u32,
    pub kernel_stack: Option<Box<KernelStack>>,
    pub user_space: Option<AddressSpace>,
    pub exit_code: i32,
}

impl Tcb {
    pub fn new(pid: u32, name: &str, priority: Priority) -> Tcb {
        let mut n = heapless::String::new();
        let mut cut = name.len().min(16);
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        let _ = n.push_str(&name[..cut]);
        Tcb {
            pid,
            name: n,
            state: TaskState::Created,
            priority: priority as u8,
            quantum_left: QUANTUM_TICKS,
            ticks_run: 0,
            sleep_until: 0,
            next: None,
            prev: None,
            context_esp: 0,
            kernel_stack: None,
            user_space: None,
            exit_code: 0,
        }
    }

    pub fn is_user(&self) -> bool {
        self.user_space.is_some()
    }

    /// Bytes of kernel stack in use, clamped to the stack size.
    pub fn stack_usage(&self) -> u32 {
        match &self.kernel_stack {
            Some(stack) => {
                let top = stack.top();
                let size = (TASK_STACK_WORDS as u32) * 4;
                if self.context_esp == 0 || self.context_esp >= top {
                    0
                } else {
                    (top - self.context_esp).min(size)
                }
            }
            None => 0,
        }
    }
}

/// Prime a fresh kernel stack so the first `context_switch` into it
/// "returns" into `trampoline(entry, arg)` under the cdecl convention.
///
/// Top-down layout after priming: `arg`, `entry`, a dummy return address,
/// the trampoline (popped by `ret`), then zeroed EBP/EBX/ESI/EDI. Returns
/// the word index the stack pointer must start at.
pub fn prime_stack(stack: &mut [u32], trampoline: u32, entry: u32, arg: u32) -> usize {
    let n = stack.len();
    stack[n - 1] = arg;
    stack[n - 2] = entry;
    stack[n - 3] = 0; // trampoline never returns
    stack[n - 4] = trampoline;
    stack[n - 5] = 0; // ebp
    stack[n - 6] = 0; // ebx
    stack[n - 7] = 0; // esi
    stack[n - 8] = 0; // edi
    n - 8
}

/// The IRET frame a user trampoline pushes: EIP, CS, EFLAGS, ESP, SS with
/// user selectors (RPL 3) and interrupts enabled.
pub fn user_iret_frame(entry: u32, user_esp: u32) -> [u32; 5] {
    [entry, USER_CS as u32, INITIAL_EFLAGS, user_esp, USER_DS as u32]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primed_stack_returns_into_trampoline() {
        let mut stack = [0u32; 64];
        let sp = prime_stack(&mut stack, 0x1111_0000, 0x2222_0000, 7);
        assert_eq!(sp, 56);
        // Four callee-saved slots, then the trampoline return address.
        assert_eq!(&stack[sp..sp + 4], &[0, 0, 0, 0]);
        assert_eq!(stack[sp + 4], 0x1111_0000);
        // cdecl view from inside the trampoline: [ret][entry][arg].
        assert_eq!(stack[sp + 5], 0);
        assert_eq!(stack[sp + 6], 0x2222_0000);
        assert_eq!(stack[sp + 7], 7);
    }

    #[test]
    fn user_frame_has_ring3_selectors_and_if() {
        let frame = user_iret_frame(0x0800_0000, 0xBFFF_FFF0);
        assert_eq!(frame[1] & 3, 3);
        assert_eq!(frame[4] & 3, 3);
        assert_ne!(frame[2] & 0x200, 0);
        assert_eq!(frame[0], 0x0800_0000);
        assert_eq!(frame[3], 0xBFFF_FFF0);
    }

    #[test]
    fn name_truncates_on_a_char_boundary() {
        // Byte 16 falls inside the two-byte 'é'.
        let tcb = Tcb::new(3, "tâche-监视-réseau", Priority::Normal);
        assert_eq!(tcb.name.as_str(), "tâche-监视-r");
        assert!(tcb.name.len() <= 16);

        let short = Tcb::new(4, "net", Priority::Normal);
        assert_eq!(short.name.as_str(), "net");
    }

    #[test]
    fn fresh_stack_carries_canary() {
        let stack = KernelStack::boxed();
        assert!(stack.canary_intact());
    }

    #[test]
    fn stack_usage_clamps() {
        let mut tcb = Tcb::new(1, "t", Priority::Normal);
        assert_eq!(tcb.stack_usage(), 0);
        let stack = KernelStack::boxed();
        let top = stack.top();
        tcb.kernel_stack = Some(stack);
        tcb.context_esp = top - 256;
        assert_eq!(tcb.stack_usage(), 256);
    }
}
