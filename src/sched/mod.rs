// This file is part of the Vesper Operating System kernel.
//
//  Copyright (C) 2026 Vesper Contributors
//
//  This program is free software: you can redistribute it and/or modify
//  it under the terms of the GNU Affero General Public License as published by
//  the Free Software Foundation, either version 3 of the License, or
//  (at your option) any later version.
//
//  This program is distributed in the hope that it will be useful,
//  but WITHOUT ANY WARRANTY; without even the implied warranty of
//  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
//  GNU Affero General Public License for more details.

//! Preemptive scheduler.
//!
//! Policy lives in [`scheduler::Scheduler`]; this module owns the global
//! instance and the unsafe edges: stack allocation, context switches, CR3
//! and TSS updates, and the idle/housekeeping tasks.

pub mod scheduler;
pub mod task;

#[cfg(target_arch = "x86")]
mod context;

use spin::Mutex;

pub use scheduler::{SchedError, SchedStats, Scheduler};
pub use task::{Priority, TaskId, TaskState, Tcb};

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// Run `f` against the scheduler. IRQ paths use this too, so callers in
/// task context must have interrupts disabled to avoid self-deadlock.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    f(&mut SCHEDULER.lock())
}

/// PID of the running task, 0 if the scheduler is not up yet.
pub fn current_pid() -> u32 {
    let s = SCHEDULER.lock();
    s.current.and_then(|id| s.get(id)).map(|t| t.pid).unwrap_or(0)
}

/// Timer-tick entry, IRQ context. Returns true when a switch is due.
pub fn on_tick() -> bool {
    let now = crate::time::ticks();
    let mut s = SCHEDULER.lock();
    if let Some(cur) = s.current {
        if let Some(t) = s.get(cur) {
            if let Some(stack) = &t.kernel_stack {
                if !stack.canary_intact() {
                    let pid = t.pid;
                    drop(s);
                    panic!("kernel stack overflow in task pid {}", pid);
                }
            }
        }
    }
    s.on_tick(now)
}

pub fn stats() -> SchedStats {
    SCHEDULER.lock().stats()
}

#[cfg(target_arch = "x86")]
mod glue {
    use super::*;
    use crate::arch::x86::{self, gdt};
    use crate::interrupts::Registers;
    use crate::memory::layout::{USER_CODE_BASE, USER_STACK_TOP};
    use crate::memory::paging::{self, KernelEnv, PageFlags};
    use crate::memory::virt::{AddressSpace, PmmSupply, RegionKind};
    use task::{prime_stack, KernelStack, TaskState as State};

    /// Initial user stack span.
    const USER_STACK_SIZE: u32 = 64 * 1024;
    /// Initial user heap span.
    const USER_HEAP_INITIAL: u32 = 4 * 1024;

    /// Install the boot context as the idle task. Everything running
    /// before `enter()` is, in scheduler terms, idle.
    pub fn init() {
        let mut s = SCHEDULER.lock();
        let pid = s.alloc_pid();
        let mut idle = Tcb::new(pid, "idle", Priority::Idle);
        idle.state = State::Running;
        match s.insert(idle) {
            Ok(id) => {
                // insert() marks Ready; the boot context is in fact running.
                if let Some(t) = s.get_mut(id) {
                    t.state = State::Running;
                }
                s.idle = Some(id);
                s.current = Some(id);
                log_info!("[SCHED] idle task pid {}", pid);
            }
            Err(e) => {
                log_err!("[SCHED] cannot create idle task: {:?}", e);
            }
        }
    }

    /// Spawn a kernel-mode task. `entry(arg)` runs on a fresh 16 KiB
    /// stack; returning from it exits the task.
    pub fn spawn_kernel(
        name: &str,
        priority: Priority,
        entry: extern "C" fn(usize),
        arg: usize,
    ) -> Result<TaskId, SchedError> {
        let mut stack = KernelStack::boxed();
        let sp = prime_stack(
            &mut stack.0,
            context::trampoline_addr(),
            entry as usize as u32,
            arg as u32,
        );
        let esp = stack.0.as_ptr() as u32 + (sp as u32) * 4;

        let mut s = SCHEDULER.lock();
        let pid = s.alloc_pid();
        let mut tcb = Tcb::new(pid, name, priority);
        tcb.context_esp = esp;
        tcb.kernel_stack = Some(stack);
        let id = s.insert(tcb)?;
        log_info!("[SCHED] spawned '{}' pid {}", name, pid);
        Ok(id)
    }

    /// Spawn a Ring 3 task from a flat code image. Builds an address
    /// space (code at the fixed user base, stack at the top, a small
    /// heap), copies the image in, and primes the kernel stack so the
    /// first dispatch IRETs into user mode.
    pub fn spawn_user(name: &str, code: &[u8]) -> Result<TaskId, SchedError> {
        let kernel_pd = paging::kernel_pd().ok_or(SchedError::OutOfMemory)?;
        let mut env = KernelEnv;
        let mut frames = PmmSupply;

        let mut space = AddressSpace::create(&mut env, kernel_pd)
            .map_err(|_| SchedError::OutOfMemory)?;

        let built = (|| -> Result<(), SchedError> {
            space
                .map_region(
                    &mut env,
                    &mut frames,
                    USER_CODE_BASE,
                    code.len() as u32,
                    PageFlags::RW,
                    RegionKind::CODE,
                )
                .map_err(|_| SchedError::OutOfMemory)?;
            space
                .allocate_stack(&mut env, &mut frames, USER_STACK_SIZE)
                .map_err(|_| SchedError::OutOfMemory)?;
            space
                .allocate_heap(&mut env, &mut frames, USER_HEAP_INITIAL)
                .map_err(|_| SchedError::OutOfMemory)?;
            Ok(())
        })();
        if let Err(e) = built {
            space.destroy(&mut env, &mut frames);
            return Err(e);
        }

        // Copy the image through the identity window.
        let code_phys = space
            .regions()
            .iter()
            .find(|r| r.virt_start == USER_CODE_BASE)
            .map(|r| r.phys_start)
            .ok_or(SchedError::OutOfMemory)?;
        unsafe {
            core::ptr::copy_nonoverlapping(code.as_ptr(), code_phys as *mut u8, code.len());
        }

        let mut stack = KernelStack::boxed();
        let user_esp = USER_STACK_TOP & !0xF;
        let sp = prime_stack(
            &mut stack.0,
            context::user_enter_addr(),
            USER_CODE_BASE,
            user_esp,
        );
        let esp = stack.0.as_ptr() as u32 + (sp as u32) * 4;

        let mut s = SCHEDULER.lock();
        let pid = s.alloc_pid();
        let mut tcb = Tcb::new(pid, name, Priority::Normal);
        tcb.context_esp = esp;
        tcb.kernel_stack = Some(stack);
        tcb.user_space = Some(space);
        let id = s.insert(tcb)?;
        log_info!("[SCHED] spawned user '{}' pid {} ({} bytes)", name, pid, code.len());
        Ok(id)
    }

    /// Run the pending scheduling decision and switch stacks. Interrupts
    /// must be disabled. The scheduler lock is released before the switch
    /// so the incoming task can take it.
    fn switch_now() {
        let decision = {
            let mut s = SCHEDULER.lock();
            match s.schedule() {
                None => None,
                Some((from, to)) => {
                    let from_esp = s
                        .get_mut(from)
                        .map(|t| core::ptr::addr_of_mut!(t.context_esp));
                    let (to_esp, esp0, cr3) = match s.get(to) {
                        Some(t) => (
                            t.context_esp,
                            t.kernel_stack.as_ref().map(|k| k.top()),
                            t.user_space.as_ref().map(|u| u.pd_phys),
                        ),
                        None => return,
                    };
                    from_esp.map(|p| (p, to_esp, esp0, cr3))
                }
            }
        };

        let Some((from_esp, to_esp, esp0, cr3)) = decision else {
            return;
        };
        if let Some(top) = esp0 {
            gdt::set_kernel_stack(top);
        }
        let target_cr3 = cr3.or_else(paging::kernel_pd);
        if let Some(pd) = target_cr3 {
            if x86::read_cr3() != pd {
                unsafe { x86::load_cr3(pd) };
            }
        }
        unsafe { context::context_switch(from_esp, to_esp) };
    }

    /// Preemption point at the tail of the timer IRQ, after the EOI.
    pub fn preempt(_regs: &mut Registers) {
        switch_now();
    }

    /// Voluntarily give up the CPU.
    pub fn yield_now() {
        x86::disable_interrupts();
        switch_now();
        x86::enable_interrupts();
    }

    /// Sleep at least `ms` milliseconds.
    pub fn sleep_ms(ms: u32) {
        let ticks = crate::time::ms_to_ticks(ms);
        x86::disable_interrupts();
        {
            let now = crate::time::ticks();
            SCHEDULER.lock().sleep_current(now, ticks);
        }
        switch_now();
        x86::enable_interrupts();
    }

    /// Terminate the calling task.
    pub fn exit_current(code: i32) -> ! {
        x86::disable_interrupts();
        SCHEDULER.lock().finish_current(code);
        switch_now();
        // A finished task is never selected again.
        x86::halt_loop()
    }

    /// Kill the current task from a fault handler. The kernel page
    /// directory is restored first so the reaper can free the task's one.
    pub fn terminate_current(_regs: &mut Registers) {
        if let Some(pd) = paging::kernel_pd() {
            unsafe { x86::load_cr3(pd) };
        }
        SCHEDULER.lock().finish_current(-1);
        switch_now();
        x86::halt_loop()
    }

    /// Move FINISHED tasks to ZOMBIE, then free their stacks and address
    /// spaces and release the slots.
    pub fn reap_finished() {
        let zombies = {
            x86::disable_interrupts();
            let z = SCHEDULER.lock().collect_finished();
            x86::enable_interrupts();
            z
        };
        for id in zombies {
            let tcb = {
                x86::disable_interrupts();
                let t = SCHEDULER.lock().reap(id);
                x86::enable_interrupts();
                t
            };
            if let Some(mut tcb) = tcb {
                if let Some(space) = tcb.user_space.take() {
                    let mut env = KernelEnv;
                    let mut frames = PmmSupply;
                    space.destroy(&mut env, &mut frames);
                }
                log_info!("[SCHED] reaped pid {} (exit {})", tcb.pid, tcb.exit_code);
                // Kernel stack is dropped here.
            }
        }
    }

    extern "C" fn housekeeping_main(_arg: usize) {
        loop {
            reap_finished();
            crate::memory::heap::maintain();
            sleep_ms(5_000);
        }
    }

    extern "C" fn network_main(_arg: usize) {
        loop {
            crate::network::tick();
            yield_now();
        }
    }

    /// Periodic kernel services: the reaper/heap task and the network
    /// pump, which must never run from IRQ context.
    pub fn spawn_housekeeping() {
        if let Err(e) = spawn_kernel("housekeeping", Priority::Low, housekeeping_main, 0) {
            log_err!("[SCHED] housekeeping spawn failed: {:?}", e);
        }
        if let Err(e) = spawn_kernel("net", Priority::High, network_main, 0) {
            log_err!("[SCHED] net task spawn failed: {:?}", e);
        }
    }

    /// Hand the boot context over to the scheduler: from here on this
    /// stack is the idle task.
    pub fn enter() -> ! {
        SCHEDULER.lock().enabled = true;
        x86::enable_interrupts();
        loop {
            x86::halt();
        }
    }
}

#[cfg(target_arch = "x86")]
pub use glue::{
    enter, exit_current, init, preempt, reap_finished, sleep_ms, spawn_housekeeping,
    spawn_kernel, spawn_user, terminate_current, yield_now,
};
