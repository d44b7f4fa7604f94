//! Ring scheduler core.
//!
//! Arena of TCB slots plus a circular doubly-linked ready ring threaded
//! through `Option<TaskId>` links. Selection, quantum accounting, sleep
//! wakeup, and reaping are all synchronous and run either from the timer
//! IRQ or from a task that asked to give up the CPU; there is no inner
//! locking. Everything here is pure state manipulation, so the whole
//! policy is exercised by host tests.

use crate::sched::task::{TaskId, TaskState, Tcb, MAX_TASKS, QUANTUM_TICKS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    TableFull,
    BadHandle,
    OutOfMemory,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedStats {
    pub switches: u64,
    pub tasks: usize,
    pub ready: usize,
}

pub struct Scheduler {
    slots: [Option<Tcb>; MAX_TASKS],
    pub current: Option<TaskId>,
    pub idle: Option<TaskId>,
    ring_head: Option<TaskId>,
    next_pid: u32,
    pub enabled: bool,
    switches: u64,
}

impl Scheduler {
    pub const fn new() -> Scheduler {
        Scheduler {
            slots: [const { None }; MAX_TASKS],
            current: None,
            idle: None,
            ring_head: None,
            next_pid: 1,
            enabled: false,
            switches: 0,
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&Tcb> {
        self.slots.get(id.0 as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Tcb> {
        self.slots.get_mut(id.0 as usize).and_then(|s| s.as_mut())
    }

    pub fn alloc_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Place a TCB in a free slot and append it to the ring tail, so ring
    /// order is insertion order. The task becomes READY.
    pub fn insert(&mut self, mut tcb: Tcb) -> Result<TaskId, SchedError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(SchedError::TableFull)?;
        let id = TaskId(slot as u8);
        tcb.state = TaskState::Ready;
        self.slots[slot] = Some(tcb);
        self.ring_insert_tail(id);
        Ok(id)
    }

    fn ring_insert_tail(&mut self, id: TaskId) {
        match self.ring_head {
            None => {
                if let Some(t) = self.get_mut(id) {
                    t.next = Some(id);
                    t.prev = Some(id);
                }
                self.ring_head = Some(id);
            }
            Some(head) => {
                let tail = self.get(head).and_then(|h| h.prev).unwrap_or(head);
                if let Some(t) = self.get_mut(id) {
                    t.next = Some(head);
                    t.prev = Some(tail);
                }
                if let Some(t) = self.get_mut(tail) {
                    t.next = Some(id);
                }
                if let Some(h) = self.get_mut(head) {
                    h.prev = Some(id);
                }
            }
        }
    }

    fn ring_remove(&mut self, id: TaskId) {
        let (next, prev) = match self.get(id) {
            Some(t) => (t.next, t.prev),
            None => return,
        };
        if next == Some(id) {
            // Last node.
            self.ring_head = None;
        } else {
            if let (Some(p), Some(n)) = (prev, next) {
                if let Some(t) = self.get_mut(p) {
                    t.next = Some(n);
                }
                if let Some(t) = self.get_mut(n) {
                    t.prev = Some(p);
                }
            }
            if self.ring_head == Some(id) {
                self.ring_head = next;
            }
        }
        if let Some(t) = self.get_mut(id) {
            t.next = None;
            t.prev = None;
        }
    }

    /// One timer tick: wake due sleepers, account the running task's
    /// quantum. Returns true when a scheduling decision is due.
    pub fn on_tick(&mut self, now: u32) -> bool {
        for slot in 0..MAX_TASKS {
            let id = TaskId(slot as u8);
            if let Some(t) = self.get_mut(id) {
                if t.state == TaskState::Sleeping && t.sleep_until <= now {
                    t.state = TaskState::Ready;
                }
            }
        }

        let Some(cur) = self.current else {
            return self.enabled;
        };
        let mut resched = false;
        if let Some(t) = self.get_mut(cur) {
            t.ticks_run += 1;
            if t.state == TaskState::Running {
                t.quantum_left = t.quantum_left.saturating_sub(1);
                if t.quantum_left == 0 {
                    resched = true;
                }
            } else {
                // Current slept, blocked, or exited under us.
                resched = true;
            }
        }
        // The idle task cedes as soon as real work exists.
        if Some(cur) == self.idle && self.any_ready_except_idle() {
            resched = true;
        }
        resched && self.enabled
    }

    fn any_ready_except_idle(&self) -> bool {
        self.ring_iter()
            .any(|id| Some(id) != self.idle && self.get(id).map(|t| t.state == TaskState::Ready) == Some(true))
    }

    fn ring_iter(&self) -> RingIter<'_> {
        RingIter { sched: self, start: self.ring_head, cursor: self.ring_head, done: self.ring_head.is_none() }
    }

    /// Pick the next task: scan ring order starting after `current`,
    /// preferring the highest priority among READY tasks, first-in-ring on
    /// ties. Idle is the fallback of last resort.
    pub fn select_next(&self) -> Option<TaskId> {
        let start = self
            .current
            .and_then(|c| self.get(c).and_then(|t| t.next))
            .or(self.ring_head)?;

        let mut best: Option<(TaskId, u8)> = None;
        let mut cursor = start;
        loop {
            if Some(cursor) != self.idle {
                if let Some(t) = self.get(cursor) {
                    if t.state == TaskState::Ready && best.map(|(_, p)| t.priority > p).unwrap_or(true)
                    {
                        best = Some((cursor, t.priority));
                    }
                }
            }
            cursor = self.get(cursor).and_then(|t| t.next)?;
            if cursor == start {
                break;
            }
        }

        if let Some((id, _)) = best {
            return Some(id);
        }
        // Current may keep running if still the only runnable thing.
        if let Some(cur) = self.current {
            if self.get(cur).map(|t| t.state == TaskState::Running) == Some(true)
                && Some(cur) != self.idle
            {
                return Some(cur);
            }
        }
        self.idle
    }

    /// Commit a switch decision. Returns `(from, to)` when a context
    /// switch must happen, `None` when the current task simply continues.
    pub fn schedule(&mut self) -> Option<(TaskId, TaskId)> {
        let next = self.select_next()?;
        let cur = self.current;

        if cur == Some(next) {
            if let Some(t) = self.get_mut(next) {
                t.quantum_left = QUANTUM_TICKS;
            }
            return None;
        }

        if let Some(c) = cur {
            if let Some(t) = self.get_mut(c) {
                if t.state == TaskState::Running {
                    t.state = TaskState::Ready;
                }
            }
        }
        if let Some(t) = self.get_mut(next) {
            t.state = TaskState::Running;
            t.quantum_left = QUANTUM_TICKS;
        }
        self.current = Some(next);
        self.switches += 1;
        cur.map(|c| (c, next))
    }

    /// RUNNING -> SLEEPING until `now + ticks`.
    pub fn sleep_current(&mut self, now: u32, ticks: u32) {
        if let Some(cur) = self.current {
            if let Some(t) = self.get_mut(cur) {
                t.state = TaskState::Sleeping;
                t.sleep_until = now.wrapping_add(ticks.max(1));
            }
        }
    }

    /// RUNNING -> FINISHED; the reaper frees resources later. The task
    /// leaves the ring immediately so selection never sees it again.
    pub fn finish_current(&mut self, code: i32) {
        if let Some(cur) = self.current {
            if let Some(t) = self.get_mut(cur) {
                t.state = TaskState::Finished;
                t.exit_code = code;
            }
            self.ring_remove(cur);
        }
    }

    /// FINISHED -> ZOMBIE: claim tasks awaiting teardown. A task still on
    /// the CPU is skipped and picked up on the next pass. The returned ids
    /// hold resources the caller releases before [`Scheduler::reap`].
    pub fn collect_finished(&mut self) -> heapless::Vec<TaskId, MAX_TASKS> {
        let mut out = heapless::Vec::new();
        for slot in 0..MAX_TASKS {
            let id = TaskId(slot as u8);
            if self.current == Some(id) {
                continue;
            }
            if let Some(t) = self.get_mut(id) {
                if t.state == TaskState::Finished {
                    t.state = TaskState::Zombie;
                    let _ = out.push(id);
                }
            }
        }
        out
    }

    /// Drop a ZOMBIE task's slot, surrendering its TCB to the caller so
    /// owned resources (stack, address space) can be freed outside.
    pub fn reap(&mut self, id: TaskId) -> Option<Tcb> {
        if self.get(id).map(|t| t.state == TaskState::Zombie) != Some(true) {
            return None;
        }
        self.slots[id.0 as usize].take()
    }

    pub fn stats(&self) -> SchedStats {
        let tasks = self.slots.iter().filter(|s| s.is_some()).count();
        let ready = self
            .slots
            .iter()
            .flatten()
            .filter(|t| t.state == TaskState::Ready)
            .count();
        SchedStats { switches: self.switches, tasks, ready }
    }
}

struct RingIter<'a> {
    sched: &'a Scheduler,
    start: Option<TaskId>,
    cursor: Option<TaskId>,
    done: bool,
}

impl<'a> Iterator for RingIter<'a> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        if self.done {
            return None;
        }
        let cur = self.cursor?;
        let next = self.sched.get(cur).and_then(|t| t.next);
        self.cursor = next;
        if next == self.start || next.is_none() {
            self.done = true;
        }
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::Priority;

    fn spawn(s: &mut Scheduler, name: &str, prio: Priority) -> TaskId {
        let pid = s.alloc_pid();
        s.insert(Tcb::new(pid, name, prio)).unwrap()
    }

    fn run_ticks(s: &mut Scheduler, ticks: u32) {
        for now in 0..ticks {
            if s.on_tick(now) {
                s.schedule();
            }
        }
    }

    #[test]
    fn round_robin_is_fair_over_quantum_windows() {
        let mut s = Scheduler::new();
        s.enabled = true;
        let idle = spawn(&mut s, "idle", Priority::Idle);
        s.idle = Some(idle);
        let t1 = spawn(&mut s, "t1", Priority::Normal);
        let _t2 = spawn(&mut s, "t2", Priority::Normal);
        let _t3 = spawn(&mut s, "t3", Priority::Normal);

        s.current = Some(t1);
        s.get_mut(t1).unwrap().state = TaskState::Running;

        run_ticks(&mut s, 300);

        for id in [t1, _t2, _t3] {
            let ran = s.get(id).unwrap().ticks_run;
            assert!(ran >= 95, "task {:?} ran only {} ticks", id, ran);
        }
        assert_eq!(s.get(idle).unwrap().ticks_run, 0);
    }

    #[test]
    fn higher_priority_ready_wins_ties() {
        let mut s = Scheduler::new();
        s.enabled = true;
        let lo = spawn(&mut s, "lo", Priority::Low);
        let hi = spawn(&mut s, "hi", Priority::High);
        s.current = Some(lo);
        s.get_mut(lo).unwrap().state = TaskState::Running;

        assert_eq!(s.select_next(), Some(hi));
    }

    #[test]
    fn sleeping_task_wakes_on_time() {
        let mut s = Scheduler::new();
        s.enabled = true;
        let idle = spawn(&mut s, "idle", Priority::Idle);
        s.idle = Some(idle);
        let t = spawn(&mut s, "t", Priority::Normal);
        s.current = Some(t);
        s.get_mut(t).unwrap().state = TaskState::Running;

        s.sleep_current(10, 3);
        assert!(s.on_tick(10));
        assert_eq!(s.schedule().map(|(_, to)| to), Some(idle));

        s.on_tick(12);
        assert_eq!(s.get(t).unwrap().state, TaskState::Sleeping);
        s.on_tick(13);
        assert_eq!(s.get(t).unwrap().state, TaskState::Ready);
        assert_eq!(s.select_next(), Some(t));
    }

    #[test]
    fn idle_runs_only_when_nothing_is_ready() {
        let mut s = Scheduler::new();
        s.enabled = true;
        let idle = spawn(&mut s, "idle", Priority::Idle);
        s.idle = Some(idle);
        let t = spawn(&mut s, "t", Priority::Normal);

        assert_eq!(s.select_next(), Some(t));
        s.schedule();

        s.sleep_current(0, 5);
        assert_eq!(s.select_next(), Some(idle));
        s.schedule();

        // Work appears: idle cedes on the next tick.
        s.get_mut(t).unwrap().state = TaskState::Ready;
        assert!(s.on_tick(1));
        assert_eq!(s.schedule().map(|(_, to)| to), Some(t));
    }

    #[test]
    fn finished_task_goes_through_zombie_before_reaping() {
        let mut s = Scheduler::new();
        s.enabled = true;
        let idle = spawn(&mut s, "idle", Priority::Idle);
        s.idle = Some(idle);
        let t = spawn(&mut s, "t", Priority::Normal);
        s.current = Some(t);
        s.get_mut(t).unwrap().state = TaskState::Running;

        s.finish_current(42);
        assert_eq!(s.get(t).unwrap().state, TaskState::Finished);
        // Still on the CPU: neither claimable nor reapable yet.
        assert!(s.collect_finished().is_empty());
        assert!(s.reap(t).is_none());
        assert_eq!(s.schedule().map(|(_, to)| to), Some(idle));

        let zombies = s.collect_finished();
        assert_eq!(zombies.as_slice(), &[t]);
        assert_eq!(s.get(t).unwrap().state, TaskState::Zombie);

        let tcb = s.reap(t).unwrap();
        assert_eq!(tcb.exit_code, 42);
        assert!(s.reap(t).is_none());

        // The slot is free for reuse and ring order is intact.
        let t2 = spawn(&mut s, "t2", Priority::Normal);
        assert_eq!(t2, t);
    }

    #[test]
    fn ring_preserves_insertion_order() {
        let mut s = Scheduler::new();
        s.enabled = true;
        let a = spawn(&mut s, "a", Priority::Normal);
        let b = spawn(&mut s, "b", Priority::Normal);
        let c = spawn(&mut s, "c", Priority::Normal);

        s.current = Some(a);
        s.get_mut(a).unwrap().state = TaskState::Running;
        assert_eq!(s.select_next(), Some(b));
        s.schedule();
        assert_eq!(s.select_next(), Some(c));
        s.schedule();
        assert_eq!(s.select_next(), Some(a));
    }

    #[test]
    fn table_full_is_reported() {
        let mut s = Scheduler::new();
        for i in 0..MAX_TASKS {
            let pid = s.alloc_pid();
            s.insert(Tcb::new(pid, "x", Priority::Normal))
                .unwrap_or_else(|_| panic!("slot {} should fit", i));
        }
        let pid = s.alloc_pid();
        assert_eq!(s.insert(Tcb::new(pid, "y", Priority::Normal)), Err(SchedError::TableFull));
    }
}
