//! Time management.
//!
//! The timer interrupt advances a monotonic tick counter at `TICK_HZ`.
//! Everything time-based in the kernel (sleep deadlines, ARP aging, TCP
//! retransmission) is expressed in ticks of this counter.

use core::sync::atomic::{AtomicU32, Ordering};

/// Timer frequency: one tick every 10 ms.
pub const TICK_HZ: u32 = 100;

static TICKS_SINCE_BOOT: AtomicU32 = AtomicU32::new(0);

/// Ticks since boot. Monotonically non-decreasing; wraps after ~497 days.
pub fn ticks() -> u32 {
    TICKS_SINCE_BOOT.load(Ordering::Relaxed)
}

/// Advance the tick counter. Called from the timer IRQ path; tests drive it
/// directly to simulate time.
pub fn advance(n: u32) {
    TICKS_SINCE_BOOT.fetch_add(n, Ordering::Relaxed);
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    ticks() as u64 * (1000 / TICK_HZ as u64)
}

/// Ticks needed to cover `ms` milliseconds, rounded up.
pub fn ms_to_ticks(ms: u32) -> u32 {
    let per_tick = 1000 / TICK_HZ;
    (ms + per_tick - 1) / per_tick
}

/// Elapsed ticks since `start`, wrap-safe.
pub fn ticks_since(start: u32) -> u32 {
    ticks().wrapping_sub(start)
}

/// Busy-wait for at least `ms` milliseconds, halting between ticks.
#[cfg(target_arch = "x86")]
pub fn delay(ms: u32) {
    if ms == 0 {
        return;
    }
    let target = ms_to_ticks(ms);
    let start = ticks();
    while ticks_since(start) < target {
        unsafe { core::arch::asm!("hlt") };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_rounds_up_to_next_tick() {
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(11), 2);
        assert_eq!(ms_to_ticks(25), 3);
    }

    #[test]
    fn ticks_since_is_wrap_safe() {
        let start = ticks();
        advance(7);
        assert!(ticks_since(start) >= 7);
    }
}
