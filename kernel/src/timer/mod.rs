//! Monotonic millisecond clock backing the `TimeMsec` syscall.
//!
//! Sits above the architecture-specific PIT/tick layer
//! ([`crate::arch::x86_64::timer`]); this module only owns the
//! accumulated count, not the hardware programming.

use core::sync::atomic::{AtomicU64, Ordering};

/// PIT reload value in `arch::x86_64::timer::setup_timer` is chosen to
/// match this interval.
pub const TICK_INTERVAL_MS: u64 = 10;

static UPTIME_MS: AtomicU64 = AtomicU64::new(0);

/// Programs the hardware tick source. Call once during boot, after the
/// IDT's timer vector is installed.
pub fn init() {
    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::timer::setup_timer(TICK_INTERVAL_MS as u32);
}

/// Called from the timer interrupt handler on every tick.
pub fn on_tick() {
    UPTIME_MS.fetch_add(TICK_INTERVAL_MS, Ordering::Relaxed);
}

/// Monotonic milliseconds elapsed since [`init`].
pub fn get_uptime_ms() -> u64 {
    UPTIME_MS.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_tick_advances_uptime_by_the_tick_interval() {
        let before = get_uptime_ms();
        on_tick();
        assert_eq!(get_uptime_ms(), before + TICK_INTERVAL_MS);
    }
}
