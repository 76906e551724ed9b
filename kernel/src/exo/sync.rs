//! Spinlock primitive (L1).
//!
//! A word-sized flag acquired by atomic exchange; release stores 0 via the
//! same atomic. While contended the waiter issues a `pause` hint. The
//! `spinlock-debug` feature additionally records the holding CPU and a
//! 10-deep call-site tag stack; reacquisition by the same CPU and release
//! by a non-holder both panic with the recorded acquisition trace.
//!
//! This reference build uses a single named lock, `exo::env::TABLE_LOCK`,
//! guarding the whole environment table -- a big-kernel-lock discipline
//! per spec §4.1/§5. A fine-grained, per-environment locking discipline
//! was considered (per-`Env` locks acquired by the dispatcher on entry
//! and by any primitive reaching into a peer environment) but dropped:
//! with only one CPU ever brought up, there is no peer to contend with,
//! and a lock nothing ever contends for is not a real discipline, just a
//! second name for the same invariant `TABLE_LOCK` already enforces.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(feature = "spinlock-debug")]
const BACKTRACE_DEPTH: usize = 10;

#[cfg(feature = "spinlock-debug")]
struct DebugInfo {
    cpu: AtomicUsize,
    depth: AtomicUsize,
    sites: [core::cell::UnsafeCell<&'static str>; BACKTRACE_DEPTH],
}

#[cfg(feature = "spinlock-debug")]
// SAFETY: `sites` is only written while `locked` is held by the writer's
// CPU, and only read after the lock is confirmed held by `holding()`.
unsafe impl Sync for DebugInfo {}

#[cfg(feature = "spinlock-debug")]
impl DebugInfo {
    const fn new() -> Self {
        Self {
            cpu: AtomicUsize::new(usize::MAX),
            depth: AtomicUsize::new(0),
            sites: [const { core::cell::UnsafeCell::new("") }; BACKTRACE_DEPTH],
        }
    }
}

/// A test-and-set spinlock guarding `T`.
pub struct Spinlock<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str,
    #[cfg(feature = "spinlock-debug")]
    debug: DebugInfo,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`; `T: Send` is required
// so the guard can hand out `&mut T` across whichever CPU holds the lock.
unsafe impl<T: ?Sized + Send> Sync for Spinlock<T> {}
unsafe impl<T: ?Sized + Send> Send for Spinlock<T> {}

pub struct SpinlockGuard<'a, T: ?Sized> {
    lock: &'a Spinlock<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            #[cfg(feature = "spinlock-debug")]
            debug: DebugInfo::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Spinlock<T> {
    /// Acquire the lock, recording `site` as the acquisition tag in debug
    /// builds. `site` is conventionally `concat!(file!(), ":", line!())`.
    pub fn lock(&self, site: &'static str) -> SpinlockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            #[cfg(feature = "spinlock-debug")]
            self.check_reacquire();
            core::hint::spin_loop();
        }
        #[cfg(feature = "spinlock-debug")]
        self.record_site(site);
        let _ = site;
        SpinlockGuard { lock: self }
    }

    pub fn try_lock(&self, site: &'static str) -> Option<SpinlockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            #[cfg(feature = "spinlock-debug")]
            self.record_site(site);
            #[cfg(not(feature = "spinlock-debug"))]
            let _ = site;
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    #[cfg(feature = "spinlock-debug")]
    fn check_reacquire(&self) {
        if self.debug.cpu.load(Ordering::Relaxed) == current_cpu() {
            panic!(
                "spinlock '{}' reacquired by owning CPU {} (last site {})",
                self.name,
                current_cpu(),
                self.last_site()
            );
        }
    }

    #[cfg(feature = "spinlock-debug")]
    fn record_site(&self, site: &'static str) {
        self.debug.cpu.store(current_cpu(), Ordering::Relaxed);
        let depth = self.debug.depth.load(Ordering::Relaxed);
        if depth < BACKTRACE_DEPTH {
            // SAFETY: only written while `locked` is held by this CPU.
            unsafe {
                *self.debug.sites[depth].get() = site;
            }
            self.debug.depth.store(depth + 1, Ordering::Relaxed);
        }
    }

    #[cfg(feature = "spinlock-debug")]
    fn last_site(&self) -> &'static str {
        let depth = self.debug.depth.load(Ordering::Relaxed);
        if depth == 0 {
            "<unknown>"
        } else {
            // SAFETY: read only while the lock is held (panic path, holder
            // is the current CPU).
            unsafe { *self.debug.sites[depth - 1].get() }
        }
    }

    fn unlock(&self) {
        #[cfg(feature = "spinlock-debug")]
        {
            if self.debug.cpu.load(Ordering::Relaxed) != current_cpu() {
                panic!("spinlock '{}' released by non-holder CPU {}", self.name, current_cpu());
            }
            self.debug.cpu.store(usize::MAX, Ordering::Relaxed);
            self.debug.depth.store(0, Ordering::Relaxed);
        }
        self.locked.store(false, Ordering::Release);
    }
}

impl<T: ?Sized> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard implies the lock is held by this CPU.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard implies exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(feature = "spinlock-debug")]
fn current_cpu() -> usize {
    // Single-CPU reference build: CPU 0 always. A true SMP port would read
    // this from per-CPU storage (GS-relative on x86_64).
    0
}

/// Acquire a lock, tagging the call site automatically.
#[macro_export]
macro_rules! spin_lock {
    ($lock:expr) => {
        $lock.lock(concat!(file!(), ":", line!()))
    };
}

