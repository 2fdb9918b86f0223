//! Suppression of scheduling and interrupt jitter around a timed window.
//!
//! A scheduler tick or interrupt landing between the opening and closing
//! timestamp adds an unbounded delay to that sample. Every timed window is
//! therefore bracketed by [`Quiesce::suspend`] / [`Quiesce::resume`]. Only the
//! window itself is covered, never the whole loop.
//!
//! Implementations:
//! - [`NoQuiesce`]: compiler fences only
//! - [`YieldQuiesce`]: gives up the CPU before each window so it starts on a
//!   fresh time slice (unix userspace)
//! - [`IrqSave`]: `pushfq; cli` and restore (x86_64, `ring0` feature)

use std::sync::atomic::{compiler_fence, Ordering};

/// Enter and leave a jitter-free section.
pub trait Quiesce {
    /// State needed to undo [`Quiesce::suspend`].
    type Saved;

    /// Stop preemption and interrupt delivery for the calling context.
    fn suspend(&self) -> Self::Saved;

    /// Restore what [`Quiesce::suspend`] changed.
    fn resume(&self, saved: Self::Saved);
}

impl<Q: Quiesce + ?Sized> Quiesce for &Q {
    type Saved = Q::Saved;

    #[inline(always)]
    fn suspend(&self) -> Self::Saved {
        (**self).suspend()
    }

    #[inline(always)]
    fn resume(&self, saved: Self::Saved) {
        (**self).resume(saved)
    }
}

/// Default quiesce strategy for this target.
#[cfg(unix)]
pub type DefaultQuiesce = YieldQuiesce;

/// Default quiesce strategy for this target.
#[cfg(not(unix))]
pub type DefaultQuiesce = NoQuiesce;

/// Only keeps the compiler from moving code across the window boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoQuiesce;

impl Quiesce for NoQuiesce {
    type Saved = ();

    #[inline(always)]
    fn suspend(&self) {
        compiler_fence(Ordering::SeqCst);
    }

    #[inline(always)]
    fn resume(&self, _saved: ()) {
        compiler_fence(Ordering::SeqCst);
    }
}

/// Yields before each window.
///
/// Userspace cannot mask interrupts. Yielding right before the window makes
/// a preemption inside it as unlikely as the scheduler allows. Combine with
/// [`super::RealtimeScope`] to keep other tasks off the CPU.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct YieldQuiesce;

#[cfg(unix)]
impl Quiesce for YieldQuiesce {
    type Saved = ();

    #[inline(always)]
    fn suspend(&self) {
        unsafe {
            libc::sched_yield();
        }
        compiler_fence(Ordering::SeqCst);
    }

    #[inline(always)]
    fn resume(&self, _saved: ()) {
        compiler_fence(Ordering::SeqCst);
    }
}

/// Saves RFLAGS and clears IF, like `raw_local_irq_save`.
///
/// # Safety
///
/// `cli` raises #GP outside ring 0 unless the process holds `iopl(3)`.
/// Constructing this type is therefore `unsafe`.
#[cfg(all(target_arch = "x86_64", feature = "ring0"))]
#[derive(Debug)]
pub struct IrqSave {
    _private: (),
}

#[cfg(all(target_arch = "x86_64", feature = "ring0"))]
impl IrqSave {
    /// RFLAGS.IF
    const INTERRUPT_FLAG: u64 = 1 << 9;

    /// # Safety
    ///
    /// The caller must run with CPL 0 or IOPL 3.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(all(target_arch = "x86_64", feature = "ring0"))]
impl Quiesce for IrqSave {
    type Saved = u64;

    #[inline(always)]
    fn suspend(&self) -> u64 {
        let flags: u64;
        unsafe {
            std::arch::asm!("pushfq", "pop {}", "cli", out(reg) flags);
        }
        flags
    }

    #[inline(always)]
    fn resume(&self, flags: u64) {
        if flags & Self::INTERRUPT_FLAG != 0 {
            unsafe {
                std::arch::asm!("sti", options(nostack));
            }
        } else {
            compiler_fence(Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_quiesce_roundtrip() {
        let q = NoQuiesce;
        let saved = q.suspend();
        q.resume(saved);
    }

    #[cfg(unix)]
    #[test]
    fn test_yield_quiesce_roundtrip() {
        let q = YieldQuiesce;
        for _ in 0..10 {
            let saved = q.suspend();
            q.resume(saved);
        }
    }
}
