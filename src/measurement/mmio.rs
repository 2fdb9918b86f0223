//! The measurement loop around a single MMIO read.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::Sample;
use crate::config::SessionOptions;
use crate::error::{Error, Result};

use super::calibrate::warm_up;
use super::counter::CycleCounter;
use super::quiesce::Quiesce;

/// A validated, 32-bit aligned register address inside a mapped region.
///
/// Borrowing the region keeps the mapping alive while the target exists.
#[derive(Debug)]
pub struct MmioTarget<'a> {
    ptr: NonNull<u32>,
    _region: PhantomData<&'a [u8]>,
}

impl<'a> MmioTarget<'a> {
    /// # Safety
    ///
    /// `ptr` must be 4-byte aligned and readable for the lifetime `'a`.
    pub(crate) unsafe fn new(ptr: NonNull<u32>) -> Self {
        Self {
            ptr,
            _region: PhantomData,
        }
    }

    /// Issue one volatile 32-bit read.
    #[inline(always)]
    pub fn read(&self) -> u32 {
        unsafe { self.ptr.as_ptr().read_volatile() }
    }

    /// The register address.
    pub fn as_ptr(&self) -> *const u32 {
        self.ptr.as_ptr()
    }
}

/// Time one read of `target` per element of `out`.
///
/// Each iteration suspends jitter sources, brackets the read with an
/// opening and a closing timestamp, resumes, and stores the sample at its
/// iteration index. `options.delay_ns` of busy-waiting separates iterations.
///
/// `cancel` is polled between iterations, never inside a window. On
/// cancellation the samples written so far stay in `out` and
/// [`Error::Cancelled`] is returned.
pub fn measure<C, Q>(
    counter: &C,
    quiesce: &Q,
    target: &MmioTarget<'_>,
    out: &mut [Sample],
    options: &SessionOptions,
    cancel: Option<&AtomicBool>,
) -> Result<()>
where
    C: CycleCounter,
    Q: Quiesce,
{
    if out.is_empty() {
        return Err(Error::InvalidConfiguration {
            field: "loops",
            value: "0".to_string(),
        });
    }

    let delay_ticks = ns_to_ticks(options.delay_ns, counter.frequency_hz());

    warm_up(counter, options.warmup_pairs);

    for (i, slot) in out.iter_mut().enumerate() {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Error::Cancelled { completed: i });
            }
        }

        let saved = quiesce.suspend();
        let before = counter.timestamp_start();
        std::hint::black_box(target.read());
        let after = counter.timestamp_end();
        quiesce.resume(saved);

        let start = before.combine();
        *slot = Sample::new(start, after.combine().wrapping_sub(start));

        spin_delay(counter, delay_ticks);
    }

    Ok(())
}

/// Busy-wait for `ticks` counter ticks.
#[inline]
pub fn spin_delay<C: CycleCounter>(counter: &C, ticks: u64) {
    if ticks == 0 {
        return;
    }
    let start = counter.now();
    while counter.now().wrapping_sub(start) < ticks {
        std::hint::spin_loop();
    }
}

/// Convert nanoseconds to ticks of a counter running at `frequency_hz`.
pub fn ns_to_ticks(ns: u64, frequency_hz: u64) -> u64 {
    ((ns as u128 * frequency_hz as u128) / 1_000_000_000) as u64
}
