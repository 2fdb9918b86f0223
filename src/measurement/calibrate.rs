//! Estimate of the instrumentation overhead.
//!
//! Back-to-back opening and closing timestamps with nothing between them
//! measure what the fences and counter reads themselves cost. The estimate
//! is informational. Samples are never corrected by it; consumers subtract
//! it themselves.

use std::sync::OnceLock;

use tracing::info;

use super::counter::{CycleCounter, PlatformCounter};
use super::quiesce::Quiesce;

/// Timestamp pairs averaged per overhead calibration by default.
pub const OVERHEAD_MEASURE_LOOPS: u32 = 1_000_000;

static PLATFORM_OVERHEAD: OnceLock<u32> = OnceLock::new();

/// Run `n` throwaway timestamp pairs to pull the fencing instructions into
/// cache. Their first executions are abnormally slow.
#[inline(always)]
pub(crate) fn warm_up<C: CycleCounter>(counter: &C, n: usize) {
    for _ in 0..n {
        std::hint::black_box(counter.timestamp_start());
        std::hint::black_box(counter.timestamp_end());
    }
}

/// Average cost of one opening/closing timestamp pair, in counter ticks.
///
/// Only the low 32 bits of each timestamp are used. The interval is always
/// far below 2^32 ticks. Returns 0 for `loops == 0`.
pub fn calibrate<C, Q>(counter: &C, quiesce: &Q, loops: u32) -> u32
where
    C: CycleCounter,
    Q: Quiesce,
{
    if loops == 0 {
        return 0;
    }

    warm_up(counter, 2);

    let mut sum: u64 = 0;
    for _ in 0..loops {
        let saved = quiesce.suspend();
        let before = counter.timestamp_start();
        let after = counter.timestamp_end();
        quiesce.resume(saved);

        sum += after.low.wrapping_sub(before.low) as u64;
    }

    (sum / loops as u64) as u32
}

/// Calibrate `counter` over `loops` pairs and log the result.
pub fn overhead_estimate<C, Q>(counter: &C, quiesce: &Q, loops: u32) -> u32
where
    C: CycleCounter,
    Q: Quiesce,
{
    let overhead = calibrate(counter, quiesce, loops);
    info!(
        overhead,
        counter = counter.name(),
        "overhead of timestamp measurement: {} cycles",
        overhead
    );
    overhead
}

/// Overhead of the platform counter, shared by every session bound to it.
///
/// Calibrated with [`OVERHEAD_MEASURE_LOOPS`] pairs on first use. Later
/// calls return the same value.
pub fn platform_overhead<Q: Quiesce>(counter: &PlatformCounter, quiesce: &Q) -> u32 {
    *PLATFORM_OVERHEAD.get_or_init(|| overhead_estimate(counter, quiesce, OVERHEAD_MEASURE_LOOPS))
}

/// The platform counter estimate, if it has been computed.
pub fn cached_overhead() -> Option<u32> {
    PLATFORM_OVERHEAD.get().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::counter::Timestamp;
    use crate::measurement::quiesce::NoQuiesce;
    use std::cell::Cell;

    /// Advances by a fixed step on every read.
    struct StepCounter {
        now: Cell<u64>,
        step: u64,
    }

    impl CycleCounter for StepCounter {
        fn name(&self) -> &'static str {
            "step"
        }

        fn timestamp_start(&self) -> Timestamp {
            let v = self.now.get() + self.step;
            self.now.set(v);
            Timestamp::from_u64(v)
        }

        fn timestamp_end(&self) -> Timestamp {
            self.timestamp_start()
        }

        fn frequency_hz(&self) -> u64 {
            1_000_000_000
        }
    }

    #[test]
    fn test_calibrate_constant_step() {
        let counter = StepCounter {
            now: Cell::new(0),
            step: 37,
        };
        assert_eq!(calibrate(&counter, &NoQuiesce, 1000), 37);
    }

    #[test]
    fn test_calibrate_low_word_wraps() {
        // Start just below a 32-bit boundary so low halves wrap.
        let counter = StepCounter {
            now: Cell::new(0xffff_ff00),
            step: 64,
        };
        assert_eq!(calibrate(&counter, &NoQuiesce, 100), 64);
    }

    #[test]
    fn test_calibrate_zero_loops() {
        let counter = StepCounter {
            now: Cell::new(0),
            step: 1,
        };
        assert_eq!(calibrate(&counter, &NoQuiesce, 0), 0);
    }

    #[test]
    fn test_overhead_estimate_follows_counter() {
        let slow = StepCounter {
            now: Cell::new(0),
            step: 1000,
        };
        let fast = StepCounter {
            now: Cell::new(0),
            step: 5,
        };
        assert_eq!(overhead_estimate(&slow, &NoQuiesce, 1000), 1000);
        assert_eq!(overhead_estimate(&fast, &NoQuiesce, 1000), 5);
    }
}
