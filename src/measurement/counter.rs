//! Serialized cycle counter reads.
//!
//! A timed window is opened with [`CycleCounter::timestamp_start`] and closed
//! with [`CycleCounter::timestamp_end`]:
//! - x86_64: `cpuid; rdtsc` to open, `rdtscp; cpuid` to close
//! - aarch64: `isb; mrs cntvct_el0` to open, `isb; mrs cntvct_el0; isb` to close
//! - Fallback: the OS monotonic clock in nanoseconds
//!
//! A plain counter read can be reordered around the measured access by
//! out-of-order execution. Fencing before the opening read and after the
//! closing read keeps the access inside the window.

use std::sync::atomic::{compiler_fence, fence, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Counter value split into its two 32-bit halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    /// Upper 32 bits.
    pub high: u32,
    /// Lower 32 bits.
    pub low: u32,
}

impl Timestamp {
    /// Split a 64-bit counter value.
    #[inline]
    pub fn from_u64(value: u64) -> Self {
        Self {
            high: (value >> 32) as u32,
            low: value as u32,
        }
    }

    /// Combine the halves as `(high << 32) | low`.
    #[inline]
    pub fn combine(self) -> u64 {
        ((self.high as u64) << 32) | self.low as u64
    }
}

/// A monotonic, constant-rate cycle counter with serializing reads.
pub trait CycleCounter {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Serialize, then read. Opens a timed window.
    fn timestamp_start(&self) -> Timestamp;

    /// Serializing read, then serialize. Closes a timed window.
    fn timestamp_end(&self) -> Timestamp;

    /// Nominal tick rate in Hz.
    fn frequency_hz(&self) -> u64;

    /// Unfenced read, for delays and other untimed bookkeeping.
    #[inline]
    fn now(&self) -> u64 {
        self.timestamp_start().combine()
    }
}

impl<C: CycleCounter + ?Sized> CycleCounter for &C {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    #[inline]
    fn timestamp_start(&self) -> Timestamp {
        (**self).timestamp_start()
    }

    #[inline]
    fn timestamp_end(&self) -> Timestamp {
        (**self).timestamp_end()
    }

    fn frequency_hz(&self) -> u64 {
        (**self).frequency_hz()
    }

    #[inline]
    fn now(&self) -> u64 {
        (**self).now()
    }
}

/// The counter used on this architecture.
#[cfg(target_arch = "x86_64")]
pub type PlatformCounter = Tsc;

/// The counter used on this architecture.
#[cfg(target_arch = "aarch64")]
pub type PlatformCounter = GenericTimer;

/// The counter used on this architecture.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub type PlatformCounter = SoftwareCounter;

/// Detect the platform counter and verify its preconditions.
///
/// Fails with [`Error::CapabilityUnsupported`] if the counter is not
/// invariant or lacks a serializing read. On architectures without a
/// hardware counter implementation this always fails; use
/// [`SoftwareCounter`] explicitly instead.
pub fn detect() -> Result<PlatformCounter> {
    #[cfg(target_arch = "x86_64")]
    {
        Tsc::detect()
    }

    #[cfg(target_arch = "aarch64")]
    {
        Ok(GenericTimer::new())
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        Err(Error::CapabilityUnsupported {
            feature: "hardware cycle counter",
        })
    }
}

// ───────────────────────────── x86_64 ─────────────────────────────

#[cfg(target_arch = "x86_64")]
const CPUID_EXT_MAX: u32 = 0x8000_0000;
#[cfg(target_arch = "x86_64")]
const CPUID_EXT_FEATURES: u32 = 0x8000_0001;
#[cfg(target_arch = "x86_64")]
const CPUID_EXT_POWER: u32 = 0x8000_0007;
/// CPUID.80000001H:EDX[27]
#[cfg(target_arch = "x86_64")]
const RDTSCP_BIT: u32 = 1 << 27;
/// CPUID.80000007H:EDX[8]
#[cfg(target_arch = "x86_64")]
const INVARIANT_TSC_BIT: u32 = 1 << 8;

/// Time stamp counter, fenced with `cpuid`.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone)]
pub struct Tsc {
    frequency_hz: u64,
}

#[cfg(target_arch = "x86_64")]
impl Tsc {
    /// Check `rdtscp` and invariant TSC support, then calibrate the
    /// frequency against the OS monotonic clock.
    pub fn detect() -> Result<Self> {
        Self::check_capabilities()?;
        let frequency_hz = calibrate_frequency(|| unsafe { core::arch::x86_64::_rdtsc() });
        tracing::info!(frequency_hz, "TSC frequency");
        Ok(Self { frequency_hz })
    }

    /// Like [`Tsc::detect`] but with a known frequency, skipping calibration.
    pub fn with_frequency(frequency_hz: u64) -> Result<Self> {
        Self::check_capabilities()?;
        Ok(Self { frequency_hz })
    }

    /// Verify the CPU offers `rdtscp` and an invariant TSC.
    pub fn check_capabilities() -> Result<()> {
        use core::arch::x86_64::__cpuid;

        #[allow(unused_unsafe)]
        let max_ext = unsafe { __cpuid(CPUID_EXT_MAX) }.eax;
        if max_ext < CPUID_EXT_POWER {
            return Err(Error::CapabilityUnsupported {
                feature: "CPUID leaf 0x80000007",
            });
        }

        #[allow(unused_unsafe)]
        let edx = unsafe { __cpuid(CPUID_EXT_FEATURES) }.edx;
        if edx & RDTSCP_BIT == 0 {
            tracing::warn!("CPUID.80000001:EDX[bit 27] == 0, RDTSCP instruction not available");
            return Err(Error::CapabilityUnsupported { feature: "rdtscp" });
        }
        tracing::debug!("CPUID.80000001:EDX[bit 27] == 1, RDTSCP instruction available");

        #[allow(unused_unsafe)]
        let edx = unsafe { __cpuid(CPUID_EXT_POWER) }.edx;
        if edx & INVARIANT_TSC_BIT == 0 {
            tracing::warn!("CPUID.80000007:EDX[bit 8] == 0, TSC is not invariant");
            return Err(Error::CapabilityUnsupported {
                feature: "invariant TSC",
            });
        }
        tracing::debug!("CPUID.80000007:EDX[bit 8] == 1, TSC is invariant");

        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
impl CycleCounter for Tsc {
    fn name(&self) -> &'static str {
        "rdtscp"
    }

    #[inline(always)]
    fn timestamp_start(&self) -> Timestamp {
        let high: u32;
        let low: u32;
        compiler_fence(Ordering::SeqCst);
        unsafe {
            // rbx is reserved by LLVM but clobbered by cpuid.
            std::arch::asm!(
                "mov {saved_rbx}, rbx",
                "xor eax, eax",
                "cpuid",
                "rdtsc",
                "mov rbx, {saved_rbx}",
                saved_rbx = out(reg) _,
                out("eax") low,
                out("edx") high,
                out("ecx") _,
                options(nostack),
            );
        }
        compiler_fence(Ordering::SeqCst);
        Timestamp { high, low }
    }

    #[inline(always)]
    fn timestamp_end(&self) -> Timestamp {
        let high: u32;
        let low: u32;
        compiler_fence(Ordering::SeqCst);
        unsafe {
            std::arch::asm!(
                "rdtscp",
                "mov {low:e}, eax",
                "mov {high:e}, edx",
                "mov {saved_rbx}, rbx",
                "xor eax, eax",
                "cpuid",
                "mov rbx, {saved_rbx}",
                low = out(reg) low,
                high = out(reg) high,
                saved_rbx = out(reg) _,
                out("eax") _,
                out("edx") _,
                out("ecx") _,
                options(nostack),
            );
        }
        compiler_fence(Ordering::SeqCst);
        Timestamp { high, low }
    }

    fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }

    #[inline]
    fn now(&self) -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }
}

// ───────────────────────────── aarch64 ─────────────────────────────

/// ARM generic timer (`cntvct_el0`), fenced with `isb`.
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone)]
pub struct GenericTimer {
    frequency_hz: u64,
}

#[cfg(target_arch = "aarch64")]
impl GenericTimer {
    /// The generic timer is constant-rate by architecture; its frequency is
    /// read from `cntfrq_el0`.
    pub fn new() -> Self {
        let frequency_hz: u64;
        unsafe {
            std::arch::asm!("mrs {}, cntfrq_el0", out(reg) frequency_hz, options(nostack, nomem));
        }
        Self { frequency_hz }
    }
}

#[cfg(target_arch = "aarch64")]
impl Default for GenericTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "aarch64")]
impl CycleCounter for GenericTimer {
    fn name(&self) -> &'static str {
        "cntvct_el0"
    }

    #[inline(always)]
    fn timestamp_start(&self) -> Timestamp {
        let ticks: u64;
        compiler_fence(Ordering::SeqCst);
        unsafe {
            std::arch::asm!("isb", "mrs {}, cntvct_el0", out(reg) ticks, options(nostack));
        }
        compiler_fence(Ordering::SeqCst);
        Timestamp::from_u64(ticks)
    }

    #[inline(always)]
    fn timestamp_end(&self) -> Timestamp {
        let ticks: u64;
        compiler_fence(Ordering::SeqCst);
        unsafe {
            std::arch::asm!(
                "dsb ld",
                "isb",
                "mrs {}, cntvct_el0",
                "isb",
                out(reg) ticks,
                options(nostack),
            );
        }
        compiler_fence(Ordering::SeqCst);
        Timestamp::from_u64(ticks)
    }

    fn frequency_hz(&self) -> u64 {
        self.frequency_hz
    }

    #[inline]
    fn now(&self) -> u64 {
        let ticks: u64;
        unsafe {
            std::arch::asm!("mrs {}, cntvct_el0", out(reg) ticks, options(nostack, nomem));
        }
        ticks
    }
}

// ───────────────────────────── fallback ─────────────────────────────

/// Monotonic-clock counter ticking in nanoseconds.
///
/// Far coarser than a hardware counter and not serializing. Used for
/// simulation and tests, never picked by [`detect`].
#[derive(Debug, Clone)]
pub struct SoftwareCounter {
    origin: Instant,
}

impl SoftwareCounter {
    /// Start counting from now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    #[inline]
    fn ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

impl Default for SoftwareCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCounter for SoftwareCounter {
    fn name(&self) -> &'static str {
        "monotonic"
    }

    #[inline]
    fn timestamp_start(&self) -> Timestamp {
        fence(Ordering::SeqCst);
        let ticks = self.ticks();
        compiler_fence(Ordering::SeqCst);
        Timestamp::from_u64(ticks)
    }

    #[inline]
    fn timestamp_end(&self) -> Timestamp {
        compiler_fence(Ordering::SeqCst);
        let ticks = self.ticks();
        fence(Ordering::SeqCst);
        Timestamp::from_u64(ticks)
    }

    fn frequency_hz(&self) -> u64 {
        1_000_000_000
    }

    #[inline]
    fn now(&self) -> u64 {
        self.ticks()
    }
}

/// Estimate a counter's frequency against the OS monotonic clock.
///
/// Takes the median tick rate over a series of short sleeps.
#[cfg_attr(not(target_arch = "x86_64"), allow(dead_code))]
pub(crate) fn calibrate_frequency<F: Fn() -> u64>(read: F) -> u64 {
    const CALIBRATION_MS: u64 = 1;
    const CALIBRATION_ITERATIONS: usize = 25;

    let mut rates = Vec::with_capacity(CALIBRATION_ITERATIONS);
    for _ in 0..CALIBRATION_ITERATIONS {
        let start_ticks = read();
        let start_time = Instant::now();

        std::thread::sleep(Duration::from_millis(CALIBRATION_MS));

        let end_ticks = read();
        let elapsed_ns = start_time.elapsed().as_nanos() as u64;
        if elapsed_ns == 0 {
            continue;
        }
        let ticks = end_ticks.saturating_sub(start_ticks);
        rates.push(ticks as f64 * 1e9 / elapsed_ns as f64);
    }

    if rates.is_empty() {
        return 0;
    }

    rates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = rates.len() / 2;
    let median = if rates.len() % 2 == 0 {
        (rates[mid - 1] + rates[mid]) / 2.0
    } else {
        rates[mid]
    };
    median.round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_combine() {
        let ts = Timestamp {
            high: 0x1,
            low: 0xffff_fffe,
        };
        assert_eq!(ts.combine(), 0x1_ffff_fffe);
        assert_eq!(Timestamp::from_u64(0x1_ffff_fffe), ts);
    }

    #[test]
    fn test_software_counter_monotonic() {
        let counter = SoftwareCounter::new();
        let a = counter.timestamp_start().combine();
        let b = counter.timestamp_end().combine();
        assert!(b >= a);
        assert_eq!(counter.frequency_hz(), 1_000_000_000);
    }

    #[test]
    fn test_calibrate_frequency_software() {
        let counter = SoftwareCounter::new();
        let hz = calibrate_frequency(|| counter.now());
        // Nanosecond ticks against the same clock: ~1 GHz.
        assert!(hz > 900_000_000 && hz < 1_100_000_000, "hz = {}", hz);
    }

    #[test]
    fn test_platform_counter_if_supported() {
        match detect() {
            Ok(counter) => {
                let a = counter.timestamp_start().combine();
                let b = counter.timestamp_end().combine();
                assert!(b >= a, "counter went backwards: {} -> {}", a, b);
                assert!(counter.frequency_hz() > 0);
            }
            Err(Error::CapabilityUnsupported { feature }) => {
                eprintln!("platform counter unsupported ({}), skipping", feature);
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
