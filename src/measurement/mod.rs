//! The timing measurement engine.
//!
//! This module provides:
//! - Serialized cycle counter reads for opening and closing a timed window
//! - Jitter suppression around each window
//! - Calibration of the fixed instrumentation overhead
//! - The loop that times single MMIO reads
//!
//! # Counter Selection
//!
//! - **x86_64**: `cpuid; rdtsc` / `rdtscp; cpuid`. Requires `rdtscp` and
//!   an invariant TSC.
//! - **aarch64**: `cntvct_el0` fenced with `isb`.
//! - Anything else: no hardware counter; [`SoftwareCounter`] can be used
//!   explicitly.

mod calibrate;
mod counter;
mod mmio;
mod quiesce;
#[cfg(target_os = "linux")]
mod realtime;

pub use calibrate::{
    cached_overhead, calibrate, overhead_estimate, platform_overhead, OVERHEAD_MEASURE_LOOPS,
};
pub use counter::{detect, CycleCounter, PlatformCounter, SoftwareCounter, Timestamp};
#[cfg(target_arch = "aarch64")]
pub use counter::GenericTimer;
#[cfg(target_arch = "x86_64")]
pub use counter::Tsc;
pub use mmio::{measure, ns_to_ticks, spin_delay, MmioTarget};
#[cfg(all(target_arch = "x86_64", feature = "ring0"))]
pub use quiesce::IrqSave;
pub use quiesce::{DefaultQuiesce, NoQuiesce, Quiesce};
#[cfg(unix)]
pub use quiesce::YieldQuiesce;
#[cfg(target_os = "linux")]
pub use realtime::RealtimeScope;
