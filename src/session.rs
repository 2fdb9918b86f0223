//! Per-device measurement session.
//!
//! A [`Session`] ties a bound device's regions to a configuration and a
//! result buffer. Configuration and buffer sit behind one mutex. The mutex
//! stays held for a whole run, so the buffer cannot be resized while
//! samples are being written into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::buffer::{ResultBuffer, Sample};
use crate::config::{Config, SessionOptions};
use crate::error::{Error, Result};
use crate::measurement::{
    self, detect, overhead_estimate, platform_overhead, CycleCounter, DefaultQuiesce,
    PlatformCounter, Quiesce,
};
use crate::region::{Region, RegionTable};

struct State {
    config: Config,
    buffer: ResultBuffer,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Samples written.
    pub samples: u32,
    /// BAR that was read.
    pub target_bar: u8,
    /// Offset within the BAR.
    pub bar_offset: u32,
    /// Wall-clock time of the run.
    pub elapsed: Duration,
}

/// Cancels the run of the session it was taken from.
///
/// The flag is polled between samples; the run returns
/// [`Error::Cancelled`]. Each run clears the flag when it starts.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation of the current run.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Measurement state of one bound device.
pub struct Session<C: CycleCounter = PlatformCounter, Q: Quiesce = DefaultQuiesce> {
    name: String,
    regions: RegionTable,
    counter: C,
    quiesce: Q,
    options: SessionOptions,
    overhead: u32,
    state: Mutex<State>,
    cancel: Arc<AtomicBool>,
}

impl<C: CycleCounter, Q: Quiesce> std::fmt::Debug for Session<C, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("counter", &self.counter.name())
            .field("overhead", &self.overhead)
            .field("config", &self.config())
            .finish()
    }
}

impl Session {
    /// Bind with the platform counter and default jitter suppression.
    ///
    /// Fails with [`Error::CapabilityUnsupported`] if the host counter is
    /// unfit for measurement.
    pub fn bind(name: impl Into<String>, regions: RegionTable) -> Result<Self> {
        let counter = detect()?;
        let quiesce = DefaultQuiesce::default();
        let overhead = platform_overhead(&counter, &quiesce);
        Session::assemble(
            name.into(),
            regions,
            counter,
            quiesce,
            SessionOptions::default(),
            overhead,
        )
    }
}

impl<C: CycleCounter, Q: Quiesce> Session<C, Q> {
    /// Bind with an explicit counter, quiesce strategy and loop options.
    ///
    /// Calibrates the overhead of `counter` over
    /// [`SessionOptions::calibration_pairs`] and allocates the default result
    /// buffer.
    pub fn with_parts(
        name: impl Into<String>,
        regions: RegionTable,
        counter: C,
        quiesce: Q,
        options: SessionOptions,
    ) -> Result<Self> {
        let overhead = overhead_estimate(&counter, &quiesce, options.calibration_pairs);
        Self::assemble(name.into(), regions, counter, quiesce, options, overhead)
    }

    fn assemble(
        name: String,
        regions: RegionTable,
        counter: C,
        quiesce: Q,
        options: SessionOptions,
        overhead: u32,
    ) -> Result<Self> {
        let config = Config::default();
        let buffer = ResultBuffer::with_len(config.loops())?;

        info!(
            session = %name,
            mapped_bars = regions.iter().filter(|r| r.is_mapped()).count(),
            "session bound"
        );

        Ok(Self {
            name,
            regions,
            counter,
            quiesce,
            options,
            overhead,
            state: Mutex::new(State { config, buffer }),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session name, usually the PCI address.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The counter this session measures with.
    pub fn counter(&self) -> &C {
        &self.counter
    }

    /// Nominal counter frequency in Hz.
    pub fn tsc_freq(&self) -> u64 {
        self.counter.frequency_hz()
    }

    /// Overhead of one timestamp pair on this session's counter, in ticks.
    pub fn tsc_overhead(&self) -> u32 {
        self.overhead
    }

    /// BAR `index` of the bound device.
    pub fn region(&self, index: u8) -> Option<&Region> {
        self.regions.get(index)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.lock().config
    }

    /// Configured loop count.
    pub fn loops(&self) -> u32 {
        self.lock().config.loops()
    }

    /// Set the loop count and resize the result buffer to match.
    ///
    /// Out-of-range counts fail with [`Error::InvalidConfiguration`] and a
    /// failed allocation with [`Error::AllocationFailure`]. In both cases
    /// configuration and buffer are left as they were.
    pub fn set_loops(&self, loops: u32) -> Result<()> {
        let mut state = self.lock();
        if let Err(e) = Config::validate_loops(loops) {
            warn!(session = %self.name, loops, "rejecting loop count");
            return Err(e);
        }
        state.buffer.resize(loops)?;
        state.config.set_loops(loops)
    }

    /// Configured target BAR.
    pub fn target_bar(&self) -> u8 {
        self.lock().config.target_bar()
    }

    /// Select the target BAR; invalid indices are ignored.
    pub fn set_target_bar(&self, bar: u8) -> bool {
        self.lock().config.set_target_bar(bar)
    }

    /// Configured register offset.
    pub fn bar_offset(&self) -> u32 {
        self.lock().config.bar_offset()
    }

    /// Set the register offset; unaligned offsets are ignored.
    pub fn set_bar_offset(&self, offset: u32) -> bool {
        self.lock().config.set_bar_offset(offset)
    }

    /// Handle for cancelling runs from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Validate the configuration against the region table and run the
    /// measurement loop into the result buffer.
    ///
    /// Validation failures touch neither hardware nor buffer.
    pub fn measure(&self) -> Result<RunSummary> {
        let mut state = self.lock();
        let config = state.config;

        if config.loops() == 0 || state.buffer.len() != config.loops() as usize {
            return Err(Error::InvalidConfiguration {
                field: "loops",
                value: config.loops().to_string(),
            });
        }

        let bar = config.target_bar();
        let target = match self.regions.get(bar) {
            Some(region) => region.target(bar, config.bar_offset()),
            None => Err(Error::TargetUnavailable { bar }),
        };
        let target = match target {
            Ok(target) => target,
            Err(e) => {
                info!(session = %self.name, error = %e, "measurement rejected");
                return Err(e);
            }
        };

        self.cancel.store(false, Ordering::Relaxed);
        let started = Instant::now();
        measurement::measure(
            &self.counter,
            &self.quiesce,
            &target,
            state.buffer.samples_mut(),
            &self.options,
            Some(&self.cancel),
        )?;

        info!(
            session = %self.name,
            "benchmark done with {} measure_loops for BAR{}, offset {:#010x}",
            config.loops(),
            bar,
            config.bar_offset()
        );

        Ok(RunSummary {
            samples: config.loops(),
            target_bar: bar,
            bar_offset: config.bar_offset(),
            elapsed: started.elapsed(),
        })
    }

    /// Byte-range read of the exported result stream.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
        self.lock().buffer.read_at(offset, buf)
    }

    /// Length of the exported result stream in bytes.
    pub fn result_len(&self) -> usize {
        self.lock().buffer.byte_len()
    }

    /// Copy of all samples.
    pub fn samples(&self) -> Vec<Sample> {
        self.lock().buffer.samples().to_vec()
    }

    /// Run `f` with the result buffer borrowed under the session lock.
    pub fn with_results<R>(&self, f: impl FnOnce(&ResultBuffer) -> R) -> R {
        f(&self.lock().buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{NoQuiesce, SoftwareCounter};

    fn session(regions: RegionTable) -> Session<SoftwareCounter, NoQuiesce> {
        Session::with_parts(
            "test",
            regions,
            SoftwareCounter::new(),
            NoQuiesce,
            SessionOptions {
                delay_ns: 0,
                warmup_pairs: 2,
                calibration_pairs: 10_000,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_after_bind() {
        let s = session(RegionTable::unmapped());
        assert_eq!(s.loops(), crate::config::LOOPS_DEFAULT);
        assert_eq!(s.result_len(), crate::config::LOOPS_DEFAULT as usize * 16);
        assert_eq!(s.tsc_freq(), 1_000_000_000);
    }

    #[test]
    fn test_set_loops_resizes_buffer() {
        let s = session(RegionTable::unmapped());
        s.set_loops(10).unwrap();
        assert_eq!(s.samples().len(), 10);
        assert!(s.set_loops(0).is_err());
        assert_eq!(s.samples().len(), 10);
    }

    #[test]
    fn test_measure_small_run() {
        let s = session(RegionTable::unmapped().with(0, Region::anonymous(4096).unwrap()));
        s.set_loops(16).unwrap();
        let summary = s.measure().unwrap();
        assert_eq!(summary.samples, 16);
        let samples = s.samples();
        for pair in samples.windows(2) {
            assert!(pair[1].start >= pair[0].start);
        }
    }

    #[test]
    fn test_debug_names_counter() {
        let s = session(RegionTable::unmapped());
        let debug = format!("{:?}", s);
        assert!(debug.contains("\"test\""));
        assert!(debug.contains("monotonic"));
    }

    #[test]
    fn test_cancel_flag_reset_per_run() {
        let s = session(RegionTable::unmapped().with(0, Region::anonymous(64).unwrap()));
        s.set_loops(4).unwrap();
        s.cancel_handle().cancel();
        // A cancel issued before the run starts does not carry over.
        assert!(s.measure().is_ok());
    }
}
