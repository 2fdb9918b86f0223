//! # pcie-lat
//!
//! Measure the latency of single MMIO reads to PCIe device registers with
//! cycle-counter precision.
//!
//! A [`Session`] is bound to the mapped BARs of one device. Each run issues
//! `loops` 32-bit reads to one register and records, per read, the counter
//! value when the timed window opened and the window's length in ticks.
//! Every window is fenced so the read is neither hoisted out of it nor
//! overlapped with the counter reads.
//!
//! Raw samples are exported as 16-byte records. The instrumentation
//! overhead is measured once per counter (once per process for the platform
//! counter) and reported alongside, but never subtracted by the engine;
//! [`report`] does that for display.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pcie_lat::{pci::PciDevice, Session};
//!
//! let device = PciDevice::open("00:05.0".parse()?)?;
//! let session = Session::bind(device.address().to_string(), device.map_regions()?)?;
//!
//! session.set_loops(10_000)?;
//! session.set_target_bar(0);
//! session.set_bar_offset(0x40);
//! session.measure()?;
//!
//! for sample in session.samples() {
//!     println!("{} {}", sample.start, sample.duration);
//! }
//! ```
//!
//! ## Simulation
//!
//! [`Region::anonymous`] provides a RAM-backed BAR and
//! [`measurement::SoftwareCounter`] a clock-based counter, so the whole
//! pipeline runs without hardware or privileges.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
mod buffer;
mod config;
mod error;
mod region;
mod session;

// Functional modules
pub mod attrs;
pub mod measurement;
pub mod output;
pub mod pci;
pub mod preflight;
pub mod report;

// Re-exports for public API
pub use buffer::{decode_samples, ResultBuffer, Sample, SampleReader, SAMPLE_SIZE};
pub use config::{
    parse_number, Config, SessionOptions, ACCESS_WIDTH, BAR_COUNT, LOOPS_DEFAULT,
    LOOPS_UPPER_LIMIT,
};
pub use error::{Error, Result};
pub use region::{Region, RegionTable};
pub use session::{CancelHandle, RunSummary, Session};
