//! Configuration for MMIO latency measurement.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::measurement::OVERHEAD_MEASURE_LOOPS;

/// Number of base address registers a PCI function can expose.
pub const BAR_COUNT: usize = 6;

/// Largest accepted loop count.
pub const LOOPS_UPPER_LIMIT: u32 = 10_000_000;

/// Loop count of a freshly bound session.
pub const LOOPS_DEFAULT: u32 = 100_000;

/// Width of the timed register access in bytes.
pub const ACCESS_WIDTH: u32 = 4;

/// What a session measures: which BAR, where in it, and how often.
///
/// Setters follow two policies. An out-of-range loop count is rejected with
/// an error. A malformed BAR index or offset is ignored and the last good
/// value stays in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    target_bar: u8,
    bar_offset: u32,
    loops: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_bar: 0,
            bar_offset: 0,
            loops: LOOPS_DEFAULT,
        }
    }
}

impl Config {
    /// Index of the BAR to read from (0..=5).
    pub fn target_bar(&self) -> u8 {
        self.target_bar
    }

    /// Byte offset of the register within the BAR (4-byte aligned).
    pub fn bar_offset(&self) -> u32 {
        self.bar_offset
    }

    /// Number of timed reads per run.
    pub fn loops(&self) -> u32 {
        self.loops
    }

    /// Check a loop count without applying it.
    pub fn validate_loops(loops: u32) -> Result<()> {
        if loops == 0 || loops > LOOPS_UPPER_LIMIT {
            return Err(Error::InvalidConfiguration {
                field: "loops",
                value: loops.to_string(),
            });
        }
        Ok(())
    }

    /// Set the loop count, rejecting values outside `1..=LOOPS_UPPER_LIMIT`.
    pub fn set_loops(&mut self, loops: u32) -> Result<()> {
        Self::validate_loops(loops)?;
        self.loops = loops;
        Ok(())
    }

    /// Select the target BAR. Returns `false` (and changes nothing) if
    /// `bar` is not a valid BAR index.
    pub fn set_target_bar(&mut self, bar: u8) -> bool {
        if (bar as usize) < BAR_COUNT {
            self.target_bar = bar;
            true
        } else {
            debug!(bar, "ignoring invalid target BAR");
            false
        }
    }

    /// Set the register offset. Returns `false` (and changes nothing) if
    /// `offset` is not 32-bit aligned.
    pub fn set_bar_offset(&mut self, offset: u32) -> bool {
        if offset % ACCESS_WIDTH == 0 {
            self.bar_offset = offset;
            true
        } else {
            debug!(offset, "ignoring unaligned BAR offset");
            false
        }
    }

    /// Merge settings from `PCIE_LAT_LOOPS`, `PCIE_LAT_BAR` and
    /// `PCIE_LAT_OFFSET`. Values that do not parse or validate are skipped.
    pub fn from_env(self) -> Self {
        self.merge_vars(|name| std::env::var(name).ok())
    }

    fn merge_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let number = |name: &str| var(name).and_then(|v| parse_number(&v));

        if let Some(loops) = number("PCIE_LAT_LOOPS") {
            if let Err(e) = self.set_loops(loops) {
                warn!(error = %e, "ignoring PCIE_LAT_LOOPS");
            }
        }
        if let Some(bar) = number("PCIE_LAT_BAR") {
            match u8::try_from(bar) {
                Ok(bar) => {
                    self.set_target_bar(bar);
                }
                Err(_) => debug!(bar, "ignoring invalid BAR index"),
            }
        }
        if let Some(offset) = number("PCIE_LAT_OFFSET") {
            self.set_bar_offset(offset);
        }
        self
    }
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
pub fn parse_number(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Tuning knobs of the measurement loop that are fixed per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Busy-wait between two samples, in nanoseconds (default: 800).
    ///
    /// Keeps the loop from issuing reads faster than the device can be
    /// expected to serve them. Not part of any timed window.
    pub delay_ns: u64,

    /// Throwaway timestamp pairs before the first sample (default: 2).
    pub warmup_pairs: usize,

    /// Timestamp pairs averaged when the session calibrates its counter
    /// overhead (default: [`OVERHEAD_MEASURE_LOOPS`]).
    pub calibration_pairs: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            delay_ns: 800,
            warmup_pairs: 2,
            calibration_pairs: OVERHEAD_MEASURE_LOOPS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.loops(), LOOPS_DEFAULT);
        assert_eq!(config.target_bar(), 0);
        assert_eq!(config.bar_offset(), 0);
    }

    #[test]
    fn test_loops_bounds() {
        let mut config = Config::default();
        assert!(config.set_loops(0).is_err());
        assert!(config.set_loops(LOOPS_UPPER_LIMIT + 1).is_err());
        assert_eq!(config.loops(), LOOPS_DEFAULT);

        config.set_loops(1).unwrap();
        assert_eq!(config.loops(), 1);
        config.set_loops(LOOPS_UPPER_LIMIT).unwrap();
        assert_eq!(config.loops(), LOOPS_UPPER_LIMIT);
    }

    #[test]
    fn test_invalid_selectors_ignored() {
        let mut config = Config::default();
        assert!(config.set_target_bar(3));
        assert!(!config.set_target_bar(6));
        assert_eq!(config.target_bar(), 3);

        assert!(config.set_bar_offset(0x40));
        for offset in [1, 2, 3, 0x41, 4093] {
            assert!(!config.set_bar_offset(offset));
        }
        assert_eq!(config.bar_offset(), 0x40);
    }

    #[test]
    fn test_merge_vars_skips_rejected_values() {
        let vars = |loops: &'static str| {
            move |name: &str| match name {
                "PCIE_LAT_LOOPS" => Some(loops.to_string()),
                "PCIE_LAT_BAR" => Some("0x2".to_string()),
                "PCIE_LAT_OFFSET" => Some("6".to_string()),
                _ => None,
            }
        };

        let config = Config::default().merge_vars(vars("500"));
        assert_eq!(config.loops(), 500);
        assert_eq!(config.target_bar(), 2);
        assert_eq!(config.bar_offset(), 0);

        let config = Config::default().merge_vars(vars("0"));
        assert_eq!(config.loops(), LOOPS_DEFAULT);
        let config = Config::default().merge_vars(vars("20000000"));
        assert_eq!(config.loops(), LOOPS_DEFAULT);
        let config = Config::default().merge_vars(vars("lots"));
        assert_eq!(config.loops(), LOOPS_DEFAULT);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("16"), Some(16));
        assert_eq!(parse_number("0x10"), Some(16));
        assert_eq!(parse_number(" 0XfF \n"), Some(255));
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("-1"), None);
    }
}
