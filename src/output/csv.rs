//! CSV export of filtered latencies.
//!
//! One `time_ns,latency_ns` line per sample, both truncated to whole
//! nanoseconds, no header.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::report::{cycles_to_ns, LatencyPoint};

/// Default output file name for a run of `loops` iterations.
pub fn default_csv_name(loops: u32) -> String {
    format!("lat_{}_loops_3sigma.csv", loops)
}

/// Write `points` as CSV lines in nanoseconds.
pub fn write_csv<W: Write>(mut writer: W, points: &[LatencyPoint], frequency_hz: u64) -> io::Result<()> {
    for p in points {
        let time = cycles_to_ns(p.time as f64, frequency_hz) as u64;
        let latency = cycles_to_ns(p.latency as f64, frequency_hz) as i64;
        writeln!(writer, "{},{}", time, latency)?;
    }
    writer.flush()
}

/// Write `points` to a file at `path`, replacing it.
pub fn save_csv(path: &Path, points: &[LatencyPoint], frequency_hz: u64) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path.display().to_string(), e))?;
    write_csv(BufWriter::new(file), points, frequency_hz)
        .map_err(|e| Error::io(path.display().to_string(), e))
}
