//! Post-processing of raw samples.
//!
//! Samples leave the engine as raw counter values. This module turns them
//! into latencies (overhead subtracted, time relative to the first sample),
//! summarizes them, removes outliers outside a 3σ band and converts to
//! nanoseconds for display and export.

use serde::{Deserialize, Serialize};

use crate::buffer::Sample;

/// Width of the outlier band in standard deviations.
pub const SIGMA_BAND: f64 = 3.0;

/// Default histogram bin width in nanoseconds.
pub const HISTOGRAM_BIN_NS: u32 = 10;

/// One sample relative to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyPoint {
    /// Ticks since the first sample's start.
    pub time: u64,
    /// Duration minus the instrumentation overhead, in ticks. Can be
    /// negative for samples faster than the average overhead.
    pub latency: i64,
}

/// Convert raw samples to latency points.
pub fn latency_points(samples: &[Sample], overhead: u32) -> Vec<LatencyPoint> {
    let Some(first) = samples.first() else {
        return Vec::new();
    };
    samples
        .iter()
        .map(|s| LatencyPoint {
            time: s.start.wrapping_sub(first.start),
            latency: s.duration as i64 - overhead as i64,
        })
        .collect()
}

/// Mean and sample standard deviation (n − 1) of a latency series.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Number of points.
    pub count: usize,
    /// Arithmetic mean in ticks.
    pub mean: f64,
    /// Sample standard deviation in ticks; 0 for fewer than two points.
    pub stddev: f64,
}

impl Stats {
    /// Summarize the latencies of `points`.
    pub fn of(points: &[LatencyPoint]) -> Self {
        let count = points.len();
        if count == 0 {
            return Stats::default();
        }
        let mean = points.iter().map(|p| p.latency as f64).sum::<f64>() / count as f64;
        let stddev = if count < 2 {
            0.0
        } else {
            let ss: f64 = points
                .iter()
                .map(|p| (p.latency as f64 - mean).powi(2))
                .sum();
            (ss / (count - 1) as f64).sqrt()
        };
        Stats {
            count,
            mean,
            stddev,
        }
    }
}

/// Keep points strictly inside `mean ± k·stddev`.
///
/// Bounds are truncated to whole ticks. A series with zero spread is
/// returned unchanged.
pub fn sigma_filter(points: &[LatencyPoint], stats: &Stats, k: f64) -> Vec<LatencyPoint> {
    if stats.stddev == 0.0 {
        return points.to_vec();
    }
    let max = (stats.mean + k * stats.stddev) as i64;
    let min = (stats.mean - k * stats.stddev) as i64;
    points
        .iter()
        .filter(|p| p.latency < max && p.latency > min)
        .copied()
        .collect()
}

/// Convert counter ticks to nanoseconds.
pub fn cycles_to_ns(cycles: f64, frequency_hz: u64) -> f64 {
    if frequency_hz == 0 {
        return 0.0;
    }
    cycles * 1e9 / frequency_hz as f64
}

/// One histogram bin covering `[lower_ns, upper_ns)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bin {
    /// Inclusive lower edge in nanoseconds.
    pub lower_ns: i64,
    /// Exclusive upper edge in nanoseconds.
    pub upper_ns: i64,
    /// Points in the bin.
    pub count: usize,
}

/// Bin latencies, truncated to whole nanoseconds, into bins of
/// `bin_width_ns`.
///
/// The bins run from below the fastest point to above the slowest one with
/// a margin of one bin width (at least 5 ns) on each side, so the outermost
/// bins are always empty. Returns no bins for no points.
pub fn histogram(points: &[LatencyPoint], frequency_hz: u64, bin_width_ns: u32) -> Vec<Bin> {
    let width = i64::from(bin_width_ns.max(1));
    let ns: Vec<i64> = points
        .iter()
        .map(|p| cycles_to_ns(p.latency as f64, frequency_hz) as i64)
        .collect();
    let (Some(&min), Some(&max)) = (ns.iter().min(), ns.iter().max()) else {
        return Vec::new();
    };

    let margin = width.max(5);
    let lower = min - 1 - margin;
    let upper = max + 1 + margin;
    let count = (upper - lower + width - 1) / width;

    let mut bins: Vec<Bin> = (0..count)
        .map(|i| Bin {
            lower_ns: lower + i * width,
            upper_ns: lower + (i + 1) * width,
            count: 0,
        })
        .collect();
    for value in ns {
        bins[((value - lower) / width) as usize].count += 1;
    }
    bins
}

/// Run parameters recorded alongside the results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    /// Device or session name.
    pub device: String,
    /// Counter used.
    pub counter: String,
    /// Counter frequency in Hz.
    pub tsc_freq: u64,
    /// Overhead subtracted from each sample, in ticks.
    pub tsc_overhead: u32,
    /// Target BAR.
    pub target_bar: u8,
    /// Register offset.
    pub bar_offset: u32,
    /// Configured iterations.
    pub loops: u32,
}

/// A summary in ticks and nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Points summarized.
    pub samples: usize,
    /// Mean latency in ticks.
    pub mean_cycles: f64,
    /// Standard deviation in ticks.
    pub stddev_cycles: f64,
    /// Mean latency in nanoseconds.
    pub mean_ns: f64,
    /// Standard deviation in nanoseconds.
    pub stddev_ns: f64,
}

impl Summary {
    fn new(stats: &Stats, frequency_hz: u64) -> Self {
        Summary {
            samples: stats.count,
            mean_cycles: stats.mean,
            stddev_cycles: stats.stddev,
            mean_ns: cycles_to_ns(stats.mean, frequency_hz),
            stddev_ns: cycles_to_ns(stats.stddev, frequency_hz),
        }
    }
}

/// Results of one run, before and after outlier removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Run parameters.
    pub info: RunInfo,
    /// All samples.
    pub raw: Summary,
    /// Samples inside the 3σ band.
    pub filtered: Summary,
    /// Percentage of samples removed by the filter.
    pub discarded_percent: f64,
    /// Distribution of the filtered latencies in [`HISTOGRAM_BIN_NS`] bins.
    pub histogram: Vec<Bin>,
}

/// A report plus the filtered points it was computed from.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Summary figures.
    pub report: Report,
    /// Points inside the 3σ band, in issue order.
    pub filtered: Vec<LatencyPoint>,
}

/// Build the report of a run.
pub fn analyze(info: RunInfo, samples: &[Sample]) -> Analysis {
    let points = latency_points(samples, info.tsc_overhead);
    let raw = Stats::of(&points);
    let filtered = sigma_filter(&points, &raw, SIGMA_BAND);
    let kept = Stats::of(&filtered);

    let discarded_percent = if points.is_empty() {
        0.0
    } else {
        (points.len() - filtered.len()) as f64 * 100.0 / points.len() as f64
    };

    let report = Report {
        raw: Summary::new(&raw, info.tsc_freq),
        filtered: Summary::new(&kept, info.tsc_freq),
        discarded_percent,
        histogram: histogram(&filtered, info.tsc_freq, HISTOGRAM_BIN_NS),
        info,
    };
    Analysis { report, filtered }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(latencies: &[i64]) -> Vec<LatencyPoint> {
        latencies
            .iter()
            .enumerate()
            .map(|(i, &latency)| LatencyPoint {
                time: i as u64,
                latency,
            })
            .collect()
    }

    #[test]
    fn test_latency_points_relative() {
        let samples = [Sample::new(1000, 300), Sample::new(1900, 350), Sample::new(2800, 20)];
        let pts = latency_points(&samples, 40);
        assert_eq!(pts[0], LatencyPoint { time: 0, latency: 260 });
        assert_eq!(pts[1], LatencyPoint { time: 900, latency: 310 });
        assert_eq!(pts[2].latency, -20);
        assert!(latency_points(&[], 40).is_empty());
    }

    #[test]
    fn test_stats_sample_stddev() {
        let stats = Stats::of(&points(&[2, 4, 4, 4, 5, 5, 7, 9]));
        assert_eq!(stats.count, 8);
        assert!((stats.mean - 5.0).abs() < 1e-12);
        // Sum of squares 32 over n - 1 = 7.
        assert!((stats.stddev - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);

        assert_eq!(Stats::of(&points(&[7])).stddev, 0.0);
        assert_eq!(Stats::of(&[]), Stats::default());
    }

    #[test]
    fn test_sigma_filter_drops_outlier() {
        let mut lat = vec![100; 50];
        lat.extend([101, 99, 102, 98]);
        lat.push(5000);
        let pts = points(&lat);
        let stats = Stats::of(&pts);

        let kept = sigma_filter(&pts, &stats, SIGMA_BAND);
        assert_eq!(kept.len(), pts.len() - 1);
        assert!(kept.iter().all(|p| p.latency < 5000));
    }

    #[test]
    fn test_sigma_filter_constant_series() {
        let pts = points(&[42; 10]);
        let stats = Stats::of(&pts);
        assert_eq!(sigma_filter(&pts, &stats, SIGMA_BAND).len(), 10);
    }

    #[test]
    fn test_cycles_to_ns() {
        assert_eq!(cycles_to_ns(3000.0, 3_000_000_000), 1000.0);
        assert_eq!(cycles_to_ns(5.0, 0), 0.0);
    }

    #[test]
    fn test_analyze() {
        let mut samples: Vec<Sample> = (0..100).map(|i| Sample::new(i * 1000, 540)).collect();
        samples[50].duration = 1_000_000;
        let info = RunInfo {
            device: "0000:00:05.0".into(),
            counter: "rdtscp".into(),
            tsc_freq: 2_000_000_000,
            tsc_overhead: 40,
            target_bar: 0,
            bar_offset: 0,
            loops: 100,
        };

        let analysis = analyze(info, &samples);
        let report = &analysis.report;
        assert_eq!(report.raw.samples, 100);
        assert_eq!(report.filtered.samples, 99);
        assert_eq!(analysis.filtered.len(), 99);
        assert!((report.filtered.mean_cycles - 500.0).abs() < 1e-9);
        assert!((report.filtered.mean_ns - 250.0).abs() < 1e-9);
        assert!((report.discarded_percent - 1.0).abs() < 1e-9);

        let binned: usize = report.histogram.iter().map(|b| b.count).sum();
        assert_eq!(binned, 99);
        let peak = report.histogram.iter().max_by_key(|b| b.count).unwrap();
        assert!(peak.lower_ns <= 250 && 250 < peak.upper_ns);
    }

    #[test]
    fn test_histogram_bin_edges() {
        // 1 GHz: one tick per nanosecond.
        let bins = histogram(&points(&[100, 105, 109, 110, 131]), 1_000_000_000, 10);
        let edges: Vec<(i64, i64)> = bins.iter().map(|b| (b.lower_ns, b.upper_ns)).collect();
        assert_eq!(
            edges,
            vec![(89, 99), (99, 109), (109, 119), (119, 129), (129, 139), (139, 149)]
        );
        let counts: Vec<usize> = bins.iter().map(|b| b.count).collect();
        assert_eq!(counts, vec![0, 2, 2, 0, 1, 0]);
    }

    #[test]
    fn test_histogram_truncates_to_ns() {
        // 301 ticks at 3 GHz is 100.33 ns.
        let bins = histogram(&points(&[301]), 3_000_000_000, 10);
        let hit = bins.iter().find(|b| b.count == 1).unwrap();
        assert_eq!((hit.lower_ns, hit.upper_ns), (99, 109));

        let narrow = histogram(&points(&[-3, 4]), 1_000_000_000, 0);
        assert!(narrow.iter().all(|b| b.upper_ns - b.lower_ns == 1));
        assert_eq!(narrow.iter().map(|b| b.count).sum::<usize>(), 2);

        assert!(histogram(&[], 1_000_000_000, 10).is_empty());
    }
}
