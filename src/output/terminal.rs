//! Terminal output formatting with colors and box drawing.

use colored::Colorize;

use crate::pci::DeviceIdentity;
use crate::preflight::PreflightResult;
use crate::report::{Bin, Report, Summary};

/// Format a Report for human-readable terminal output.
///
/// Prints the run parameters, then mean and standard deviation before and
/// after 3σ outlier removal, in ticks and nanoseconds.
pub fn format_report(report: &Report) -> String {
    let info = &report.info;
    let mut output = String::new();
    let sep = "\u{2500}".repeat(54);

    output.push_str(&format!("{}\n", "pcie-lat".bold()));
    output.push_str(&sep);
    output.push('\n');
    output.push_str(&format!("  Counter:  {} @ {} Hz\n", info.counter, info.tsc_freq));
    output.push_str(&format!("  Overhead: {} cycles\n", info.tsc_overhead));
    output.push_str(&format!("  Device:   {}\n", info.device));
    output.push_str(&format!("  BAR:      {}\n", info.target_bar));
    output.push_str(&format!("  Offset:   {:#x}\n", info.bar_offset));
    output.push_str(&format!("  Loops:    {}\n", info.loops));
    output.push('\n');

    output.push_str(&format!(
        "       | {}\n",
        format!("Results ({} samples)", report.raw.samples).bold()
    ));
    output.push_str(&sep);
    output.push('\n');
    push_summary(&mut output, &report.raw);
    output.push('\n');

    let discarded = format!("{:.3}% discarded", report.discarded_percent);
    let discarded = if report.discarded_percent > 1.0 {
        discarded.yellow().to_string()
    } else {
        discarded.green().to_string()
    };
    output.push_str(&format!(
        "       | {} {}\n",
        format!("3\u{03c3} Results ({} samples,", report.filtered.samples).bold(),
        discarded
    ));
    output.push_str(&sep);
    output.push('\n');
    push_summary(&mut output, &report.filtered);

    output
}

fn push_summary(output: &mut String, summary: &Summary) {
    output.push_str(&format!(
        "Mean   | {:>16} | {:>12}\n",
        format!("{:.2} cycles", summary.mean_cycles),
        format!("{:.2} ns", summary.mean_ns)
    ));
    output.push_str(&format!(
        "Stdd   | {:>16} | {:>12}\n",
        format!("{:.2} cycles", summary.stddev_cycles),
        format!("{:.2} ns", summary.stddev_ns)
    ));
}

/// Width of the longest histogram bar in characters.
const HISTOGRAM_BAR_WIDTH: usize = 40;

/// Format a latency histogram as a text bar chart.
///
/// Bar lengths follow `ln(1 + count)`. Empty leading and trailing bins are
/// skipped.
pub fn format_histogram(bins: &[Bin]) -> String {
    let first = bins.iter().position(|b| b.count > 0);
    let last = bins.iter().rposition(|b| b.count > 0);
    let (Some(first), Some(last)) = (first, last) else {
        return String::new();
    };
    let bins = &bins[first..=last];
    let peak = bins.iter().map(|b| b.count).max().unwrap_or(1) as f64;

    let mut output = String::new();
    output.push_str(&format!(
        "       | {}\n",
        format!("Histogram ({} ns bins, log scale)", bins[0].upper_ns - bins[0].lower_ns).bold()
    ));
    output.push_str(&"\u{2500}".repeat(54));
    output.push('\n');
    for bin in bins {
        let len = if bin.count == 0 {
            0
        } else {
            let scaled = (bin.count as f64).ln_1p() / peak.ln_1p() * HISTOGRAM_BAR_WIDTH as f64;
            (scaled.round() as usize).max(1)
        };
        output.push_str(&format!(
            "{:>8} ns | {}{} {}\n",
            bin.lower_ns,
            "\u{2588}".repeat(len).blue(),
            " ".repeat(HISTOGRAM_BAR_WIDTH - len),
            bin.count
        ));
    }
    output
}

/// Format preflight findings, one per line. An unusable counter comes
/// first.
pub fn format_preflight(result: &PreflightResult) -> String {
    let mut output = String::new();
    if let Some(reason) = &result.counter_error {
        output.push_str(&format!(
            "{} cycle counter unusable: {} (only --simulate can run)\n",
            "\u{2717}".red().bold(),
            reason
        ));
    }
    for warning in &result.warnings {
        output.push_str(&format!("{} {}\n", "\u{26A0}".yellow().bold(), warning.description()));
    }
    output
}

/// Format a device listing, one `address vendor:device class` line each.
pub fn format_devices(devices: &[DeviceIdentity]) -> String {
    let mut output = String::new();
    for dev in devices {
        output.push_str(&format!(
            "  {}  {:04x}:{:04x}  class {:06x}\n",
            dev.address, dev.vendor, dev.device, dev.class
        ));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::RunInfo;

    fn make_report(discarded_percent: f64) -> Report {
        let summary = Summary {
            samples: 100,
            mean_cycles: 1234.5,
            stddev_cycles: 10.25,
            mean_ns: 411.5,
            stddev_ns: 3.42,
        };
        Report {
            info: RunInfo {
                device: "0000:03:00.0".to_string(),
                counter: "rdtscp".to_string(),
                tsc_freq: 3_000_000_000,
                tsc_overhead: 30,
                target_bar: 2,
                bar_offset: 0x10,
                loops: 100,
            },
            raw: summary,
            filtered: summary,
            discarded_percent,
            histogram: Vec::new(),
        }
    }

    #[test]
    fn test_format_report() {
        colored::control::set_override(false);
        let output = format_report(&make_report(0.0));
        assert!(output.contains("Device:   0000:03:00.0"));
        assert!(output.contains("Offset:   0x10"));
        assert!(output.contains("1234.50 cycles"));
        assert!(output.contains("411.50 ns"));
        assert!(output.contains("0.000% discarded"));
    }

    #[test]
    fn test_format_histogram() {
        colored::control::set_override(false);
        let bin = |lower_ns, count| Bin {
            lower_ns,
            upper_ns: lower_ns + 10,
            count,
        };
        let bins = [bin(80, 0), bin(90, 1), bin(100, 0), bin(110, 1000), bin(120, 0)];
        let out = format_histogram(&bins);
        let rows: Vec<&str> = out.lines().skip(2).collect();

        // Leading and trailing empty bins are dropped, inner ones kept.
        assert_eq!(rows.len(), 3);
        assert!(out.contains("10 ns bins"));
        assert!(rows[0].starts_with("      90 ns |"));
        assert!(rows[0].ends_with(" 1"));
        assert_eq!(rows[1].matches('\u{2588}').count(), 0);
        assert_eq!(rows[2].matches('\u{2588}').count(), HISTOGRAM_BAR_WIDTH);
        assert_eq!(rows[0].matches('\u{2588}').count(), 4);

        assert!(format_histogram(&[bin(0, 0)]).is_empty());
        assert!(format_histogram(&[]).is_empty());
    }

    #[test]
    fn test_format_preflight() {
        colored::control::set_override(false);
        let mut result = PreflightResult::new();
        assert!(format_preflight(&result).is_empty());

        result.add_system_warning(crate::preflight::SystemWarning::TurboBoostEnabled);
        let out = format_preflight(&result);
        assert_eq!(out.lines().count(), 1);
        assert!(out.contains("Turbo boost"));

        result.counter_error = Some("rdtscp not available".to_string());
        let out = format_preflight(&result);
        assert_eq!(out.lines().count(), 2);
        assert!(out.lines().next().unwrap().contains("rdtscp not available"));
    }

    #[test]
    fn test_format_devices() {
        let nic = DeviceIdentity {
            address: "02:00.0".parse().unwrap(),
            vendor: 0x8086,
            device: 0x10d3,
            subvendor: 0x8086,
            subdevice: 0xa01f,
            class: 0x020000,
        };
        assert_eq!(
            format_devices(&[nic]),
            "  0000:02:00.0  8086:10d3  class 020000\n"
        );
        assert!(format_devices(&[]).is_empty());
    }
}
