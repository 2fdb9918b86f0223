//! JSON serialization for run reports.

use crate::report::Report;

/// Serialize a Report to a compact JSON string.
///
/// # Errors
///
/// Returns an error if serialization fails (non-finite floats serialize as
/// `null`, so in practice it does not).
pub fn to_json(report: &Report) -> Result<String, serde_json::Error> {
    serde_json::to_string(report)
}

/// Serialize a Report to a pretty-printed JSON string.
///
/// # Errors
///
/// See [`to_json`].
pub fn to_json_pretty(report: &Report) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Bin, RunInfo, Summary};

    fn make_report() -> Report {
        let summary = Summary {
            samples: 1000,
            mean_cycles: 1650.0,
            stddev_cycles: 42.5,
            mean_ns: 550.0,
            stddev_ns: 14.2,
        };
        Report {
            info: RunInfo {
                device: "0000:00:05.0".to_string(),
                counter: "rdtscp".to_string(),
                tsc_freq: 3_000_000_000,
                tsc_overhead: 36,
                target_bar: 0,
                bar_offset: 0x40,
                loops: 1000,
            },
            raw: summary,
            filtered: Summary {
                samples: 997,
                ..summary
            },
            discarded_percent: 0.3,
            histogram: vec![
                Bin {
                    lower_ns: 540,
                    upper_ns: 550,
                    count: 400,
                },
                Bin {
                    lower_ns: 550,
                    upper_ns: 560,
                    count: 597,
                },
            ],
        }
    }

    #[test]
    fn test_to_json() {
        let json = to_json(&make_report()).unwrap();
        assert!(json.contains("\"tsc_freq\":3000000000"));
        assert!(json.contains("\"mean_ns\":550.0"));
        assert!(json.contains("\"bar_offset\":64"));
        assert!(json.contains("\"histogram\":[{\"lower_ns\":540,\"upper_ns\":550,\"count\":400}"));
    }

    #[test]
    fn test_to_json_pretty_round_trips() {
        let report = make_report();
        let json = to_json_pretty(&report).unwrap();
        assert!(json.contains('\n'));
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
