//! System-level preflight checks.
//!
//! Host settings that add variance to MMIO latency samples.

use serde::{Deserialize, Serialize};

/// Warning from system checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SystemWarning {
    /// CPU frequency scaling is not set to performance mode.
    CpuGovernorNotPerformance {
        /// Current governor setting.
        current: String,
        /// Recommended governor.
        recommended: String,
    },

    /// Could not read CPU governor (permission or path issue).
    CpuGovernorUnreadable {
        /// Error message.
        reason: String,
    },

    /// Turbo boost is enabled.
    TurboBoostEnabled,

    /// SMT siblings share the core running the measurement.
    HyperthreadingEnabled,

    /// Running in a virtual machine.
    VirtualMachineDetected {
        /// Type of VM if known.
        vm_type: Option<String>,
    },

    /// High system load detected.
    HighSystemLoad {
        /// Current load average.
        load_average: f64,
        /// Threshold exceeded.
        threshold: f64,
    },

    /// Not running as root. BAR `resourceN` files and `SCHED_FIFO` need it.
    NotPrivileged {
        /// Effective user id.
        euid: u32,
    },
}

impl SystemWarning {
    /// Get a human-readable description of the warning.
    pub fn description(&self) -> String {
        match self {
            SystemWarning::CpuGovernorNotPerformance {
                current,
                recommended,
            } => {
                format!(
                    "CPU frequency governor is '{}', recommend '{}' for stable latencies. \
                     Set with: sudo cpufreq-set -g performance",
                    current, recommended
                )
            }
            SystemWarning::CpuGovernorUnreadable { reason } => {
                format!("Could not check CPU governor: {}.", reason)
            }
            SystemWarning::TurboBoostEnabled => {
                "Turbo boost is enabled. This can cause latency variability. \
                 Consider disabling for more stable measurements."
                    .to_string()
            }
            SystemWarning::HyperthreadingEnabled => {
                "Hyperthreading detected. Pin the run with --cpu to a core whose \
                 sibling is idle."
                    .to_string()
            }
            SystemWarning::VirtualMachineDetected { vm_type } => {
                let vm_info = vm_type
                    .as_ref()
                    .map(|t| format!(" ({})", t))
                    .unwrap_or_default();
                format!(
                    "Running in a virtual machine{}. MMIO reads may trap to the \
                     hypervisor and latencies will include the exit.",
                    vm_info
                )
            }
            SystemWarning::HighSystemLoad {
                load_average,
                threshold,
            } => {
                format!(
                    "High system load detected: {:.2} (threshold: {:.2}). \
                     Expect more outliers.",
                    load_average, threshold
                )
            }
            SystemWarning::NotPrivileged { euid } => {
                format!(
                    "Running as uid {}. Mapping device BARs and real-time \
                     scheduling require root.",
                    euid
                )
            }
        }
    }
}

/// Perform all system checks.
///
/// Returns a vector of warnings for any issues detected.
/// On unsupported platforms, returns an empty vector.
pub fn system_check() -> Vec<SystemWarning> {
    #[allow(unused_mut)]
    let mut warnings = Vec::new();

    #[cfg(target_os = "linux")]
    {
        let checks: [fn() -> Option<SystemWarning>; 6] = [
            check_cpu_governor_linux,
            check_turbo_boost_linux,
            check_hyperthreading_linux,
            check_vm_detection_linux,
            check_load_linux,
            check_privileges,
        ];
        warnings.extend(checks.iter().filter_map(|check| check()));
    }

    warnings
}

/// Check CPU frequency governor on Linux.
#[cfg(target_os = "linux")]
fn check_cpu_governor_linux() -> Option<SystemWarning> {
    let governor_path = "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor";

    match std::fs::read_to_string(governor_path) {
        Ok(governor) => {
            let governor = governor.trim().to_lowercase();
            if governor != "performance" {
                Some(SystemWarning::CpuGovernorNotPerformance {
                    current: governor,
                    recommended: "performance".to_string(),
                })
            } else {
                None
            }
        }
        // No cpufreq driver at all: nothing scales.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => Some(SystemWarning::CpuGovernorUnreadable {
            reason: e.to_string(),
        }),
    }
}

#[cfg(target_os = "linux")]
fn check_turbo_boost_linux() -> Option<SystemWarning> {
    let intel_path = "/sys/devices/system/cpu/intel_pstate/no_turbo";
    if let Ok(value) = std::fs::read_to_string(intel_path) {
        if value.trim() == "0" {
            return Some(SystemWarning::TurboBoostEnabled);
        }
        return None;
    }

    let generic_path = "/sys/devices/system/cpu/cpufreq/boost";
    if let Ok(value) = std::fs::read_to_string(generic_path) {
        if value.trim() == "1" {
            return Some(SystemWarning::TurboBoostEnabled);
        }
    }

    None
}

#[cfg(target_os = "linux")]
fn check_hyperthreading_linux() -> Option<SystemWarning> {
    let path = "/sys/devices/system/cpu/smt/active";
    if let Ok(value) = std::fs::read_to_string(path) {
        if value.trim() == "1" {
            return Some(SystemWarning::HyperthreadingEnabled);
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn check_vm_detection_linux() -> Option<SystemWarning> {
    let cpuinfo = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    if !cpuinfo.to_lowercase().contains("hypervisor") {
        return None;
    }
    let vm_type = std::fs::read_to_string("/sys/class/dmi/id/sys_vendor")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    Some(SystemWarning::VirtualMachineDetected { vm_type })
}

#[cfg(target_os = "linux")]
fn check_load_linux() -> Option<SystemWarning> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    parse_load(&loadavg, 1.0)
}

fn parse_load(loadavg: &str, threshold: f64) -> Option<SystemWarning> {
    let load = loadavg
        .split_whitespace()
        .next()
        .and_then(|val| val.parse::<f64>().ok())?;

    if load > threshold {
        Some(SystemWarning::HighSystemLoad {
            load_average: load,
            threshold,
        })
    } else {
        None
    }
}

#[cfg(unix)]
fn check_privileges() -> Option<SystemWarning> {
    let euid = unsafe { libc::geteuid() };
    (euid != 0).then_some(SystemWarning::NotPrivileged { euid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_check_runs() {
        // Just verify it doesn't panic
        let _warnings = system_check();
    }

    #[test]
    fn test_warning_descriptions() {
        let warning = SystemWarning::CpuGovernorNotPerformance {
            current: "powersave".to_string(),
            recommended: "performance".to_string(),
        };
        let desc = warning.description();
        assert!(desc.contains("powersave"));
        assert!(desc.contains("performance"));

        let warning = SystemWarning::VirtualMachineDetected {
            vm_type: Some("QEMU".to_string()),
        };
        let desc = warning.description();
        assert!(desc.contains("virtual machine"));
        assert!(desc.contains("QEMU"));

        let desc = SystemWarning::NotPrivileged { euid: 1000 }.description();
        assert!(desc.contains("1000"));
        assert!(desc.contains("root"));
    }

    #[test]
    fn test_parse_load() {
        assert_eq!(parse_load("0.42 0.30 0.20 1/200 1234\n", 1.0), None);
        assert_eq!(
            parse_load("2.50 1.00 0.50 3/200 1234\n", 1.0),
            Some(SystemWarning::HighSystemLoad {
                load_average: 2.5,
                threshold: 1.0
            })
        );
        assert_eq!(parse_load("", 1.0), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_privilege_check_matches_euid() {
        let euid = unsafe { libc::geteuid() };
        assert_eq!(check_privileges().is_some(), euid != 0);
    }
}
