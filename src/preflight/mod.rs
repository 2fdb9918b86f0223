//! Preflight checks of the host before a measurement run.
//!
//! # Checks Performed
//!
//! - **Counter**: the platform cycle counter is usable (fatal if not)
//! - **System**: CPU governor, turbo, SMT, VM, load and privileges

mod system;

pub use system::{system_check, SystemWarning};

use serde::{Deserialize, Serialize};

/// Result of running all preflight checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreflightResult {
    /// Warnings from system checks.
    pub warnings: Vec<SystemWarning>,

    /// Why the platform counter cannot be used, if it cannot.
    pub counter_error: Option<String>,
}

impl PreflightResult {
    /// Create a new empty preflight result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a system warning.
    pub fn add_system_warning(&mut self, warning: SystemWarning) {
        self.warnings.push(warning);
    }

    /// Whether a hardware run can proceed. Warnings never block one.
    pub fn is_valid(&self) -> bool {
        self.counter_error.is_none()
    }

    /// Check if there are any warnings.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Run all preflight checks and collect warnings.
pub fn run_all_checks() -> PreflightResult {
    let mut result = PreflightResult::new();

    #[cfg(target_arch = "x86_64")]
    if let Err(e) = crate::measurement::Tsc::check_capabilities() {
        result.counter_error = Some(e.to_string());
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    if let Err(e) = crate::measurement::detect() {
        result.counter_error = Some(e.to_string());
    }

    for warning in system_check() {
        result.add_system_warning(warning);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preflight_result_validity() {
        let mut result = PreflightResult::new();
        assert!(result.is_valid());
        assert!(!result.has_warnings());

        result.add_system_warning(SystemWarning::TurboBoostEnabled);
        assert!(result.has_warnings());
        assert!(result.is_valid());

        result.counter_error = Some("rdtscp not available".to_string());
        assert!(!result.is_valid());
    }

    #[test]
    fn test_run_all_checks() {
        let result = run_all_checks();
        if let Some(reason) = &result.counter_error {
            eprintln!("platform counter unusable here: {}", reason);
        }
        assert_eq!(result.is_valid(), result.counter_error.is_none());
    }
}
