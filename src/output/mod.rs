//! Output formatting for run reports.

mod csv;
mod json;
mod terminal;

pub use csv::{default_csv_name, save_csv, write_csv};
pub use json::{to_json, to_json_pretty};
pub use terminal::{format_devices, format_histogram, format_preflight, format_report};
