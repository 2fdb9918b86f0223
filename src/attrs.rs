//! Attribute-style control plane.
//!
//! Every setting of a [`Session`] is exposed as a named text attribute with
//! `show` and `store` operations, parsed the way a sysfs attribute would be:
//!
//! | Name | Access | Format |
//! |---|---|---|
//! | `tsc_freq` | read | counter frequency in Hz |
//! | `tsc_overhead` | read | overhead of one timestamp pair in ticks |
//! | `loops` | read/write | decimal |
//! | `target_bar` | read/write | hexadecimal, values above 5 ignored |
//! | `bar_offset` | read/write | decimal, unaligned values ignored |
//! | `measure` | write | any text starts a run |
//!
//! Names may carry a `pcielat_` prefix.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{Error, Result};
use crate::measurement::{CycleCounter, Quiesce};
use crate::session::Session;

const PREFIX: &str = "pcielat_";

/// A control-plane attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    /// Counter frequency (read-only).
    TscFreq,
    /// Timestamp pair overhead (read-only).
    TscOverhead,
    /// Iteration count.
    Loops,
    /// Target BAR index.
    TargetBar,
    /// Register offset within the target BAR.
    BarOffset,
    /// Run trigger (write-only).
    Measure,
}

impl Attribute {
    /// All attributes in listing order.
    pub const ALL: [Attribute; 6] = [
        Attribute::TscFreq,
        Attribute::TscOverhead,
        Attribute::Loops,
        Attribute::TargetBar,
        Attribute::BarOffset,
        Attribute::Measure,
    ];

    /// Attribute name without prefix.
    pub fn name(self) -> &'static str {
        match self {
            Attribute::TscFreq => "tsc_freq",
            Attribute::TscOverhead => "tsc_overhead",
            Attribute::Loops => "loops",
            Attribute::TargetBar => "target_bar",
            Attribute::BarOffset => "bar_offset",
            Attribute::Measure => "measure",
        }
    }

    /// Whether `show` is supported.
    pub fn readable(self) -> bool {
        self != Attribute::Measure
    }

    /// Whether `store` is supported.
    pub fn writable(self) -> bool {
        !matches!(self, Attribute::TscFreq | Attribute::TscOverhead)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Attribute {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bare = s.trim();
        let bare = bare.strip_prefix(PREFIX).unwrap_or(bare);
        Attribute::ALL
            .into_iter()
            .find(|attr| attr.name() == bare)
            .ok_or_else(|| Error::UnknownAttribute(s.to_string()))
    }
}

/// Read an attribute. The value is followed by a newline.
pub fn show<C: CycleCounter, Q: Quiesce>(session: &Session<C, Q>, attr: Attribute) -> Result<String> {
    let value = match attr {
        Attribute::TscFreq => session.tsc_freq().to_string(),
        Attribute::TscOverhead => session.tsc_overhead().to_string(),
        Attribute::Loops => session.loops().to_string(),
        Attribute::TargetBar => session.target_bar().to_string(),
        Attribute::BarOffset => session.bar_offset().to_string(),
        Attribute::Measure => {
            return Err(Error::AccessDenied {
                attribute: attr.name(),
            })
        }
    };
    Ok(value + "\n")
}

/// Write an attribute. Returns the number of bytes consumed, which is all
/// of `text` on success (at least 1 for `measure`).
///
/// `target_bar` and `bar_offset` accept anything: values that do not parse
/// or validate leave the setting unchanged. `loops` rejects them with
/// [`Error::InvalidConfiguration`]. Writing `measure` runs the session.
pub fn store<C: CycleCounter, Q: Quiesce>(
    session: &Session<C, Q>,
    attr: Attribute,
    text: &str,
) -> Result<usize> {
    match attr {
        Attribute::TscFreq | Attribute::TscOverhead => {
            return Err(Error::AccessDenied {
                attribute: attr.name(),
            })
        }
        Attribute::Loops => {
            let loops = scan_u32(text, 10).ok_or_else(|| Error::InvalidConfiguration {
                field: "loops",
                value: text.trim().to_string(),
            })?;
            session.set_loops(loops)?;
        }
        Attribute::TargetBar => match scan_u32(text, 16) {
            // Parsed as a 16-bit quantity.
            Some(bar) => {
                let bar = u8::try_from(bar & 0xffff).unwrap_or(u8::MAX);
                session.set_target_bar(bar);
            }
            None => debug!(text, "ignoring unparsable target_bar"),
        },
        Attribute::BarOffset => match scan_u32(text, 10) {
            Some(offset) => {
                session.set_bar_offset(offset);
            }
            None => debug!(text, "ignoring unparsable bar_offset"),
        },
        Attribute::Measure => {
            session.measure()?;
            // A completed run never reports zero bytes, even for an empty write.
            return Ok(text.len().max(1));
        }
    }
    Ok(text.len())
}

/// Scan a leading unsigned integer the way `sscanf("%u")` / `"%x"` does.
///
/// Leading whitespace is skipped, a `0x` prefix is accepted in base 16 and
/// parsing stops at the first non-digit. Returns `None` if no digit was
/// found or the value overflows.
pub fn scan_u32(text: &str, radix: u32) -> Option<u32> {
    let mut rest = text.trim_start();
    if let Some(r) = rest.strip_prefix('+') {
        rest = r;
    }
    if radix == 16 {
        if let Some(r) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
            if r.starts_with(|c: char| c.is_ascii_hexdigit()) {
                rest = r;
            }
        }
    }
    let end = rest
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    u32::from_str_radix(&rest[..end], radix).ok()
}
