//! Error type shared by the measurement engine and its collaborators.

use std::fmt;
use std::io;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by sessions, the control plane and device binding.
#[derive(Debug)]
pub enum Error {
    /// The host lacks a required timestamp capability (serializing counter
    /// read or invariant counter). Fatal: nothing can be measured.
    CapabilityUnsupported {
        /// The missing feature.
        feature: &'static str,
    },

    /// A configuration value was out of range. Prior configuration is kept.
    InvalidConfiguration {
        /// Name of the rejected setting.
        field: &'static str,
        /// The rejected value as written by the caller.
        value: String,
    },

    /// The selected BAR is not memory mapped.
    TargetUnavailable {
        /// Selected BAR index.
        bar: u8,
    },

    /// `offset + 4` exceeds the length of the selected BAR.
    RangeViolation {
        /// Selected BAR index.
        bar: u8,
        /// Requested byte offset.
        offset: u32,
        /// Length of the BAR in bytes.
        length: i32,
    },

    /// The result buffer could not be resized. The previous buffer is kept.
    AllocationFailure {
        /// Requested number of samples.
        samples: u32,
    },

    /// A run was cancelled between iterations.
    Cancelled {
        /// Samples written before the cancellation was observed.
        completed: usize,
    },

    /// No control-plane attribute with this name.
    UnknownAttribute(String),

    /// The attribute exists but does not support the requested access.
    AccessDenied {
        /// Attribute name.
        attribute: &'static str,
    },

    /// A PCI address or device id string could not be parsed.
    InvalidAddress(String),

    /// An OS call or sysfs access failed.
    Io {
        /// What was being done, usually a path.
        context: String,
        /// Underlying error.
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Negative errno value, as a kernel attribute store would report it.
    pub fn errno(&self) -> i32 {
        match self {
            Error::CapabilityUnsupported { .. } => -libc::EPERM,
            Error::InvalidConfiguration { .. }
            | Error::TargetUnavailable { .. }
            | Error::RangeViolation { .. }
            | Error::InvalidAddress(_) => -libc::EINVAL,
            Error::AllocationFailure { .. } => -libc::ENOMEM,
            Error::Cancelled { .. } => -libc::EINTR,
            Error::UnknownAttribute(_) => -libc::ENOENT,
            Error::AccessDenied { .. } => -libc::EACCES,
            Error::Io { source, .. } => -source.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CapabilityUnsupported { feature } => {
                write!(f, "host cannot benchmark with the cycle counter: {} not available", feature)
            }
            Error::InvalidConfiguration { field, value } => {
                write!(f, "invalid value for {}: {:?}", field, value)
            }
            Error::TargetUnavailable { bar } => write!(f, "target BAR{} not mmaped", bar),
            Error::RangeViolation { bar, offset, length } => write!(
                f,
                "BAR{} length {}, offset {:#x}: range failure",
                bar, length, offset
            ),
            Error::AllocationFailure { samples } => {
                write!(f, "could not allocate result buffer for {} samples", samples)
            }
            Error::Cancelled { completed } => {
                write!(f, "measurement cancelled after {} samples", completed)
            }
            Error::UnknownAttribute(name) => write!(f, "unknown attribute '{}'", name),
            Error::AccessDenied { attribute } => {
                write!(f, "attribute '{}' does not support this access", attribute)
            }
            Error::InvalidAddress(s) => write!(f, "invalid PCI address or id: '{}'", s),
            Error::Io { context, source } => write!(f, "{}: {}", context, source),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
