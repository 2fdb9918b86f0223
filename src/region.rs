//! Mapped device regions (BARs).
//!
//! A [`Region`] owns its mapping; dropping it unmaps. A [`RegionTable`] holds
//! the six BARs of one device and is read-only once built.

use std::fs::OpenOptions;
use std::path::Path;
use std::ptr::NonNull;

use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::config::{ACCESS_WIDTH, BAR_COUNT};
use crate::error::{Error, Result};
use crate::measurement::MmioTarget;

enum Mapping {
    /// A device BAR mapped from sysfs.
    Device(MmapRaw),
    /// Ordinary memory standing in for a BAR.
    Anonymous(MmapMut),
}

impl Mapping {
    fn base(&self) -> *const u8 {
        match self {
            Mapping::Device(map) => map.as_ptr(),
            Mapping::Anonymous(map) => map.as_ptr(),
        }
    }
}

/// One BAR: either a live mapping of `length` bytes or unmapped.
pub struct Region {
    mapping: Option<Mapping>,
    length: i32,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("mapped", &self.is_mapped())
            .field("length", &self.length)
            .finish()
    }
}

impl Region {
    /// A BAR that is absent or not memory-backed. Its length is -1.
    pub fn unmapped() -> Self {
        Self {
            mapping: None,
            length: -1,
        }
    }

    /// A RAM-backed region of `length` bytes.
    ///
    /// Reads cost a cache access instead of a bus round trip. Useful for
    /// simulation and for checking the harness itself.
    pub fn anonymous(length: usize) -> Result<Self> {
        let map = MmapMut::map_anon(length)
            .map_err(|e| Error::io(format!("anonymous mapping of {} bytes", length), e))?;
        Ok(Self {
            mapping: Some(Mapping::Anonymous(map)),
            length: clamp_length(length as u64),
        })
    }

    /// Map `length` bytes of `path` (a sysfs `resourceN` file) read/write
    /// and shared.
    pub fn map_file(path: &Path, length: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        let map = MmapOptions::new()
            .len(length as usize)
            .map_raw(&file)
            .map_err(|e| Error::io(format!("mmap {}", path.display()), e))?;
        Ok(Self {
            mapping: Some(Mapping::Device(map)),
            length: clamp_length(length),
        })
    }

    /// Length in bytes, or a negative value if unmapped.
    pub fn length(&self) -> i32 {
        self.length
    }

    /// Whether the region is backed by a live mapping.
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some() && self.length >= 0
    }

    /// Resolve the register at `offset` for a timed read.
    ///
    /// Fails with [`Error::TargetUnavailable`] if the region is unmapped and
    /// with [`Error::RangeViolation`] if `offset + 4` exceeds its length.
    /// `bar` is only used for error reporting.
    pub fn target(&self, bar: u8, offset: u32) -> Result<MmioTarget<'_>> {
        let mapping = match (&self.mapping, self.length) {
            (Some(mapping), len) if len >= 0 => mapping,
            _ => return Err(Error::TargetUnavailable { bar }),
        };

        if offset as i64 + ACCESS_WIDTH as i64 > self.length as i64 {
            return Err(Error::RangeViolation {
                bar,
                offset,
                length: self.length,
            });
        }
        if offset % ACCESS_WIDTH != 0 {
            return Err(Error::InvalidConfiguration {
                field: "bar_offset",
                value: offset.to_string(),
            });
        }

        let ptr = mapping.base().wrapping_add(offset as usize) as *mut u32;
        let ptr = NonNull::new(ptr).ok_or(Error::TargetUnavailable { bar })?;
        // In bounds and aligned: mappings are page aligned and offset % 4 == 0.
        Ok(unsafe { MmioTarget::new(ptr) })
    }
}

/// BAR lengths are reported as `i32`; larger regions saturate.
fn clamp_length(length: u64) -> i32 {
    i32::try_from(length).unwrap_or(i32::MAX)
}

/// The BARs of one device, indexed `0..BAR_COUNT`.
#[derive(Debug)]
pub struct RegionTable {
    regions: [Region; BAR_COUNT],
}

impl Default for RegionTable {
    fn default() -> Self {
        Self::unmapped()
    }
}

impl RegionTable {
    /// A table with every BAR unmapped.
    pub fn unmapped() -> Self {
        Self {
            regions: std::array::from_fn(|_| Region::unmapped()),
        }
    }

    /// Build from six regions.
    pub fn new(regions: [Region; BAR_COUNT]) -> Self {
        Self { regions }
    }

    /// Replace BAR `index`. Out-of-range indices are ignored.
    pub fn with(mut self, index: u8, region: Region) -> Self {
        if let Some(slot) = self.regions.get_mut(index as usize) {
            *slot = region;
        }
        self
    }

    /// BAR `index`, if it is a valid index.
    pub fn get(&self, index: u8) -> Option<&Region> {
        self.regions.get(index as usize)
    }

    /// All BARs in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter()
    }
}
