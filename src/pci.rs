//! PCI device discovery and BAR mapping through sysfs.
//!
//! Devices live under `/sys/bus/pci/devices/<domain:bus:dev.fn>`. Each has a
//! `resource` table with one `start end flags` line per resource and a
//! `resourceN` file per BAR that can be mmapped by root. Every function here
//! takes the sysfs root as a parameter so tests can use a fake tree.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::BAR_COUNT;
use crate::error::{Error, Result};
use crate::region::{Region, RegionTable};

/// Default sysfs directory of PCI devices.
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Resource flag of memory-space BARs.
pub const IORESOURCE_MEM: u64 = 0x200;

/// Wildcard for vendor and subsystem fields of a [`PciId`].
pub const PCI_ANY_ID: u32 = !0;

/// A PCI function address (`DDDD:BB:DD.F`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PciAddress {
    /// PCI domain (segment).
    pub domain: u16,
    /// Bus number.
    pub bus: u8,
    /// Device (slot) number, `0..32`.
    pub device: u8,
    /// Function number, `0..8`.
    pub function: u8,
}

impl PciAddress {
    /// Address without the domain, `BB:DD.F`.
    pub fn short(&self) -> String {
        format!("{:02x}:{:02x}.{:x}", self.bus, self.device, self.function)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{}", self.domain, self.short())
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    /// Parse `BB:DD.F` (domain 0) or `DDDD:BB:DD.F`, all hexadecimal.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_string());

        let (head, function) = s.trim().rsplit_once('.').ok_or_else(invalid)?;
        let parts: Vec<&str> = head.split(':').collect();
        let (domain, bus, device) = match parts.as_slice() {
            [bus, device] => ("0", *bus, *device),
            [domain, bus, device] => (*domain, *bus, *device),
            _ => return Err(invalid()),
        };

        let domain = u16::from_str_radix(domain, 16).map_err(|_| invalid())?;
        let bus = u8::from_str_radix(bus, 16).map_err(|_| invalid())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| invalid())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| invalid())?;
        if device >= 32 || function >= 8 {
            return Err(invalid());
        }

        Ok(PciAddress {
            domain,
            bus,
            device,
            function,
        })
    }
}

/// Identity registers of a PCI function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Where the device sits.
    pub address: PciAddress,
    /// Vendor ID.
    pub vendor: u32,
    /// Device ID.
    pub device: u32,
    /// Subsystem vendor ID.
    pub subvendor: u32,
    /// Subsystem device ID.
    pub subdevice: u32,
    /// 24-bit class code.
    pub class: u32,
}

impl DeviceIdentity {
    fn read(dir: &Path, address: PciAddress) -> Result<Self> {
        Ok(DeviceIdentity {
            address,
            vendor: read_hex(&dir.join("vendor"))?,
            device: read_hex(&dir.join("device"))?,
            subvendor: read_hex(&dir.join("subsystem_vendor")).unwrap_or(PCI_ANY_ID),
            subdevice: read_hex(&dir.join("subsystem_device")).unwrap_or(PCI_ANY_ID),
            class: read_hex(&dir.join("class")).unwrap_or(0),
        })
    }
}

/// A device match pattern, `vendor:device[:subvendor[:subdevice[:class[:class_mask]]]]`.
///
/// Omitted subsystem fields match anything; the class only constrains the
/// bits set in `class_mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciId {
    /// Vendor ID or [`PCI_ANY_ID`].
    pub vendor: u32,
    /// Device ID or [`PCI_ANY_ID`].
    pub device: u32,
    /// Subsystem vendor ID or [`PCI_ANY_ID`].
    pub subvendor: u32,
    /// Subsystem device ID or [`PCI_ANY_ID`].
    pub subdevice: u32,
    /// Class code to compare.
    pub class: u32,
    /// Bits of the class code that must match.
    pub class_mask: u32,
}

impl PciId {
    /// Whether `dev` matches this pattern.
    pub fn matches(&self, dev: &DeviceIdentity) -> bool {
        let field = |want: u32, have: u32| want == PCI_ANY_ID || want == have;
        field(self.vendor, dev.vendor)
            && field(self.device, dev.device)
            && field(self.subvendor, dev.subvendor)
            && field(self.subdevice, dev.subdevice)
            && (self.class ^ dev.class) & self.class_mask == 0
    }
}

impl FromStr for PciId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = [PCI_ANY_ID, PCI_ANY_ID, PCI_ANY_ID, PCI_ANY_ID, 0, 0];
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() < 2 || parts.len() > fields.len() {
            return Err(Error::InvalidAddress(s.to_string()));
        }
        for (slot, part) in fields.iter_mut().zip(&parts) {
            let hex = part.strip_prefix("0x").unwrap_or(part);
            *slot = u32::from_str_radix(hex, 16).map_err(|_| Error::InvalidAddress(s.to_string()))?;
        }
        let [vendor, device, subvendor, subdevice, class, class_mask] = fields;
        Ok(PciId {
            vendor,
            device,
            subvendor,
            subdevice,
            class,
            class_mask,
        })
    }
}

/// Parse a comma-separated id list. Empty entries are skipped; malformed
/// ones are skipped with a warning.
pub fn parse_id_list(list: &str) -> Vec<PciId> {
    list.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .filter_map(|id| match id.parse::<PciId>() {
            Ok(parsed) => {
                info!(
                    "add {:04X}:{:04X} sub={:04X}:{:04X} cls={:08X}/{:08X}",
                    parsed.vendor,
                    parsed.device,
                    parsed.subvendor,
                    parsed.subdevice,
                    parsed.class,
                    parsed.class_mask
                );
                Some(parsed)
            }
            Err(_) => {
                warn!(id, "invalid id string");
                None
            }
        })
        .collect()
}

/// List devices under `root` matching any of `ids` (all devices if `ids`
/// is empty), sorted by address.
pub fn scan(root: &Path, ids: &[PciId]) -> Result<Vec<DeviceIdentity>> {
    let entries = fs::read_dir(root).map_err(|e| Error::io(root.display().to_string(), e))?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(root.display().to_string(), e))?;
        let name = entry.file_name();
        let Some(address) = name.to_str().and_then(|n| n.parse::<PciAddress>().ok()) else {
            continue;
        };
        let identity = match DeviceIdentity::read(&entry.path(), address) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(%address, error = %e, "skipping unreadable device");
                continue;
            }
        };
        if ids.is_empty() || ids.iter().any(|id| id.matches(&identity)) {
            found.push(identity);
        }
    }

    found.sort_by_key(|d| d.address);
    Ok(found)
}

/// One line of a device's `resource` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// First bus address.
    pub start: u64,
    /// Last bus address (inclusive).
    pub end: u64,
    /// `IORESOURCE_*` flags.
    pub flags: u64,
}

impl ResourceEntry {
    /// Length in bytes; 0 for an unused resource.
    pub fn len(&self) -> u64 {
        if self.end == 0 || self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// Whether the resource is unused.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is a memory-space resource.
    pub fn is_mem(&self) -> bool {
        self.flags & IORESOURCE_MEM != 0
    }
}

impl FromStr for ResourceEntry {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut fields = s.split_whitespace().map(|f| {
            let hex = f.strip_prefix("0x").unwrap_or(f);
            u64::from_str_radix(hex, 16).map_err(|_| Error::InvalidAddress(s.to_string()))
        });
        let mut next = || fields.next().unwrap_or_else(|| Err(Error::InvalidAddress(s.to_string())));
        Ok(ResourceEntry {
            start: next()?,
            end: next()?,
            flags: next()?,
        })
    }
}

/// An opened PCI function in sysfs.
#[derive(Debug, Clone)]
pub struct PciDevice {
    address: PciAddress,
    dir: PathBuf,
}

impl PciDevice {
    /// Open `address` under [`SYSFS_PCI_DEVICES`].
    pub fn open(address: PciAddress) -> Result<Self> {
        Self::open_in(Path::new(SYSFS_PCI_DEVICES), address)
    }

    /// Open `address` under an explicit sysfs root.
    pub fn open_in(root: &Path, address: PciAddress) -> Result<Self> {
        let dir = root.join(address.to_string());
        let meta = fs::metadata(&dir).map_err(|e| Error::io(dir.display().to_string(), e))?;
        if !meta.is_dir() {
            return Err(Error::io(
                dir.display().to_string(),
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a device directory"),
            ));
        }
        Ok(PciDevice { address, dir })
    }

    /// The device address.
    pub fn address(&self) -> PciAddress {
        self.address
    }

    /// The device's sysfs directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Vendor, device and class registers.
    pub fn identity(&self) -> Result<DeviceIdentity> {
        DeviceIdentity::read(&self.dir, self.address)
    }

    /// The first six lines of the `resource` table, one per BAR. Missing
    /// lines read as unused.
    pub fn resources(&self) -> Result<[ResourceEntry; BAR_COUNT]> {
        let path = self.dir.join("resource");
        let text = fs::read_to_string(&path).map_err(|e| Error::io(path.display().to_string(), e))?;

        let mut table = [ResourceEntry::default(); BAR_COUNT];
        for (slot, line) in table.iter_mut().zip(text.lines()) {
            *slot = line.parse()?;
        }
        Ok(table)
    }

    /// Enable the device by writing `1` to its `enable` attribute.
    pub fn enable(&self) -> Result<()> {
        let path = self.dir.join("enable");
        fs::write(&path, "1").map_err(|e| Error::io(path.display().to_string(), e))
    }

    /// Map every memory BAR from its `resourceN` file.
    ///
    /// I/O-port and unused BARs stay unmapped. If one mapping fails the
    /// ones already made are released and the error is returned.
    pub fn map_regions(&self) -> Result<RegionTable> {
        let resources = self.resources()?;
        let mut table = RegionTable::unmapped();

        for (index, res) in resources.iter().enumerate() {
            if !res.is_mem() || res.is_empty() {
                continue;
            }
            let path = self.dir.join(format!("resource{}", index));
            let region = Region::map_file(&path, res.len())?;
            info!(
                device = %self.address,
                bar = index,
                start = %format!("{:#x}", res.start),
                length = region.length(),
                "mapped BAR"
            );
            table = table.with(index as u8, region);
        }

        Ok(table)
    }
}

fn read_hex(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path.display().to_string(), e))?;
    let text = text.trim();
    let hex = text.strip_prefix("0x").unwrap_or(text);
    u32::from_str_radix(hex, 16).map_err(|_| Error::InvalidAddress(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNUSED: &str = "0x0000000000000000 0x0000000000000000 0x0000000000000000";

    fn fake_device(root: &Path, addr: &str, vendor: &str, device: &str, bar0_len: u64) -> PathBuf {
        let dir = root.join(addr);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("vendor"), format!("{}\n", vendor)).unwrap();
        fs::write(dir.join("device"), format!("{}\n", device)).unwrap();
        fs::write(dir.join("subsystem_vendor"), "0x1af4\n").unwrap();
        fs::write(dir.join("subsystem_device"), "0x0001\n").unwrap();
        fs::write(dir.join("class"), "0x020000\n").unwrap();

        let mut lines = vec![
            format!(
                "0x00000000fe000000 0x{:016x} 0x0000000000040200",
                0xfe00_0000 + bar0_len - 1
            ),
            "0x000000000000c000 0x000000000000c03f 0x0000000000040101".to_string(),
        ];
        lines.extend(std::iter::repeat(UNUSED.to_string()).take(11));
        fs::write(dir.join("resource"), lines.join("\n") + "\n").unwrap();

        let bar0 = fs::File::create(dir.join("resource0")).unwrap();
        bar0.set_len(bar0_len).unwrap();
        dir
    }

    #[test]
    fn test_address_parse_and_display() {
        let addr: PciAddress = "00:05.0".parse().unwrap();
        assert_eq!(addr.to_string(), "0000:00:05.0");
        assert_eq!(addr.short(), "00:05.0");

        let addr: PciAddress = "0001:3b:1f.7".parse().unwrap();
        assert_eq!((addr.domain, addr.bus, addr.device, addr.function), (1, 0x3b, 0x1f, 7));

        for bad in ["", "00:05", "00:20.0", "00:05.8", "zz:05.0", "0:0:0:0.0"] {
            assert!(bad.parse::<PciAddress>().is_err(), "{} should not parse", bad);
        }
    }

    #[test]
    fn test_id_parse_and_match() {
        let id: PciId = "8086:10d3".parse().unwrap();
        assert_eq!(id.subvendor, PCI_ANY_ID);
        assert_eq!(id.class_mask, 0);

        let dev = DeviceIdentity {
            address: "00:05.0".parse().unwrap(),
            vendor: 0x8086,
            device: 0x10d3,
            subvendor: 0x1af4,
            subdevice: 1,
            class: 0x020000,
        };
        assert!(id.matches(&dev));
        assert!(!"8086:1234".parse::<PciId>().unwrap().matches(&dev));
        assert!("8086:10d3:1af4:1:020000:ff0000".parse::<PciId>().unwrap().matches(&dev));
        assert!(!"8086:10d3:ffffffff:ffffffff:030000:ff0000"
            .parse::<PciId>()
            .unwrap()
            .matches(&dev));
        assert!("8086".parse::<PciId>().is_err());
    }

    #[test]
    fn test_id_list_skips_bad_entries() {
        let ids = parse_id_list("8086:10d3,,bogus,1af4:1000:1af4:0001");
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1].subdevice, 1);
        assert!(parse_id_list("").is_empty());
    }

    #[test]
    fn test_resource_entry() {
        let mem: ResourceEntry = "0x00000000fe000000 0x00000000fe000fff 0x0000000000040200"
            .parse()
            .unwrap();
        assert!(mem.is_mem());
        assert_eq!(mem.len(), 4096);

        let unused: ResourceEntry = UNUSED.parse().unwrap();
        assert!(unused.is_empty());
        assert!("0x1 0x2".parse::<ResourceEntry>().is_err());
    }

    #[test]
    fn test_scan_filters_by_id() {
        let root = tempfile::tempdir().unwrap();
        fake_device(root.path(), "0000:00:05.0", "0x8086", "0x10d3", 4096);
        fake_device(root.path(), "0000:00:03.0", "0x1af4", "0x1000", 4096);
        fs::create_dir(root.path().join("not-a-device")).unwrap();

        let all = scan(root.path(), &[]).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].address.short(), "00:03.0");

        let ids = parse_id_list("8086:10d3");
        let hits = scan(root.path(), &ids).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].device, 0x10d3);
    }

    #[test]
    fn test_map_regions_only_memory_bars() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_device(root.path(), "0000:00:05.0", "0x8086", "0x10d3", 4096);

        let dev = PciDevice::open_in(root.path(), "00:05.0".parse().unwrap()).unwrap();
        assert_eq!(dev.path(), dir.as_path());
        let table = dev.map_regions().unwrap();

        assert_eq!(table.get(0).unwrap().length(), 4096);
        // BAR1 is an I/O port range.
        assert_eq!(table.get(1).unwrap().length(), -1);
        assert!((2..6).all(|i| !table.get(i).unwrap().is_mapped()));
    }

    #[test]
    fn test_map_regions_missing_file_fails() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_device(root.path(), "0000:00:05.0", "0x8086", "0x10d3", 4096);
        fs::remove_file(dir.join("resource0")).unwrap();

        let dev = PciDevice::open_in(root.path(), "00:05.0".parse().unwrap()).unwrap();
        assert!(matches!(dev.map_regions(), Err(Error::Io { .. })));
    }

    #[test]
    fn test_open_missing_device() {
        let root = tempfile::tempdir().unwrap();
        let err = PciDevice::open_in(root.path(), "00:05.0".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_enable_writes_attribute() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_device(root.path(), "0000:00:05.0", "0x8086", "0x10d3", 4096);
        let dev = PciDevice::open_in(root.path(), "00:05.0".parse().unwrap()).unwrap();
        dev.enable().unwrap();
        assert_eq!(fs::read_to_string(dir.join("enable")).unwrap(), "1");
    }
}
