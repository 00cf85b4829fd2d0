//! PCI sysfs reader: joins the CLI's bus-id column with the device minor the
//! kernel assigned, and answers device presence checks for health tracking.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use gcushare_common::config::PCI_DEVICE_PATH;
use tracing::error;

use super::HardwareError;

/// Vendor sub-directory names under a PCI device directory. One of them
/// holds the per-card `gcu<N>/dev` entries.
const VENDOR_DIRS: &[&str] = &["enflame", "zixiao"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDeviceInfo {
    pub major: String,
    pub minor: String,
    /// Full bus address, i.e. the sysfs directory name.
    pub bus_id: String,
}

/// PCI capability seam.
pub trait Pci: Send + Sync {
    /// Whether the device directory for `bus_id` still exists.
    fn device_present(&self, bus_id: &str) -> bool;
    /// Resolves a bus-id suffix (as printed by the CLI) to the full bus
    /// address and the device major/minor.
    fn lookup_by_bus_suffix(&self, suffix: &str) -> Result<PciDeviceInfo, Report<HardwareError>>;
}

/// Reads `/sys/bus/pci/devices`.
#[derive(Debug, Clone)]
pub struct SysfsPci {
    root: PathBuf,
}

impl Default for SysfsPci {
    fn default() -> Self {
        Self {
            root: PathBuf::from(PCI_DEVICE_PATH),
        }
    }
}

impl SysfsPci {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn vendor_dir(&self, device_dir: &Path) -> Option<PathBuf> {
        VENDOR_DIRS
            .iter()
            .map(|name| device_dir.join(name))
            .find(|path| path.exists())
    }
}

impl Pci for SysfsPci {
    fn device_present(&self, bus_id: &str) -> bool {
        self.root.join(bus_id).exists()
    }

    fn lookup_by_bus_suffix(&self, suffix: &str) -> Result<PciDeviceInfo, Report<HardwareError>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            Report::new(HardwareError::ParseFailed {
                message: format!("failed to read {}: {e}", self.root.display()),
            })
        })?;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(suffix) {
                continue;
            }
            let Some(vendor_dir) = self.vendor_dir(&entry.path()) else {
                error!(
                    device = %entry.path().display(),
                    "no vendor folder found under pci device directory"
                );
                return Err(Report::new(HardwareError::PciNotFound {
                    bus_id: suffix.to_string(),
                }));
            };

            let cards = fs::read_dir(&vendor_dir).map_err(|e| {
                Report::new(HardwareError::ParseFailed {
                    message: format!("failed to read {}: {e}", vendor_dir.display()),
                })
            })?;
            for card in cards.flatten() {
                let card_name = card.file_name().to_string_lossy().into_owned();
                // Only `<type><N>` entries carry a device number.
                let numbered = card_name
                    .trim_start_matches(|c: char| !c.is_ascii_digit())
                    .parse::<u32>()
                    .is_ok();
                if !numbered {
                    continue;
                }
                let dev_path = card.path().join("dev");
                let content = fs::read_to_string(&dev_path).map_err(|e| {
                    Report::new(HardwareError::ParseFailed {
                        message: format!("failed to read {}: {e}", dev_path.display()),
                    })
                })?;
                let parts: Vec<&str> = content.trim().split(':').collect();
                if parts.len() != 2 {
                    return Err(Report::new(HardwareError::ParseFailed {
                        message: format!("invalid device number format: {}", content.trim()),
                    }));
                }
                return Ok(PciDeviceInfo {
                    major: parts[0].to_string(),
                    minor: parts[1].to_string(),
                    bus_id: name,
                });
            }
        }
        Err(Report::new(HardwareError::PciNotFound {
            bus_id: suffix.to_string(),
        }))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory PCI tree keyed by bus-id suffix.
    #[derive(Default)]
    pub struct FakePci {
        pub devices: Mutex<BTreeMap<String, PciDeviceInfo>>,
    }

    impl FakePci {
        pub fn insert(&self, suffix: &str, minor: &str) {
            self.devices.lock().unwrap().insert(
                suffix.to_string(),
                PciDeviceInfo {
                    major: "238".to_string(),
                    minor: minor.to_string(),
                    bus_id: format!("0000:{suffix}"),
                },
            );
        }

        pub fn remove(&self, bus_id: &str) {
            self.devices
                .lock()
                .unwrap()
                .retain(|_, info| info.bus_id != bus_id);
        }
    }

    impl Pci for FakePci {
        fn device_present(&self, bus_id: &str) -> bool {
            self.devices
                .lock()
                .unwrap()
                .values()
                .any(|info| info.bus_id == bus_id)
        }

        fn lookup_by_bus_suffix(
            &self,
            suffix: &str,
        ) -> Result<PciDeviceInfo, Report<HardwareError>> {
            self.devices
                .lock()
                .unwrap()
                .get(suffix)
                .cloned()
                .ok_or_else(|| {
                    Report::new(HardwareError::PciNotFound {
                        bus_id: suffix.to_string(),
                    })
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn resolves_minor_through_the_vendor_directory() {
        let root = tempfile::tempdir().unwrap();
        let device = root.path().join("0000:00:21:12.0");
        fs::create_dir_all(device.join("enflame/gcu0")).unwrap();
        fs::write(device.join("enflame/gcu0/dev"), "238:0\n").unwrap();

        let pci = SysfsPci::with_root(root.path());
        let info = pci.lookup_by_bus_suffix("21:12.0").unwrap();
        assert_eq!(info.minor, "0");
        assert_eq!(info.major, "238");
        assert_eq!(info.bus_id, "0000:00:21:12.0");
        assert!(pci.device_present("0000:00:21:12.0"));
        assert!(!pci.device_present("0000:00:ff:00.0"));
    }

    #[test]
    fn missing_vendor_directory_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("0000:00:21:12.0")).unwrap();

        let pci = SysfsPci::with_root(root.path());
        assert!(pci.lookup_by_bus_suffix("21:12.0").is_err());
    }

    #[test]
    fn unknown_suffix_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let pci = SysfsPci::with_root(root.path());
        assert!(pci.lookup_by_bus_suffix("99:00.0").is_err());
    }
}
