//! Device inventory: enumerates the physical cards once at startup and
//! derives the virtual slice ("fake device") identifiers advertised to the
//! kubelet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use gcushare_common::ResourceConfig;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::RECOMMENDED_MAX_SLICE_COUNT;
use crate::hardware::HardwareCli;
use crate::hardware::HardwareError;
use crate::hardware::Pci;
use crate::hardware::SmiDeviceInfo;
use crate::hardware::L2_MEMORY_MB;
use crate::hardware::SIP_PER_CARD;

const ENUMERATE_RETRIES: usize = 5;
const ENUMERATE_BACKOFF: Duration = Duration::from_secs(1);

/// One physical card. Populated at startup, immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Card {
    /// Stable per-node device id, primary key in every accounting map.
    pub minor: String,
    /// Vendor CLI enumeration index, used to address `efsmi`.
    pub index: String,
    /// Full PCI bus address.
    pub bus_id: String,
    /// Device node handed to containers, e.g. `/dev/gcu0`.
    pub device_node_path: String,
    pub sip_count: i64,
    pub l2_memory_mb: i64,
    pub l3_memory_gb: i64,
}

/// The set of cards on this node plus the configured slice count.
#[derive(Debug, Clone)]
pub struct Inventory {
    pub slice_count: i64,
    /// Cards keyed by minor.
    pub cards: BTreeMap<String, Card>,
}

impl Inventory {
    /// Runs the hardware CLI (with bounded retries) and joins every reported
    /// card with its PCI sysfs entry. Any join or parse failure is fatal: a
    /// node that cannot enumerate its cards must not advertise capacity.
    pub async fn enumerate(
        cli: &dyn HardwareCli,
        pci: &dyn Pci,
        config: &ResourceConfig,
        slice_count: i64,
        resource_isolation: bool,
    ) -> Result<Self, Report<HardwareError>> {
        let devices = Self::device_report_with_retry(cli).await?;
        info!(
            device_type = config.device_type(),
            count = devices.len(),
            "found devices from hardware CLI"
        );

        let mut cards = BTreeMap::new();
        for device in &devices {
            let pci_info = pci.lookup_by_bus_suffix(&device.bus_id)?;
            let l3_memory_gb = device.l3_memory_mb / 1024;
            let card = Card {
                minor: pci_info.minor.clone(),
                index: device.index.clone(),
                bus_id: pci_info.bus_id.clone(),
                device_node_path: config.device_node_path(&pci_info.minor),
                sip_count: SIP_PER_CARD,
                l2_memory_mb: L2_MEMORY_MB,
                l3_memory_gb,
            };
            info!(
                minor = %card.minor,
                index = %card.index,
                bus_id = %card.bus_id,
                path = %card.device_node_path,
                memory_gb = card.l3_memory_gb,
                sip = card.sip_count,
                "found device"
            );
            cards.insert(card.minor.clone(), card);
        }

        let inventory = Self { slice_count, cards };
        inventory.validate_slice_count(resource_isolation)?;
        Ok(inventory)
    }

    async fn device_report_with_retry(
        cli: &dyn HardwareCli,
    ) -> Result<Vec<SmiDeviceInfo>, Report<HardwareError>> {
        let mut last_err = None;
        for attempt in 0..ENUMERATE_RETRIES {
            match cli.device_report() {
                Ok(devices) => return Ok(devices),
                Err(e) => {
                    warn!(attempt, error = ?e, "hardware CLI report failed, retrying");
                    last_err = Some(e);
                    tokio::time::sleep(ENUMERATE_BACKOFF).await;
                }
            }
        }
        Err(last_err.expect("retry loop ran at least once"))
    }

    /// In isolation mode the per-slice share of every resource must be at
    /// least one unit, so the slice count may not exceed a card's SIP count
    /// or its memory in GB.
    fn validate_slice_count(&self, resource_isolation: bool) -> Result<(), Report<HardwareError>> {
        if resource_isolation {
            for card in self.cards.values() {
                let ceiling = card.sip_count.min(card.l3_memory_gb);
                if self.slice_count > ceiling {
                    let message = format!(
                        "sliceCount: {} should not be greater than device sip: {} and memory: {}GB (minor: {})",
                        self.slice_count, card.sip_count, card.l3_memory_gb, card.minor
                    );
                    error!("{message}");
                    return Err(Report::new(HardwareError::ParseFailed { message }));
                }
            }
        }
        if self.slice_count > RECOMMENDED_MAX_SLICE_COUNT {
            warn!(
                slice_count = self.slice_count,
                recommended = RECOMMENDED_MAX_SLICE_COUNT,
                "slice count above the recommended maximum may generate device fragments"
            );
        }
        Ok(())
    }

    pub fn card_count(&self) -> i64 {
        self.cards.len() as i64
    }

    /// The Cartesian product card × slice index, each initially healthy.
    /// Returns the ordered id list and the id → health map used to dedupe
    /// ListAndWatch sends.
    pub fn fake_devices(&self) -> (Vec<String>, BTreeMap<String, bool>) {
        let mut ids = Vec::with_capacity(self.cards.len() * self.slice_count as usize);
        let mut health = BTreeMap::new();
        for minor in self.cards.keys() {
            for slice_index in 0..self.slice_count {
                let fake_id = fake_device_id(minor, slice_index);
                if slice_index == 0 {
                    info!(minor = %minor, id = %fake_id, "first fake device id for card");
                }
                if slice_index == self.slice_count - 1 {
                    info!(minor = %minor, id = %fake_id, "last fake device id for card");
                }
                health.insert(fake_id.clone(), true);
                ids.push(fake_id);
            }
        }
        info!(count = ids.len(), "generated fake devices");
        (ids, health)
    }
}

/// Slice identity: `<card minor>-<slice index>`.
pub fn fake_device_id(minor: &str, slice_index: i64) -> String {
    format!("{minor}-{slice_index}")
}

/// The card minor a fake device id belongs to.
pub fn card_of(fake_id: &str) -> &str {
    fake_id.split('-').next().unwrap_or(fake_id)
}

/// Shared handle used by the endpoint, health watcher and coordination
/// handlers.
pub type SharedInventory = Arc<Inventory>;

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub fn card(minor: &str, index: &str) -> Card {
        Card {
            minor: minor.to_string(),
            index: index.to_string(),
            bus_id: format!("0000:2{index}:12.0"),
            device_node_path: format!("/dev/gcu{minor}"),
            sip_count: 24,
            l2_memory_mb: 64,
            l3_memory_gb: 48,
        }
    }

    pub fn inventory(minors: &[&str], slice_count: i64) -> Inventory {
        let cards = minors
            .iter()
            .enumerate()
            .map(|(i, minor)| (minor.to_string(), card(minor, &i.to_string())))
            .collect();
        Inventory { slice_count, cards }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::inventory;
    use super::*;
    use crate::hardware::fake::FakeHardware;
    use crate::hardware::pci::fake::FakePci;

    fn smi_device(index: &str, bus_suffix: &str) -> SmiDeviceInfo {
        SmiDeviceInfo {
            index: index.to_string(),
            product: "T20".to_string(),
            bus_id: bus_suffix.to_string(),
            l3_memory_mb: 49152,
            virt: "Disable".to_string(),
        }
    }

    #[tokio::test]
    async fn enumerate_joins_cli_and_pci() {
        let cli = FakeHardware::with_devices(vec![
            smi_device("0", "21:12.0"),
            smi_device("1", "22:12.0"),
        ]);
        let pci = FakePci::default();
        pci.insert("21:12.0", "0");
        pci.insert("22:12.0", "1");

        let inventory =
            Inventory::enumerate(&cli, &pci, &ResourceConfig::default(), 6, true)
                .await
                .unwrap();
        assert_eq!(inventory.card_count(), 2);
        let card = &inventory.cards["0"];
        assert_eq!(card.index, "0");
        assert_eq!(card.l3_memory_gb, 48);
        assert_eq!(card.device_node_path, "/dev/gcu0");
    }

    #[tokio::test]
    async fn enumerate_fails_when_pci_entry_is_missing() {
        let cli = FakeHardware::with_devices(vec![smi_device("0", "21:12.0")]);
        let pci = FakePci::default();
        let result = Inventory::enumerate(&cli, &pci, &ResourceConfig::default(), 6, true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn slice_count_above_card_resources_is_fatal_in_isolation_mode() {
        let cli = FakeHardware::with_devices(vec![smi_device("0", "21:12.0")]);
        let pci = FakePci::default();
        pci.insert("21:12.0", "0");

        // 48GB and 24 SIPs: 30 slices exceed min(24, 48).
        let result = Inventory::enumerate(&cli, &pci, &ResourceConfig::default(), 30, true).await;
        assert!(result.is_err());

        // The same count passes with isolation off.
        let result = Inventory::enumerate(&cli, &pci, &ResourceConfig::default(), 30, false).await;
        assert!(result.is_ok());
    }

    #[test]
    fn fake_devices_cover_every_card_and_slice() {
        let inventory = inventory(&["0", "1"], 6);
        let (ids, health) = inventory.fake_devices();
        assert_eq!(ids.len(), 12);
        assert_eq!(health.len(), 12);
        assert!(ids.contains(&"0-0".to_string()));
        assert!(ids.contains(&"1-5".to_string()));
        assert!(health.values().all(|healthy| *healthy));
    }

    #[test]
    fn fake_id_round_trips_to_its_card() {
        assert_eq!(fake_device_id("3", 2), "3-2");
        assert_eq!(card_of("3-2"), "3");
        assert_eq!(card_of("12-0"), "12");
    }
}
