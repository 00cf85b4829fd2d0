//! Per-card liveness tracking. A card is healthy while its PCI directory
//! exists. The watcher reports slice state *transitions* over a channel; the
//! endpoint owns the flip and the lockout policy.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::hardware::Pci;
use crate::inventory::card_of;
use crate::inventory::SharedInventory;

/// Disables the health loop entirely when it contains [`ALL_HEALTH_CHECKS`];
/// health is then frozen at PASS and no lockout can occur.
pub const ENV_DISABLE_HEALTH_CHECKS: &str = "DP_DISABLE_HEALTHCHECKS";
pub const ALL_HEALTH_CHECKS: &str = "all";

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// The authoritative health state of every fake device, shared between the
/// health watcher and the plugin endpoint.
pub struct DeviceStates {
    states: Mutex<BTreeMap<String, bool>>,
}

impl DeviceStates {
    pub fn new(initial: BTreeMap<String, bool>) -> Self {
        Self {
            states: Mutex::new(initial),
        }
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.states.lock().unwrap().get(id).copied().unwrap_or(false)
    }

    /// Flips one slice; returns the new state.
    pub fn toggle(&self, id: &str) -> bool {
        let mut states = self.states.lock().unwrap();
        let state = states.entry(id.to_string()).or_insert(false);
        *state = !*state;
        *state
    }

    pub fn set(&self, id: &str, healthy: bool) {
        self.states.lock().unwrap().insert(id.to_string(), healthy);
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.states.lock().unwrap().clone()
    }

    /// Healthy slice count per card minor.
    pub fn healthy_count_by_card(&self) -> BTreeMap<String, i64> {
        let mut counts = BTreeMap::new();
        for (id, healthy) in self.states.lock().unwrap().iter() {
            if *healthy {
                *counts.entry(card_of(id).to_string()).or_default() += 1;
            }
        }
        counts
    }

    /// Slice ids of one card, in id order.
    pub fn ids_of_card(&self, minor: &str) -> Vec<String> {
        self.states
            .lock()
            .unwrap()
            .keys()
            .filter(|id| card_of(id) == minor)
            .cloned()
            .collect()
    }
}

/// Slice ids whose state must toggle given PCI presence and the lockout set.
/// Pure so the policy is testable without a filesystem.
pub fn desired_transitions(
    inventory: &SharedInventory,
    device_present: impl Fn(&str) -> bool,
    states: &DeviceStates,
    locked: &BTreeSet<String>,
) -> Vec<String> {
    let mut batch = Vec::new();
    for card in inventory.cards.values() {
        let pass = device_present(&card.bus_id);
        let desired = pass && !locked.contains(&card.minor);
        for id in states.ids_of_card(&card.minor) {
            if states.is_healthy(&id) != desired {
                if desired {
                    info!(device = %id, "health check recover, the device will go healthy");
                } else {
                    info!(device = %id, "health check error, the device will go unhealthy");
                }
                batch.push(id);
            }
        }
    }
    batch
}

/// The 5-second health loop.
pub struct HealthWatcher {
    inventory: SharedInventory,
    pci: Arc<dyn Pci>,
    states: Arc<DeviceStates>,
    unhealthy_tx: mpsc::Sender<Vec<String>>,
    all_locked_rx: mpsc::Receiver<BTreeSet<String>>,
}

impl HealthWatcher {
    pub fn new(
        inventory: SharedInventory,
        pci: Arc<dyn Pci>,
        states: Arc<DeviceStates>,
        unhealthy_tx: mpsc::Sender<Vec<String>>,
        all_locked_rx: mpsc::Receiver<BTreeSet<String>>,
    ) -> Self {
        Self {
            inventory,
            pci,
            states,
            unhealthy_tx,
            all_locked_rx,
        }
    }

    pub async fn run(mut self, cancellation_token: CancellationToken) {
        let disabled = std::env::var(ENV_DISABLE_HEALTH_CHECKS)
            .map(|v| v.to_lowercase().contains(ALL_HEALTH_CHECKS))
            .unwrap_or(false);
        if disabled {
            warn!(
                env = ENV_DISABLE_HEALTH_CHECKS,
                "health checks disabled; device health frozen at PASS"
            );
            return;
        }

        let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("health watcher shutdown requested");
                    return;
                }
                _ = interval.tick() => {}
            }

            // Locked cards only stay silenced while the endpoint keeps
            // re-signalling them; the set is rebuilt every tick.
            let mut locked = BTreeSet::new();
            while let Ok(set) = self.all_locked_rx.try_recv() {
                warn!(cards = ?set, "devices locked: all slices of a disabled card are in use");
                locked = set;
            }

            let batch = desired_transitions(
                &self.inventory,
                |bus_id| self.pci.device_present(bus_id),
                &self.states,
                &locked,
            );
            if !batch.is_empty() && self.unhealthy_tx.send(batch).await.is_err() {
                warn!("health channel closed, stopping health watcher");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::testutil::inventory;

    fn states_for(inventory: &crate::inventory::Inventory) -> DeviceStates {
        DeviceStates::new(inventory.fake_devices().1)
    }

    #[test]
    fn healthy_cards_produce_no_transitions() {
        let inventory = Arc::new(inventory(&["0", "1"], 6));
        let states = states_for(&inventory);
        let batch = desired_transitions(&inventory, |_| true, &states, &BTreeSet::new());
        assert!(batch.is_empty());
    }

    #[test]
    fn pci_disappearance_flips_every_slice_of_the_card() {
        let inventory = Arc::new(inventory(&["0", "1"], 6));
        let states = states_for(&inventory);
        let gone = inventory.cards["0"].bus_id.clone();
        let batch = desired_transitions(&inventory, |bus| bus != gone, &states, &BTreeSet::new());
        assert_eq!(batch.len(), 6);
        assert!(batch.iter().all(|id| card_of(id) == "0"));
    }

    #[test]
    fn recovery_reports_the_same_slices_again() {
        let inventory = Arc::new(inventory(&["0"], 6));
        let states = states_for(&inventory);
        for id in states.ids_of_card("0") {
            states.set(&id, false);
        }
        let batch = desired_transitions(&inventory, |_| true, &states, &BTreeSet::new());
        assert_eq!(batch.len(), 6);
    }

    #[test]
    fn locked_cards_stay_silenced_even_when_present() {
        let inventory = Arc::new(inventory(&["0"], 6));
        let states = states_for(&inventory);
        let locked = BTreeSet::from(["0".to_string()]);
        let batch = desired_transitions(&inventory, |_| true, &states, &locked);
        assert_eq!(batch.len(), 6);
    }

    #[test]
    fn healthy_counts_follow_toggles() {
        let inventory = Arc::new(inventory(&["0", "1"], 6));
        let states = states_for(&inventory);
        assert_eq!(states.healthy_count_by_card().get("0"), Some(&6));
        states.toggle("0-0");
        states.toggle("0-1");
        assert_eq!(states.healthy_count_by_card().get("0"), Some(&4));
        assert_eq!(states.healthy_count_by_card().get("1"), Some(&6));
    }
}
