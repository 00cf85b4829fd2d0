//! DRS lifecycle operations built on the CLI interface: instance creation
//! with list-diff discovery, the profile-template bootstrap scan, and
//! per-card availability accounting.

use std::collections::BTreeMap;
use std::collections::HashSet;

use error_stack::Report;
use gcushare_common::capacity::profile_prefix;
use gcushare_common::capacity::profile_weight;
use tracing::info;
use tracing::warn;

use super::HardwareCli;
use super::HardwareError;
use super::ProfileSpec;
use super::SmiDeviceInfo;
use super::VIRT_DISABLE;
use super::VIRT_DRS;

/// Availability of one profile on one card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableInstance {
    pub profile_name: String,
    pub profile_id: String,
    pub available_count: i64,
}

/// Creates a DRS instance and discovers its id and uuid by diffing the
/// instance list before and after creation; the CLI does not report the new
/// id directly.
pub fn create_drs_instance(
    cli: &dyn HardwareCli,
    index: &str,
    profile_name: &str,
    profile_id: &str,
) -> Result<(String, String), Report<HardwareError>> {
    cli.open_drs(index)?;
    info!(index, "device DRS opened");

    let before: HashSet<String> = cli
        .list_instances(index)?
        .into_iter()
        .filter(|i| i.profile_name == profile_name)
        .map(|i| i.uuid)
        .collect();

    cli.create_instance(index, profile_id)?;
    info!(index, profile_name, "created drs instance");

    for instance in cli.list_instances(index)? {
        if instance.profile_name == profile_name && !before.contains(&instance.uuid) {
            info!(
                index,
                profile_name,
                uuid = %instance.uuid,
                "allocated drs instance to container"
            );
            return Ok((instance.instance_id, instance.uuid));
        }
    }
    Err(Report::new(HardwareError::InstanceNotFound {
        index: index.to_string(),
        profile_name: profile_name.to_string(),
    }))
}

/// Reads the profile table. Prefers a card already in DRS mode; otherwise
/// opens DRS on a `Disable` card and closes it again once the table is read.
/// The table is assumed uniform across the node's cards.
pub fn profile_template(
    cli: &dyn HardwareCli,
    devices: &[SmiDeviceInfo],
) -> Result<BTreeMap<String, ProfileSpec>, Report<HardwareError>> {
    if let Some(device) = devices.iter().find(|d| d.virt == VIRT_DRS) {
        info!(index = %device.index, "reading profile table from device in DRS state");
        return cli.list_profiles(&device.index);
    }

    for device in devices.iter().filter(|d| d.virt == VIRT_DISABLE) {
        if let Err(e) = cli.open_drs(&device.index) {
            warn!(index = %device.index, error = ?e, "open drs failed, skip device");
            continue;
        }
        let profiles = cli.list_profiles(&device.index);
        if let Err(e) = cli.close_drs(&device.index) {
            warn!(index = %device.index, error = ?e, "close drs after profile scan failed");
        }
        return profiles;
    }
    Err(Report::new(HardwareError::NoDrsCapableDevice))
}

/// Remaining capacity of one card: the total remaining slice weight, and per
/// profile prefix (`1g`, `3g`, ...) the remaining instance count.
pub fn available_instances(
    cli: &dyn HardwareCli,
    index: &str,
    virt: &str,
    slice_count: i64,
    profiles: &BTreeMap<String, ProfileSpec>,
) -> Result<(i64, BTreeMap<String, AvailableInstance>), Report<HardwareError>> {
    let mut used_per_profile: BTreeMap<&str, i64> = BTreeMap::new();
    let mut used_weight = 0;
    // A Disable card holds no instances; listing requires DRS mode.
    if virt == VIRT_DRS {
        for instance in cli.list_instances(index)? {
            if let Some((name, _)) = profiles.get_key_value(instance.profile_name.as_str()) {
                *used_per_profile.entry(name).or_default() += 1;
            }
            used_weight += profile_weight(&instance.profile_name).unwrap_or_default();
        }
    }

    let mut available = BTreeMap::new();
    for (name, spec) in profiles {
        let Some(prefix) = profile_prefix(name) else {
            continue;
        };
        let used = used_per_profile.get(name.as_str()).copied().unwrap_or(0);
        available.insert(
            prefix,
            AvailableInstance {
                profile_name: name.clone(),
                profile_id: spec.profile_id.clone(),
                available_count: spec.instance_count - used,
            },
        );
    }
    Ok((slice_count - used_weight, available))
}

#[cfg(test)]
mod tests {
    use super::super::fake::FakeHardware;
    use super::super::Instance;
    use super::*;

    fn profiles() -> BTreeMap<String, ProfileSpec> {
        BTreeMap::from([
            (
                "1g.8gb".to_string(),
                ProfileSpec {
                    profile_id: "id1".to_string(),
                    instance_count: 6,
                    memory: "8gb".to_string(),
                    sip: "4".to_string(),
                },
            ),
            (
                "3g.24gb".to_string(),
                ProfileSpec {
                    profile_id: "id3".to_string(),
                    instance_count: 2,
                    memory: "24gb".to_string(),
                    sip: "12".to_string(),
                },
            ),
        ])
    }

    fn device(index: &str, virt: &str) -> SmiDeviceInfo {
        SmiDeviceInfo {
            index: index.to_string(),
            product: "T20".to_string(),
            bus_id: format!("2{index}:12.0"),
            l3_memory_mb: 49152,
            virt: virt.to_string(),
        }
    }

    #[test]
    fn create_discovers_the_new_instance_by_diff() {
        let cli = FakeHardware::with_devices(vec![device("0", "Disable")]);
        cli.state.lock().unwrap().profiles = profiles();
        cli.state.lock().unwrap().instances.push(Instance {
            index: "0".to_string(),
            profile_name: "1g.8gb".to_string(),
            instance_id: "0".to_string(),
            uuid: "uuid-preexisting".to_string(),
        });

        let (id, uuid) = create_drs_instance(&cli, "0", "1g.8gb", "id1").unwrap();
        assert_eq!(id, "1");
        assert_eq!(uuid, "uuid-1");
    }

    #[test]
    fn profile_scan_opens_and_closes_a_disabled_card() {
        let cli = FakeHardware::with_devices(vec![device("0", "Disable")]);
        cli.state.lock().unwrap().profiles = profiles();

        let devices = cli.device_report().unwrap();
        let table = profile_template(&cli, &devices).unwrap();
        assert_eq!(table.len(), 2);

        let state = cli.state.lock().unwrap();
        assert_eq!(state.open_calls, vec!["0"]);
        assert_eq!(state.close_calls, vec!["0"]);
    }

    #[test]
    fn profile_scan_prefers_a_card_already_in_drs() {
        let cli = FakeHardware::with_devices(vec![device("0", "DRS")]);
        cli.state.lock().unwrap().profiles = profiles();

        let devices = cli.device_report().unwrap();
        profile_template(&cli, &devices).unwrap();
        assert!(cli.state.lock().unwrap().open_calls.is_empty());
        assert!(cli.state.lock().unwrap().close_calls.is_empty());
    }

    #[test]
    fn profile_scan_fails_without_candidates() {
        let cli = FakeHardware::with_devices(vec![device("0", "Shared")]);
        let devices = cli.device_report().unwrap();
        assert!(profile_template(&cli, &devices).is_err());
    }

    #[test]
    fn availability_subtracts_live_instances_by_weight() {
        let cli = FakeHardware::with_devices(vec![device("0", "DRS")]);
        {
            let mut state = cli.state.lock().unwrap();
            state.profiles = profiles();
            state.instances.push(Instance {
                index: "0".to_string(),
                profile_name: "3g.24gb".to_string(),
                instance_id: "9".to_string(),
                uuid: "uuid-9".to_string(),
            });
        }

        let (all, available) = available_instances(&cli, "0", "DRS", 6, &profiles()).unwrap();
        assert_eq!(all, 3);
        assert_eq!(available["3g"].available_count, 1);
        assert_eq!(available["1g"].available_count, 6);
    }

    #[test]
    fn disabled_card_reports_full_capacity() {
        let cli = FakeHardware::with_devices(vec![device("0", "Disable")]);
        let (all, available) = available_instances(&cli, "0", "Disable", 6, &profiles()).unwrap();
        assert_eq!(all, 6);
        assert_eq!(available["1g"].available_count, 6);
    }
}
