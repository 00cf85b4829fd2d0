//! The hardware boundary: a typed interface over the vendor CLI (`efsmi`)
//! and the PCI sysfs tree. Everything above this module talks to capability
//! traits so the allocation logic is testable without a card.

pub mod drs;
pub mod pci;

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::OnceLock;

use error_stack::Report;
use gcushare_common::config::BUS_ID_REGEXP;
use gcushare_common::config::PROFILE_NAME_REGEXP;
use regex::Regex;
use tracing::info;
use tracing::warn;

pub use pci::{Pci, PciDeviceInfo, SysfsPci};

/// SIP cores per card. Not reported by `efsmi`; fixed per product family.
pub const SIP_PER_CARD: i64 = 24;
/// L2 memory per card in MB. Not reported by `efsmi`.
pub const L2_MEMORY_MB: i64 = 64;

/// Card virtualization states reported in the CLI table.
pub const VIRT_DRS: &str = "DRS";
pub const VIRT_DISABLE: &str = "Disable";

#[derive(Debug, thiserror::Error)]
pub enum HardwareError {
    #[error("hardware CLI failed: `{command}`: {message}")]
    CliFailed { command: String, message: String },
    #[error("malformed hardware CLI output: {message}")]
    ParseFailed { message: String },
    #[error("pci device not found for bus id: {bus_id}")]
    PciNotFound { bus_id: String },
    #[error("no device is in DRS state or can enable DRS")]
    NoDrsCapableDevice,
    #[error("created instance not found on device {index} for profile {profile_name}")]
    InstanceNotFound { index: String, profile_name: String },
}

/// One device row of the CLI report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmiDeviceInfo {
    /// CLI enumeration index, used to address every other CLI command.
    pub index: String,
    pub product: String,
    /// Trailing segment of the PCI bus address, e.g. `21:12.0`.
    pub bus_id: String,
    /// Total L3 memory in MB.
    pub l3_memory_mb: i64,
    /// `Disable`, `DRS`, or a vendor-specific virtualization mode.
    pub virt: String,
}

/// One row of the DRS profile table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSpec {
    pub profile_id: String,
    pub instance_count: i64,
    pub memory: String,
    pub sip: String,
}

/// One live DRS instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub index: String,
    pub profile_name: String,
    pub instance_id: String,
    pub uuid: String,
}

/// Typed view of the vendor CLI. The production implementation shells out to
/// `efsmi`; tests substitute a fake.
pub trait HardwareCli: Send + Sync {
    fn device_report(&self) -> Result<Vec<SmiDeviceInfo>, Report<HardwareError>>;
    fn list_profiles(
        &self,
        index: &str,
    ) -> Result<BTreeMap<String, ProfileSpec>, Report<HardwareError>>;
    fn list_instances(&self, index: &str) -> Result<Vec<Instance>, Report<HardwareError>>;
    fn open_drs(&self, index: &str) -> Result<(), Report<HardwareError>>;
    fn close_drs(&self, index: &str) -> Result<(), Report<HardwareError>>;
    fn create_instance(&self, index: &str, profile_id: &str) -> Result<(), Report<HardwareError>>;
    /// Deleting an absent instance is not an error.
    fn destroy_instance(
        &self,
        index: &str,
        instance_id: &str,
    ) -> Result<(), Report<HardwareError>>;
}

fn bus_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(BUS_ID_REGEXP).expect("bus id regex"))
}

fn profile_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(PROFILE_NAME_REGEXP).expect("profile name regex"))
}

/// `efsmi`-backed implementation.
#[derive(Debug, Default)]
pub struct EfsmiCli;

impl EfsmiCli {
    fn exec(&self, command: &str) -> Result<String, Report<HardwareError>> {
        let output = Command::new("sh").arg("-c").arg(command).output().map_err(|e| {
            Report::new(HardwareError::CliFailed {
                command: command.to_string(),
                message: e.to_string(),
            })
        })?;
        if !output.status.success() {
            return Err(Report::new(HardwareError::CliFailed {
                command: command.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn indexed(command: &str, index: &str) -> String {
        if index.is_empty() {
            format!("efsmi {command}")
        } else {
            format!("efsmi -i {index} {command}")
        }
    }
}

impl HardwareCli for EfsmiCli {
    fn device_report(&self) -> Result<Vec<SmiDeviceInfo>, Report<HardwareError>> {
        let output = self.exec("efsmi")?;
        parse_device_report(&output)
    }

    fn list_profiles(
        &self,
        index: &str,
    ) -> Result<BTreeMap<String, ProfileSpec>, Report<HardwareError>> {
        let output = self.exec(&Self::indexed("--drs --list-profile", index))?;
        parse_profile_table(&output)
    }

    fn list_instances(&self, index: &str) -> Result<Vec<Instance>, Report<HardwareError>> {
        let output = self.exec(&Self::indexed("-L", index))?;
        parse_instance_table(&output)
    }

    fn open_drs(&self, index: &str) -> Result<(), Report<HardwareError>> {
        self.exec(&Self::indexed("--drs on", index)).map(|_| ())
    }

    fn close_drs(&self, index: &str) -> Result<(), Report<HardwareError>> {
        self.exec(&Self::indexed("--drs off", index)).map(|_| ())
    }

    fn create_instance(&self, index: &str, profile_id: &str) -> Result<(), Report<HardwareError>> {
        self.exec(&Self::indexed(
            &format!("--drs --create-instance {profile_id}"),
            index,
        ))
        .map(|_| ())
    }

    fn destroy_instance(
        &self,
        index: &str,
        instance_id: &str,
    ) -> Result<(), Report<HardwareError>> {
        let exists = self
            .list_instances(index)?
            .iter()
            .any(|instance| instance.instance_id == instance_id);
        if !exists {
            warn!(index, instance_id, "instance not found, need not to delete");
            return Ok(());
        }
        self.exec(&Self::indexed(
            &format!("--drs --destroy-instance {instance_id}"),
            index,
        ))
        .map(|_| ())
    }
}

/// Strips border decoration from the CLI report, keeping table rows only.
fn report_rows(output: &str) -> Vec<&str> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.contains('-'))
        .collect()
}

/// Parses the two-line-per-device CLI report. The first row of a pair holds
/// `| <index> <product...> | ... | <busId> ... |`; the second holds the
/// runtime columns where, after dropping `|` and `/`, field 4 is the total
/// memory and field 5 the virtualization state.
pub fn parse_device_report(output: &str) -> Result<Vec<SmiDeviceInfo>, Report<HardwareError>> {
    let rows = report_rows(output);
    let mut devices = Vec::new();
    let mut i = 0;
    while i + 1 < rows.len() {
        let row = rows[i];
        if !bus_id_pattern().is_match(row) {
            i += 1;
            continue;
        }
        let row = row.trim_matches('|');
        let columns: Vec<&str> = row.split('|').collect();
        if columns.len() < 3 {
            return Err(Report::new(HardwareError::ParseFailed {
                message: format!("device row has {} columns: {row}", columns.len()),
            }));
        }
        let head: Vec<&str> = columns[0].split_whitespace().collect();
        let bus: Vec<&str> = columns[2].split_whitespace().collect();
        let (Some(index), Some(bus_id)) = (head.first(), bus.first()) else {
            return Err(Report::new(HardwareError::ParseFailed {
                message: format!("device row missing index or bus id: {row}"),
            }));
        };

        let detail = rows[i + 1].replace('|', " ").replace('/', " ");
        let fields: Vec<&str> = detail.split_whitespace().collect();
        if fields.len() < 6 {
            return Err(Report::new(HardwareError::ParseFailed {
                message: format!("device detail row has {} fields: {detail}", fields.len()),
            }));
        }
        let memory_digits: String = fields[4].chars().filter(char::is_ascii_digit).collect();
        let l3_memory_mb = memory_digits.parse::<i64>().map_err(|_| {
            Report::new(HardwareError::ParseFailed {
                message: format!("total memory is not numeric: {}", fields[4]),
            })
        })?;

        devices.push(SmiDeviceInfo {
            index: (*index).to_string(),
            product: head[1..].concat(),
            bus_id: (*bus_id).to_string(),
            l3_memory_mb,
            virt: fields[5].to_string(),
        });
        i += 2;
    }
    info!(count = devices.len(), "parsed device report");
    Ok(devices)
}

/// Parses `efsmi --drs --list-profile` output. Rows are matched by the
/// profile-name pattern; columns are `| <idx> <name> <id> <count> <mem> <sip> |`.
pub fn parse_profile_table(
    output: &str,
) -> Result<BTreeMap<String, ProfileSpec>, Report<HardwareError>> {
    let mut profiles = BTreeMap::new();
    for line in output.lines().map(str::trim) {
        if !profile_name_pattern().is_match(line) {
            continue;
        }
        let fields: Vec<&str> = line.trim_matches('|').split_whitespace().collect();
        if fields.len() < 6 {
            return Err(Report::new(HardwareError::ParseFailed {
                message: format!("profile row has {} fields: {line}", fields.len()),
            }));
        }
        let instance_count = fields[3].parse::<i64>().map_err(|_| {
            Report::new(HardwareError::ParseFailed {
                message: format!(
                    "instance count is not numeric for profile {}: {}",
                    fields[1], fields[3]
                ),
            })
        })?;
        profiles.insert(
            fields[1].to_string(),
            ProfileSpec {
                profile_id: fields[2].to_string(),
                instance_count,
                memory: fields[4].to_string(),
                sip: fields[5].to_string(),
            },
        );
    }
    Ok(profiles)
}

/// Parses `efsmi -L` output: `| <index> <profileName> <instanceId> <uuid> |`.
pub fn parse_instance_table(output: &str) -> Result<Vec<Instance>, Report<HardwareError>> {
    let mut instances = Vec::new();
    for line in output.lines().map(str::trim) {
        if !profile_name_pattern().is_match(line) {
            continue;
        }
        let fields: Vec<&str> = line.trim_matches('|').split_whitespace().collect();
        if fields.len() < 4 {
            return Err(Report::new(HardwareError::ParseFailed {
                message: format!("instance row has {} fields: {line}", fields.len()),
            }));
        }
        instances.push(Instance {
            index: fields[0].to_string(),
            profile_name: fields[1].to_string(),
            instance_id: fields[2].to_string(),
            uuid: fields[3].to_string(),
        });
    }
    Ok(instances)
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;

    /// Scriptable in-memory hardware used across the agent tests.
    #[derive(Default)]
    pub struct FakeHardware {
        pub state: Mutex<FakeState>,
    }

    #[derive(Default)]
    pub struct FakeState {
        pub devices: Vec<SmiDeviceInfo>,
        pub profiles: BTreeMap<String, ProfileSpec>,
        pub instances: Vec<Instance>,
        pub next_instance_id: u32,
        pub open_calls: Vec<String>,
        pub close_calls: Vec<String>,
    }

    impl FakeHardware {
        pub fn with_devices(devices: Vec<SmiDeviceInfo>) -> Self {
            let fake = Self::default();
            fake.state.lock().unwrap().devices = devices;
            fake
        }
    }

    impl HardwareCli for FakeHardware {
        fn device_report(&self) -> Result<Vec<SmiDeviceInfo>, Report<HardwareError>> {
            Ok(self.state.lock().unwrap().devices.clone())
        }

        fn list_profiles(
            &self,
            _index: &str,
        ) -> Result<BTreeMap<String, ProfileSpec>, Report<HardwareError>> {
            Ok(self.state.lock().unwrap().profiles.clone())
        }

        fn list_instances(&self, index: &str) -> Result<Vec<Instance>, Report<HardwareError>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .instances
                .iter()
                .filter(|i| index.is_empty() || i.index == index)
                .cloned()
                .collect())
        }

        fn open_drs(&self, index: &str) -> Result<(), Report<HardwareError>> {
            let mut state = self.state.lock().unwrap();
            state.open_calls.push(index.to_string());
            if let Some(device) = state.devices.iter_mut().find(|d| d.index == index) {
                device.virt = VIRT_DRS.to_string();
            }
            Ok(())
        }

        fn close_drs(&self, index: &str) -> Result<(), Report<HardwareError>> {
            let mut state = self.state.lock().unwrap();
            state.close_calls.push(index.to_string());
            if let Some(device) = state.devices.iter_mut().find(|d| d.index == index) {
                device.virt = VIRT_DISABLE.to_string();
            }
            Ok(())
        }

        fn create_instance(
            &self,
            index: &str,
            profile_id: &str,
        ) -> Result<(), Report<HardwareError>> {
            let mut state = self.state.lock().unwrap();
            let profile_name = state
                .profiles
                .iter()
                .find(|(_, spec)| spec.profile_id == profile_id)
                .map(|(name, _)| name.clone())
                .unwrap_or_else(|| profile_id.to_string());
            state.next_instance_id += 1;
            let id = state.next_instance_id;
            state.instances.push(Instance {
                index: index.to_string(),
                profile_name,
                instance_id: id.to_string(),
                uuid: format!("uuid-{id}"),
            });
            Ok(())
        }

        fn destroy_instance(
            &self,
            index: &str,
            instance_id: &str,
        ) -> Result<(), Report<HardwareError>> {
            let mut state = self.state.lock().unwrap();
            state
                .instances
                .retain(|i| !(i.index == index && i.instance_id == instance_id));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
+-----------------------------------------------------------------------------+
| 0     T20            | T6R231060602      | 00:21:12.0                       |
| 34C   57W  300W      | 1024MiB / 49152MiB | Disable                         |
+-----------------------------------------------------------------------------+
| 1     T20            | T6R231010702      | 00:22:12.0                       |
| 36C   60W  300W      | 0MiB / 49152MiB   | DRS                              |
+-----------------------------------------------------------------------------+
";

    #[test]
    fn parses_the_two_line_device_report() {
        let devices = parse_device_report(REPORT).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, "0");
        assert_eq!(devices[0].bus_id, "21:12.0");
        assert_eq!(devices[0].l3_memory_mb, 49152);
        assert_eq!(devices[0].virt, "Disable");
        assert_eq!(devices[1].virt, "DRS");
    }

    #[test]
    fn device_report_rejects_short_detail_rows() {
        let truncated = "\
| 0     T20            | T6R231060602      | 00:21:12.0 |
| 34C   57W |
";
        assert!(parse_device_report(truncated).is_err());
    }

    #[test]
    fn parses_the_profile_table() {
        let output = "\
+------------------------------------------------------------+
| 0   1g.8gb    id1   6   8gb    4                           |
| 0   3g.24gb   id3   2   24gb   12                          |
| 0   6g.48gb   id6   1   48gb   24                          |
+------------------------------------------------------------+
";
        let profiles = parse_profile_table(output).unwrap();
        assert_eq!(profiles.len(), 3);
        assert_eq!(profiles["1g.8gb"].profile_id, "id1");
        assert_eq!(profiles["1g.8gb"].instance_count, 6);
        assert_eq!(profiles["6g.48gb"].instance_count, 1);
    }

    #[test]
    fn parses_the_instance_table() {
        let output = "\
| 0   1g.8gb    3   DRS-aaaa-bbbb |
| 0   3g.24gb   4   DRS-cccc-dddd |
";
        let instances = parse_instance_table(output).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].instance_id, "3");
        assert_eq!(instances[1].uuid, "DRS-cccc-dddd");
    }

    #[test]
    fn non_matching_lines_are_skipped() {
        assert!(parse_instance_table("no instances found\n").unwrap().is_empty());
        assert!(parse_profile_table("header only\n").unwrap().is_empty());
    }
}
