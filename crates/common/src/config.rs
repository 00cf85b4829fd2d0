//! Resource-name configuration.
//!
//! Every cluster-visible name this system uses is derived from a
//! `<domain>/<device-type>` pair so that several device types can coexist in
//! one cluster. The derived keys live on the config value; nothing here is
//! process-global.

use serde::Deserialize;
use serde::Serialize;

/// Default domain used when none is configured.
pub const DEFAULT_DOMAIN: &str = "enflame.com";
/// Default device type used when none is configured.
pub const DEFAULT_DEVICE_TYPE: &str = "gcu";

/// Annotation key for the per-container allocation records. Not
/// domain-prefixed; both components read and write it verbatim.
pub const ASSIGNED_CONTAINERS: &str = "assigned-containers";
/// Annotation key recording the device a DRS pod occupies.
pub const DRS_ASSIGNED_DEVICE: &str = "drs-assigned-device";

/// Label selecting the node a coordination configmap addresses.
pub const CONFIGMAP_NODE_LABEL: &str = "node-name";
/// Label naming the coordination configmap owner.
pub const CONFIGMAP_OWNER_LABEL: &str = "owner";
/// Owner value stamped on coordination configmaps.
pub const DRS_SCHEDULER_NAME: &str = "gcushare-scheduler-drs";
/// Data key carrying the serialized scheduler record.
pub const SCHEDULER_RECORD_KEY: &str = "schedulerRecord";

/// Name under which the scheduler plugin registers.
pub const SCHEDULER_PLUGIN_NAME: &str = "GCUShareSchedulerPlugin";

/// PCI sysfs root used for device presence checks.
pub const PCI_DEVICE_PATH: &str = "/sys/bus/pci/devices";

/// Matches a DRS profile name such as `3g.24gb`.
pub const PROFILE_NAME_REGEXP: &str = r"\b\d+g\.\d+gb\b";
/// Matches the bus-id column of the hardware CLI report.
pub const BUS_ID_REGEXP: &str = r"[0-9a-fA-F]{2}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]";

/// Derives resource names, annotation keys and labels from the configured
/// domain and device type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    domain: String,
    device_type: String,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN, DEFAULT_DEVICE_TYPE)
    }
}

impl ResourceConfig {
    pub fn new(domain: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            device_type: device_type.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    /// Resource advertised by the shared lane, e.g. `enflame.com/shared-gcu`.
    pub fn shared_resource_name(&self) -> String {
        format!("{}/shared-{}", self.domain, self.device_type)
    }

    /// Resource advertised by the DRS lane, e.g. `enflame.com/drs-gcu`.
    pub fn drs_resource_name(&self) -> String {
        format!("{}/drs-{}", self.domain, self.device_type)
    }

    /// Resource name of one lane.
    pub fn resource_name(&self, drs: bool) -> String {
        if drs {
            self.drs_resource_name()
        } else {
            self.shared_resource_name()
        }
    }

    /// Physical card count resource, e.g. `enflame.com/gcu-count`.
    pub fn count_resource_name(&self) -> String {
        format!("{}/{}-count", self.domain, self.device_type)
    }

    /// Device node path for a card minor, e.g. `/dev/gcu0`.
    pub fn device_node_path(&self, minor: &str) -> String {
        format!("/dev/{}{}", self.device_type, minor)
    }

    /// Node label marking gcushare-eligible nodes.
    pub fn gcushare_label(&self) -> String {
        format!("{}/gcushare", self.domain)
    }

    /// Optional node label overriding the resource-isolation flag.
    pub fn isolation_label(&self) -> String {
        format!("{}/gcushare-resource-isolation", self.domain)
    }

    /// Node annotation carrying `{minor: capacity}` for the shared lane.
    pub fn shared_capacity_key(&self) -> String {
        format!("{}/{}-shared-capacity", self.domain, self.device_type)
    }

    /// Node annotation carrying `{devices, profiles}` for the DRS lane.
    pub fn drs_capacity_key(&self) -> String {
        format!("{}/{}-drs-capacity", self.domain, self.device_type)
    }

    /// Pod annotation with the requested slice count.
    pub fn request_size_key(&self) -> String {
        format!("{}/{}-request-size", self.domain, self.device_type)
    }

    /// Pod annotation with the selected card minor.
    pub fn assigned_minor_key(&self) -> String {
        format!("{}/{}-assigned-minor", self.domain, self.device_type)
    }

    /// Pod annotation with the hardware CLI index (DRS only).
    pub fn assigned_index_key(&self) -> String {
        format!("{}/{}-assigned-index", self.domain, self.device_type)
    }

    /// Pod annotation flipped to `"true"` once every container was handed a
    /// slice by the kubelet.
    pub fn assigned_key(&self) -> String {
        format!("{}/{}-assigned", self.domain, self.device_type)
    }

    /// Pod annotation with the nanosecond reservation timestamp.
    pub fn assigned_time_key(&self) -> String {
        format!("{}/{}-assigned-time", self.domain, self.device_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_names_use_enflame_domain() {
        let config = ResourceConfig::default();
        assert_eq!(config.shared_resource_name(), "enflame.com/shared-gcu");
        assert_eq!(config.drs_resource_name(), "enflame.com/drs-gcu");
        assert_eq!(config.count_resource_name(), "enflame.com/gcu-count");
        assert_eq!(config.gcushare_label(), "enflame.com/gcushare");
        assert_eq!(
            config.shared_capacity_key(),
            "enflame.com/gcu-shared-capacity"
        );
        assert_eq!(config.drs_capacity_key(), "enflame.com/gcu-drs-capacity");
        assert_eq!(config.assigned_minor_key(), "enflame.com/gcu-assigned-minor");
        assert_eq!(config.assigned_time_key(), "enflame.com/gcu-assigned-time");
    }

    #[test]
    fn custom_domain_and_type_flow_through() {
        let config = ResourceConfig::new("vendor.io", "npu");
        assert_eq!(config.shared_resource_name(), "vendor.io/shared-npu");
        assert_eq!(config.request_size_key(), "vendor.io/npu-request-size");
        assert_eq!(config.device_node_path("3"), "/dev/npu3");
    }
}
