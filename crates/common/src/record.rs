//! The scheduler record: the JSON document exchanged through a DRS
//! coordination configmap between the scheduler plugin and the node agent.
//!
//! The configmap acts as a bidirectional mailbox. The scheduler creates it
//! with a `filter` section, the node agent answers by filling in the selected
//! device and profile references, the scheduler copies the containers into a
//! `preBind` section, and the node agent materializes DRS instances and
//! reports their ids back.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Terminal-ish states written into `filter.status` / `preBind.status`.
/// An absent value means the addressed side has not answered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Success,
    Error,
    Unschedulable,
    /// The handler decided the object was not addressed to it; nothing was
    /// written back.
    Skip,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "Success",
            Self::Error => "Error",
            Self::Unschedulable => "Unschedulable",
            Self::Skip => "Skip",
        };
        f.write_str(s)
    }
}

/// Per-container allocation record, stored both in the scheduler record and
/// in the pod's `assigned-containers` annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateRecord {
    /// Set by the node agent once the kubelet handed this container its
    /// devices.
    #[serde(rename = "allocated", skip_serializing_if = "Option::is_none")]
    pub kubelet_allocated: Option<bool>,
    /// Slice weight this container requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<i64>,
    #[serde(rename = "profileID", skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
    #[serde(rename = "profileName", skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(rename = "instanceID", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(rename = "instanceUUID", skip_serializing_if = "Option::is_none")]
    pub instance_uuid: Option<String>,
}

/// The device elected by the node agent during the filter handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub index: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub minor: String,
    #[serde(
        rename = "pciBusID",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub pci_bus_id: String,
}

/// A shared-lane pod already occupying a card on the candidate node. The
/// node agent must not elect those cards for DRS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcuSharePod {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uuid: String,
    #[serde(
        rename = "assignedMinor",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub assigned_minor: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    #[serde(
        rename = "gcuSharePods",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub gcu_share_pods: Vec<GcuSharePod>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, AllocateRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreBindSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, AllocateRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterSpec>,
    #[serde(rename = "preBind", default, skip_serializing_if = "Option::is_none")]
    pub pre_bind: Option<PreBindSpec>,
}

/// Explicit protocol phase, derived from the record instead of comparing raw
/// status strings at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// The scheduler created the object; the node agent has not answered.
    Issued,
    /// The node agent elected a device and filled the filter section.
    FilterDone,
    /// The scheduler copied the containers into `preBind`; instances are not
    /// materialized yet.
    PreBindIssued,
    /// The node agent created the DRS instances.
    PreBindDone,
    /// One side reported `Error` or `Unschedulable`; the exchange is over.
    Terminal,
}

impl SchedulerRecord {
    pub fn phase(&self) -> RequestPhase {
        let filter_status = self.filter.as_ref().and_then(|f| f.status);
        match filter_status {
            None => return RequestPhase::Issued,
            Some(RecordStatus::Success) => {}
            Some(_) => return RequestPhase::Terminal,
        }
        match &self.pre_bind {
            None => RequestPhase::FilterDone,
            Some(pre_bind) => match pre_bind.status {
                None => RequestPhase::PreBindIssued,
                Some(RecordStatus::Success) => RequestPhase::PreBindDone,
                Some(_) => RequestPhase::Terminal,
            },
        }
    }
}

/// The `<pod>.<namespace>.<shortUid>.<node>.configmap` name of a
/// coordination object. Exactly five dot-separated segments; the node agent
/// ignores anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationName {
    pub pod_name: String,
    pub namespace: String,
    pub short_uid: String,
    pub node_name: String,
}

impl CoordinationName {
    pub fn new(pod_name: &str, namespace: &str, pod_uid: &str, node_name: &str) -> Self {
        let short_uid = pod_uid.split('-').next().unwrap_or_default().to_string();
        Self {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            short_uid,
            node_name: node_name.to_string(),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() != 5 || parts[4] != "configmap" {
            return None;
        }
        Some(Self {
            pod_name: parts[0].to_string(),
            namespace: parts[1].to_string(),
            short_uid: parts[2].to_string(),
            node_name: parts[3].to_string(),
        })
    }
}

impl fmt::Display for CoordinationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.configmap",
            self.pod_name, self.namespace, self.short_uid, self.node_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_json(value: serde_json::Value) -> SchedulerRecord {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn status_serializes_to_bare_words() {
        let spec = FilterSpec {
            status: Some(RecordStatus::Unschedulable),
            message: "no device fits".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["status"], "Unschedulable");
        assert_eq!(json["message"], "no device fits");
    }

    #[test]
    fn allocate_record_uses_wire_field_names() {
        let record = AllocateRecord {
            kubelet_allocated: Some(true),
            request: Some(3),
            profile_id: Some("id3".to_string()),
            profile_name: Some("3g.24gb".to_string()),
            instance_id: Some("7".to_string()),
            instance_uuid: Some("uuid-7".to_string()),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["allocated"], true);
        assert_eq!(json["profileID"], "id3");
        assert_eq!(json["profileName"], "3g.24gb");
        assert_eq!(json["instanceID"], "7");
        assert_eq!(json["instanceUUID"], "uuid-7");
    }

    #[test]
    fn phase_tracks_the_handshake() {
        let mut record = record_json(serde_json::json!({
            "filter": {"containers": {"c1": {"request": 1}}}
        }));
        assert_eq!(record.phase(), RequestPhase::Issued);

        record.filter.as_mut().unwrap().status = Some(RecordStatus::Success);
        assert_eq!(record.phase(), RequestPhase::FilterDone);

        record.pre_bind = Some(PreBindSpec::default());
        assert_eq!(record.phase(), RequestPhase::PreBindIssued);

        record.pre_bind.as_mut().unwrap().status = Some(RecordStatus::Success);
        assert_eq!(record.phase(), RequestPhase::PreBindDone);

        record.filter.as_mut().unwrap().status = Some(RecordStatus::Unschedulable);
        assert_eq!(record.phase(), RequestPhase::Terminal);
    }

    #[test]
    fn coordination_name_round_trips() {
        let name = CoordinationName::new(
            "training-job",
            "team-a",
            "0ff6d85c-91b2-4bfb-9b12-fb1e77a0ae1c",
            "node-1",
        );
        assert_eq!(
            name.to_string(),
            "training-job.team-a.0ff6d85c.node-1.configmap"
        );
        assert_eq!(CoordinationName::parse(&name.to_string()), Some(name));
    }

    #[test]
    fn coordination_name_rejects_other_configmaps() {
        assert_eq!(CoordinationName::parse("kube-root-ca.crt"), None);
        assert_eq!(CoordinationName::parse("a.b.c.d.e.configmap"), None);
        assert_eq!(CoordinationName::parse("a.b.c.d"), None);
    }
}
