//! Read-only inspect API: per-node and per-device usage of both lanes.

use std::collections::BTreeMap;

use gcushare_common::config::ASSIGNED_CONTAINERS;
use gcushare_common::AllocateRecord;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::Api;
use kube::Client;
use serde::Serialize;
use tracing::error;
use tracing::warn;

use crate::resources::NodeResource;
use crate::resources::PodResource;

pub const VIRT_DRS: &str = "DRS";
pub const VIRT_SHARED: &str = "shared";

#[derive(Debug, Default, Serialize)]
pub struct NodeUsage {
    pub name: String,
    #[serde(rename = "totalGCU")]
    pub total_gcu: i64,
    #[serde(rename = "usedGCU")]
    pub used_gcu: i64,
    #[serde(rename = "availableGCU")]
    pub available_gcu: i64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, DeviceUsage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warn: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct DeviceUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virt: Option<String>,
    #[serde(rename = "totalGCU")]
    pub total_gcu: i64,
    #[serde(rename = "usedGCU")]
    pub used_gcu: i64,
    #[serde(rename = "availableGCU")]
    pub available_gcu: i64,
    pub pods: Vec<PodUsage>,
}

#[derive(Debug, Serialize)]
pub struct PodUsage {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    #[serde(rename = "usedGCU")]
    pub used_gcu: i64,
    pub phase: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub containers: BTreeMap<String, AllocateRecord>,
}

pub struct Inspector {
    client: Client,
    pod_resource: PodResource,
    node_resource: NodeResource,
}

impl Inspector {
    pub fn new(client: Client, pod_resource: PodResource, node_resource: NodeResource) -> Self {
        Self {
            client,
            pod_resource,
            node_resource,
        }
    }

    /// Summary over every gcushare node of the requested lane.
    pub async fn inspect_all(&self, drs: bool) -> Result<Vec<NodeUsage>, String> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| format!("list cluster nodes failed: {e}"))?;
        let mut result = Vec::new();
        for node in nodes.items {
            if !self.node_resource.is_gcushare_node(drs, &node) {
                continue;
            }
            result.push(self.build_node_usage(node, drs).await);
        }
        if result.is_empty() {
            return Err("no gcushare nodes found".to_string());
        }
        Ok(result)
    }

    /// Per-card detail of one node.
    pub async fn inspect_node(&self, node_name: &str, drs: bool) -> NodeUsage {
        let api: Api<Node> = Api::all(self.client.clone());
        let node = match api.get(node_name).await {
            Ok(node) => node,
            Err(e) => {
                error!(node = node_name, "get node failed: {e}");
                return NodeUsage {
                    name: node_name.to_string(),
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };
        if !self.node_resource.is_gcushare_node(drs, &node) {
            return NodeUsage {
                name: node_name.to_string(),
                error: Some(format!("node {node_name} is not a gcushare node")),
                ..Default::default()
            };
        }
        self.build_node_usage(node, drs).await
    }

    fn lane_devices(&self, node: &Node, drs: bool) -> Result<BTreeMap<String, i64>, String> {
        if drs {
            let capacity = self
                .node_resource
                .drs_capacity(node)
                .map_err(|e| format!("{e:?}"))?;
            Ok(capacity.capacity_by_minor())
        } else {
            self.node_resource
                .shared_capacity(node)
                .map_err(|e| format!("{e:?}"))
        }
    }

    async fn build_node_usage(&self, node: Node, drs: bool) -> NodeUsage {
        let node_name = node.metadata.name.clone().unwrap_or_default();
        let mut usage = NodeUsage {
            name: node_name.clone(),
            ..Default::default()
        };

        let capacity = match self.lane_devices(&node, drs) {
            Ok(capacity) => capacity,
            Err(e) => {
                usage.error = Some(e);
                return usage;
            }
        };
        for (minor, total) in &capacity {
            usage.total_gcu += total;
            usage.devices.insert(
                minor.clone(),
                DeviceUsage {
                    total_gcu: *total,
                    available_gcu: *total,
                    ..Default::default()
                },
            );
        }

        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = match api.list(&params).await {
            Ok(pods) => pods.items,
            Err(e) => {
                usage.error = Some(format!("list pods on node {node_name} failed: {e}"));
                return usage;
            }
        };

        let mut ignored = BTreeMap::new();
        for pod in pods {
            if let Some(error) = self.apply_pod(&mut usage, &mut ignored, &pod, drs) {
                usage.error = Some(error);
                return usage;
            }
        }
        usage.available_gcu = usage.total_gcu - usage.used_gcu;
        usage
    }

    /// Folds one pod into the usage view. Returns an error message on an
    /// invariant violation.
    fn apply_pod(
        &self,
        usage: &mut NodeUsage,
        ignored: &mut BTreeMap<String, ()>,
        pod: &Pod,
        drs: bool,
    ) -> Option<String> {
        let sharing = self.pod_resource.is_sharing_pod(pod);
        let drs_pod = self.pod_resource.is_drs_pod(pod);
        if !sharing && !drs_pod {
            return None;
        }
        let pod_name = pod.metadata.name.clone().unwrap_or_default();
        let Some(minor) = self.pod_resource.assigned_minor(pod) else {
            warn!(pod = %pod_name, "pod has not been assigned a device yet");
            return None;
        };
        if !ignored.contains_key(&minor) && !usage.devices.contains_key(&minor) {
            let message = format!(
                "pod {pod_name} is assigned device {minor}, but the device is not found"
            );
            warn!("{message}");
            usage.warn.push(message);
            return None;
        }

        // A device serving the opposite lane leaves this lane's view
        // entirely; the exclusion is surfaced as a warning.
        let opposite = if drs { sharing } else { drs_pod };
        if opposite {
            if let Some(device) = usage.devices.remove(&minor) {
                usage.total_gcu -= device.total_gcu;
                ignored.insert(minor.clone(), ());
                usage.warn.push(format!(
                    "device {minor} is occupied by the other lane (pod {pod_name})"
                ));
            }
            return None;
        }

        let request = self.pod_resource.request_size(pod, drs);
        let Some(device) = usage.devices.get_mut(&minor) else {
            return None;
        };
        if device.virt.is_none() {
            device.virt = Some(if drs { VIRT_DRS } else { VIRT_SHARED }.to_string());
        }
        usage.used_gcu += request;
        device.used_gcu += request;
        device.available_gcu -= request;
        if device.available_gcu < 0 {
            return Some(format!(
                "device {minor} on node {} has capacity {} but uses at least {}; \
                 the slice count may have been modified, which is not allowed",
                usage.name, device.total_gcu, device.used_gcu
            ));
        }

        let containers = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ASSIGNED_CONTAINERS))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        device.pods.push(PodUsage {
            name: pod_name,
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            uid: pod.metadata.uid.clone().unwrap_or_default(),
            used_gcu: request,
            phase: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default(),
            containers,
        });
        None
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use gcushare_common::ResourceConfig;
    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::Client;

    use super::*;
    use crate::resources::BaseResource;

    fn inspector() -> Inspector {
        let client =
            Client::try_from(kube::Config::new("http://127.0.0.1:8080".parse().unwrap())).unwrap();
        let base = BaseResource::new(ResourceConfig::default(), client.clone());
        Inspector::new(client, PodResource::new(base.clone()), NodeResource::new(base))
    }

    fn usage(devices: &[(&str, i64)]) -> NodeUsage {
        let mut usage = NodeUsage {
            name: "node-1".to_string(),
            ..Default::default()
        };
        for (minor, total) in devices {
            usage.total_gcu += total;
            usage.devices.insert(
                (*minor).to_string(),
                DeviceUsage {
                    total_gcu: *total,
                    available_gcu: *total,
                    ..Default::default()
                },
            );
        }
        usage
    }

    fn pod(name: &str, resource: &str, amount: i64, annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{name}")),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "c1".to_string(),
                    resources: Some(ResourceRequirements {
                        limits: Some(Map::from([(
                            resource.to_string(),
                            Quantity(amount.to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        }
    }

    #[tokio::test]
    async fn shared_pods_accumulate_device_usage() {
        let inspector = inspector();
        let mut usage = usage(&[("0", 6), ("1", 6)]);
        let mut ignored = BTreeMap::new();
        let p = pod(
            "p1",
            "enflame.com/shared-gcu",
            4,
            &[
                ("enflame.com/gcu-assigned-minor", "0"),
                ("enflame.com/gcu-request-size", "4"),
            ],
        );
        assert!(inspector.apply_pod(&mut usage, &mut ignored, &p, false).is_none());
        assert_eq!(usage.used_gcu, 4);
        assert_eq!(usage.devices["0"].used_gcu, 4);
        assert_eq!(usage.devices["0"].available_gcu, 2);
        assert_eq!(usage.devices["0"].virt.as_deref(), Some(VIRT_SHARED));
        assert_eq!(usage.devices["0"].pods.len(), 1);
    }

    #[tokio::test]
    async fn opposite_lane_devices_leave_the_view_with_a_warning() {
        let inspector = inspector();
        let mut usage = usage(&[("0", 6), ("1", 6)]);
        let mut ignored = BTreeMap::new();
        let drs_pod = pod(
            "d1",
            "enflame.com/drs-gcu",
            3,
            &[
                ("enflame.com/gcu-assigned-minor", "0"),
                ("enflame.com/gcu-request-size", "3"),
            ],
        );
        // Shared-lane inspection drops the DRS-occupied card silently.
        assert!(inspector
            .apply_pod(&mut usage, &mut ignored, &drs_pod, false)
            .is_none());
        assert!(!usage.devices.contains_key("0"));
        assert_eq!(usage.total_gcu, 6);
        assert_eq!(usage.warn.len(), 1);
    }

    #[tokio::test]
    async fn oversubscription_surfaces_as_an_error() {
        let inspector = inspector();
        let mut usage = usage(&[("0", 2)]);
        let mut ignored = BTreeMap::new();
        let p = pod(
            "p1",
            "enflame.com/shared-gcu",
            3,
            &[
                ("enflame.com/gcu-assigned-minor", "0"),
                ("enflame.com/gcu-request-size", "3"),
            ],
        );
        let error = inspector.apply_pod(&mut usage, &mut ignored, &p, false);
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn unassigned_pods_are_skipped() {
        let inspector = inspector();
        let mut usage = usage(&[("0", 6)]);
        let mut ignored = BTreeMap::new();
        let p = pod("p1", "enflame.com/shared-gcu", 1, &[]);
        assert!(inspector.apply_pod(&mut usage, &mut ignored, &p, false).is_none());
        assert_eq!(usage.used_gcu, 0);
    }

    #[tokio::test]
    async fn unknown_devices_are_recorded_as_warnings() {
        let inspector = inspector();
        let mut usage = usage(&[("0", 6)]);
        let mut ignored = BTreeMap::new();
        let p = pod(
            "p1",
            "enflame.com/shared-gcu",
            1,
            &[
                ("enflame.com/gcu-assigned-minor", "9"),
                ("enflame.com/gcu-request-size", "1"),
            ],
        );
        assert!(inspector.apply_pod(&mut usage, &mut ignored, &p, false).is_none());
        assert_eq!(usage.warn.len(), 1);
    }
}
