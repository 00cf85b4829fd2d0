//! Node accounting: publishes the card count and the per-lane capacity
//! annotations on the node object, and bootstraps the DRS profile table.

use std::collections::BTreeMap;

use error_stack::Report;
use error_stack::ResultExt;
use gcushare_common::capacity::DrsCapacity;
use gcushare_common::capacity::DrsDeviceSpec;
use gcushare_common::capacity::SharedCapacity;
use gcushare_common::KubernetesError;
use gcushare_common::ResourceConfig;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Api;
use kube::Client;
use serde_json::json;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::hardware::drs;
use crate::hardware::HardwareCli;
use crate::hardware::Instance;
use crate::inventory::Inventory;
use crate::pod_cache::assigned_containers;

pub struct NodeResource {
    config: ResourceConfig,
    node_name: String,
    client: Client,
    /// Profile name → profile id, uniform across the node's cards. Empty
    /// when the DRS lane is disabled.
    drs_profiles: BTreeMap<String, String>,
}

impl NodeResource {
    pub fn new(config: ResourceConfig, node_name: String, client: Client) -> Self {
        Self {
            config,
            node_name,
            client,
            drs_profiles: BTreeMap::new(),
        }
    }

    /// Reads the profile table from the hardware after auditing that every
    /// pre-existing DRS instance is owned by a known pod. Unknown instances
    /// mean another controller partitioned the card; refusing to start is
    /// the only safe answer.
    pub async fn bootstrap_drs_profiles(
        &mut self,
        cli: &dyn HardwareCli,
    ) -> Result<(), Report<KubernetesError>> {
        let instances = cli.list_instances("").map_err(|e| {
            Report::new(KubernetesError::ConnectionFailed {
                message: format!("list drs instances failed: {e:?}"),
            })
        })?;
        if !instances.is_empty() {
            let pods = self.list_node_pods().await?;
            let unknown = unknown_instances(&instances, &pods, &self.config)?;
            if !unknown.is_empty() {
                let message = format!(
                    "drs instances already exist and are not owned by gcushare pods: {unknown:?}"
                );
                error!("{message}");
                return Err(Report::new(KubernetesError::ConnectionFailed { message }));
            }
            warn!("drs instances already existed at startup; all are owned by known pods");
        }

        let devices = cli.device_report().map_err(|e| {
            Report::new(KubernetesError::ConnectionFailed {
                message: format!("hardware device report failed: {e:?}"),
            })
        })?;
        let template = drs::profile_template(cli, &devices).map_err(|e| {
            Report::new(KubernetesError::ConnectionFailed {
                message: format!("read drs profile template failed: {e:?}"),
            })
        })?;
        self.drs_profiles = template
            .into_iter()
            .map(|(name, spec)| (name, spec.profile_id))
            .collect();
        info!(profiles = ?self.drs_profiles, "drs profile table loaded");
        Ok(())
    }

    pub fn drs_profiles(&self) -> &BTreeMap<String, String> {
        &self.drs_profiles
    }

    /// The per-process isolation flag, unless the operator overrides it with
    /// the node label.
    pub async fn check_resource_isolation(
        &self,
        flag: bool,
    ) -> Result<bool, Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node =
            api.get(&self.node_name)
                .await
                .change_context(KubernetesError::NotFound {
                    kind: "node",
                    name: self.node_name.clone(),
                })?;
        let label = self.config.isolation_label();
        let value = node.metadata.labels.as_ref().and_then(|l| l.get(&label));
        match value.map(String::as_str) {
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => {
                warn!(label = %label, value = other, "unrecognized isolation label value, keeping flag");
                Ok(flag)
            }
            None => Ok(flag),
        }
    }

    async fn list_node_pods(&self) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", self.node_name));
        let pods = api
            .list(&params)
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "list node pods failed".to_string(),
            })?;
        Ok(pods.items)
    }

    /// Publishes the physical card count into `status.capacity` and
    /// `status.allocatable`. Skipped when the node already advertises it.
    pub async fn patch_card_count(&self, count: i64) -> Result<(), Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let node =
            api.get(&self.node_name)
                .await
                .change_context(KubernetesError::NotFound {
                    kind: "node",
                    name: self.node_name.clone(),
                })?;

        let count_resource = self.config.count_resource_name();
        let current = node
            .status
            .as_ref()
            .and_then(|s| s.capacity.as_ref())
            .and_then(|c| c.get(&count_resource))
            .and_then(|q| q.0.parse::<i64>().ok());
        if current == Some(count) {
            info!(node = %self.node_name, resource = %count_resource, "card count already published");
            return Ok(());
        }

        let patch = json!({
            "status": {
                "capacity": { count_resource.as_str(): count.to_string() },
                "allocatable": { count_resource.as_str(): count.to_string() },
            }
        });
        api.patch_status(
            &self.node_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .change_context(KubernetesError::PatchFailed {
            kind: "node",
            name: self.node_name.clone(),
            message: "patch card count status".to_string(),
        })?;
        info!(node = %self.node_name, count, "patched card count to node status");
        Ok(())
    }

    /// Publishes `{minor: capacity}` for the shared lane. A separate merge
    /// patch keyed by its own annotation, so the DRS lane is never clobbered.
    pub async fn patch_shared_capacity(
        &self,
        capacity: &SharedCapacity,
    ) -> Result<(), Report<KubernetesError>> {
        let content =
            serde_json::to_string(capacity).change_context(KubernetesError::PatchFailed {
                kind: "node",
                name: self.node_name.clone(),
                message: "serialize shared capacity".to_string(),
            })?;
        self.patch_annotation(self.config.shared_capacity_key(), content)
            .await
    }

    /// Publishes `{devices, profiles}` for the DRS lane.
    pub async fn patch_drs_capacity(
        &self,
        capacity_by_minor: &BTreeMap<String, i64>,
        inventory: &Inventory,
    ) -> Result<(), Report<KubernetesError>> {
        let devices = capacity_by_minor
            .iter()
            .map(|(minor, capacity)| DrsDeviceSpec {
                index: inventory
                    .cards
                    .get(minor)
                    .map(|card| card.index.clone())
                    .unwrap_or_default(),
                minor: minor.clone(),
                capacity: *capacity,
            })
            .collect();
        let capacity = DrsCapacity {
            devices,
            profiles: self.drs_profiles.clone(),
        };
        let content =
            serde_json::to_string(&capacity).change_context(KubernetesError::PatchFailed {
                kind: "node",
                name: self.node_name.clone(),
                message: "serialize drs capacity".to_string(),
            })?;
        self.patch_annotation(self.config.drs_capacity_key(), content)
            .await
    }

    async fn patch_annotation(
        &self,
        key: String,
        value: String,
    ) -> Result<(), Report<KubernetesError>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "metadata": { "annotations": { key.as_str(): value } } });
        api.patch(
            &self.node_name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
        .change_context(KubernetesError::PatchFailed {
            kind: "node",
            name: self.node_name.clone(),
            message: format!("patch annotation {key}"),
        })?;
        info!(node = %self.node_name, annotation = %key, "patched node annotation");
        Ok(())
    }
}

/// Instances whose uuid no pod on the node claims through its
/// `assigned-containers` records.
fn unknown_instances(
    instances: &[Instance],
    pods: &[Pod],
    config: &ResourceConfig,
) -> Result<Vec<String>, Report<KubernetesError>> {
    let index_key = config.assigned_index_key();
    let mut owned = BTreeMap::new();
    for pod in pods {
        let has_index = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&index_key))
            .is_some_and(|v| !v.is_empty());
        if !has_index {
            continue;
        }
        for record in assigned_containers(pod)?.values() {
            if let Some(uuid) = &record.instance_uuid {
                if !uuid.is_empty() {
                    owned.insert(
                        uuid.clone(),
                        pod.metadata.name.clone().unwrap_or_default(),
                    );
                }
            }
        }
    }

    let mut unknown = Vec::new();
    for instance in instances {
        match owned.get(&instance.uuid) {
            Some(owner) => {
                info!(uuid = %instance.uuid, pod = %owner, "drs instance is owned by pod")
            }
            None => unknown.push(instance.uuid.clone()),
        }
    }
    Ok(unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod_cache::testutil::pod_with_containers;

    fn instance(uuid: &str) -> Instance {
        Instance {
            index: "0".to_string(),
            profile_name: "1g.8gb".to_string(),
            instance_id: "1".to_string(),
            uuid: uuid.to_string(),
        }
    }

    #[test]
    fn instances_claimed_by_pods_are_known() {
        let config = ResourceConfig::default();
        let pod = pod_with_containers(
            "d1",
            "uid-1",
            &[("c1", "enflame.com/drs-gcu", 1)],
            &[
                ("enflame.com/gcu-assigned-index", "0"),
                (
                    "assigned-containers",
                    r#"{"c1":{"request":1,"instanceUUID":"uuid-a"}}"#,
                ),
            ],
        );
        let unknown =
            unknown_instances(&[instance("uuid-a"), instance("uuid-b")], &[pod], &config).unwrap();
        assert_eq!(unknown, vec!["uuid-b".to_string()]);
    }

    #[test]
    fn pods_without_assigned_index_claim_nothing() {
        let config = ResourceConfig::default();
        let pod = pod_with_containers(
            "s1",
            "uid-1",
            &[("c1", "enflame.com/shared-gcu", 1)],
            &[(
                "assigned-containers",
                r#"{"c1":{"request":1,"instanceUUID":"uuid-a"}}"#,
            )],
        );
        let unknown = unknown_instances(&[instance("uuid-a")], &[pod], &config).unwrap();
        assert_eq!(unknown, vec!["uuid-a".to_string()]);
    }
}
