//! Node-side availability: the per-card remaining slices of each lane,
//! derived from the agent's capacity annotations and the pods already
//! placed on the node.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use error_stack::Report;
use gcushare_common::capacity::DrsCapacity;
use gcushare_common::capacity::SharedCapacity;
use gcushare_common::config::DRS_ASSIGNED_DEVICE;
use gcushare_common::DeviceRef;
use gcushare_common::KubernetesError;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use tracing::error;
use tracing::warn;

use super::pod::AssignedMinor;
use super::pod::PodResource;
use super::pod::ReserveRecord;
use super::BaseResource;
use crate::framework::NodeInfo;

pub struct NodeResource {
    pub base: BaseResource,
}

impl NodeResource {
    pub fn new(base: BaseResource) -> Self {
        Self { base }
    }

    /// A node participates in a lane when it carries the gcushare label and
    /// advertises a positive allocatable amount of the lane's resource.
    pub fn is_gcushare_node(&self, drs: bool, node: &Node) -> bool {
        let labeled = node
            .metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(&self.base.config.gcushare_label()));
        if !labeled {
            return false;
        }
        let resource_name = self.base.config.resource_name(drs);
        node.status
            .as_ref()
            .and_then(|s| s.allocatable.as_ref())
            .and_then(|a| a.get(&resource_name))
            .and_then(|q| q.0.parse::<i64>().ok())
            .is_some_and(|v| v > 0)
    }

    /// Reads the shared-lane `{minor: capacity}` annotation.
    pub fn shared_capacity(&self, node: &Node) -> Result<SharedCapacity, Report<KubernetesError>> {
        let key = self.base.config.shared_capacity_key();
        let raw = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&key))
            .ok_or_else(|| {
                Report::new(KubernetesError::AnnotationParse {
                    key: key.clone(),
                    message: format!(
                        "annotation not found on node {}",
                        node.metadata.name.as_deref().unwrap_or_default()
                    ),
                })
            })?;
        let capacity: SharedCapacity = serde_json::from_str(raw).map_err(|e| {
            Report::new(KubernetesError::AnnotationParse {
                key: key.clone(),
                message: e.to_string(),
            })
        })?;
        if capacity.is_empty() {
            error!(
                node = node.metadata.name.as_deref().unwrap_or_default(),
                "no gcu device found in the capacity annotation"
            );
        }
        Ok(capacity)
    }

    /// Reads the DRS-lane `{devices, profiles}` annotation.
    pub fn drs_capacity(&self, node: &Node) -> Result<DrsCapacity, Report<KubernetesError>> {
        let key = self.base.config.drs_capacity_key();
        let raw = node
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&key))
            .ok_or_else(|| {
                Report::new(KubernetesError::AnnotationParse {
                    key: key.clone(),
                    message: format!(
                        "annotation not found on node {}",
                        node.metadata.name.as_deref().unwrap_or_default()
                    ),
                })
            })?;
        serde_json::from_str(raw).map_err(|e| {
            Report::new(KubernetesError::AnnotationParse {
                key,
                message: e.to_string(),
            })
        })
    }

    /// Cards occupied by DRS pods, from the `drs-assigned-device` annotation.
    fn drs_occupied_minors(pods: &[Pod]) -> Result<BTreeSet<String>, Report<KubernetesError>> {
        let mut minors = BTreeSet::new();
        for pod in pods {
            let Some(raw) = pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(DRS_ASSIGNED_DEVICE))
            else {
                continue;
            };
            let device: DeviceRef = serde_json::from_str(raw).map_err(|e| {
                Report::new(KubernetesError::AnnotationParse {
                    key: DRS_ASSIGNED_DEVICE.to_string(),
                    message: e.to_string(),
                })
            })?;
            if !device.minor.is_empty() {
                minors.insert(device.minor);
            }
        }
        Ok(minors)
    }

    /// Remaining shared slices per card. DRS-occupied cards are excluded
    /// entirely; a negative remainder is an invariant violation and
    /// surfaces as an error rather than being clamped.
    pub async fn available_shared(
        &self,
        node_info: &NodeInfo,
        pod_resource: &PodResource,
        reserve_hint: Option<&ReserveRecord>,
    ) -> Result<BTreeMap<String, i64>, Report<KubernetesError>> {
        let capacity = self.shared_capacity(&node_info.node)?;
        let drs_occupied = Self::drs_occupied_minors(&node_info.pods)?;

        let mut used: BTreeMap<String, i64> = BTreeMap::new();
        for pod in &node_info.pods {
            if !pod_resource.is_sharing_pod(pod) {
                continue;
            }
            let minor = match pod_resource
                .assigned_minor_with_fallback(pod, reserve_hint)
                .await
            {
                AssignedMinor::Assigned(minor) => minor,
                AssignedMinor::PodGone => continue,
                AssignedMinor::Missing => {
                    return Err(Report::new(KubernetesError::AnnotationParse {
                        key: self.base.config.assigned_minor_key(),
                        message: format!(
                            "assigned minor not found for pod {}",
                            pod.metadata.name.as_deref().unwrap_or_default()
                        ),
                    }));
                }
            };
            *used.entry(minor).or_default() += pod_resource.request_size(pod, false);
        }

        let node_name = node_info.name().to_string();
        let mut available = BTreeMap::new();
        for (minor, total) in capacity {
            if drs_occupied.contains(&minor) {
                warn!(node = %node_name, minor = %minor, "card in drs lane, excluded from shared availability");
                continue;
            }
            let used = used.get(&minor).copied().unwrap_or(0);
            if used > total {
                return Err(Report::new(KubernetesError::AnnotationParse {
                    key: self.base.config.shared_capacity_key(),
                    message: format!(
                        "device {minor} on node {node_name} has capacity {total} but used {used}; \
                         the slice count may have been modified, which is not allowed"
                    ),
                }));
            }
            available.insert(minor, total - used);
        }
        Ok(available)
    }

    /// Remaining DRS slice weight per card. Shared-occupied cards are
    /// excluded entirely.
    pub async fn available_drs(
        &self,
        node_info: &NodeInfo,
        pod_resource: &PodResource,
        reserve_hint: Option<&ReserveRecord>,
    ) -> Result<(BTreeMap<String, i64>, DrsCapacity), Report<KubernetesError>> {
        let capacity = self.drs_capacity(&node_info.node)?;

        let mut shared_occupied = BTreeSet::new();
        let mut used: BTreeMap<String, i64> = BTreeMap::new();
        for pod in &node_info.pods {
            let shared = pod_resource.is_sharing_pod(pod);
            let drs = pod_resource.is_drs_pod(pod);
            if !shared && !drs {
                continue;
            }
            let minor = match pod_resource
                .assigned_minor_with_fallback(pod, reserve_hint)
                .await
            {
                AssignedMinor::Assigned(minor) => minor,
                AssignedMinor::PodGone => continue,
                AssignedMinor::Missing => {
                    return Err(Report::new(KubernetesError::AnnotationParse {
                        key: self.base.config.assigned_minor_key(),
                        message: format!(
                            "assigned minor not found for pod {}",
                            pod.metadata.name.as_deref().unwrap_or_default()
                        ),
                    }));
                }
            };
            if shared {
                shared_occupied.insert(minor);
            } else {
                *used.entry(minor).or_default() += pod_resource.request_size(pod, true);
            }
        }

        let node_name = node_info.name().to_string();
        let mut available = BTreeMap::new();
        for (minor, total) in capacity.capacity_by_minor() {
            if shared_occupied.contains(&minor) {
                warn!(node = %node_name, minor = %minor, "card in shared lane, excluded from drs availability");
                continue;
            }
            let used = used.get(&minor).copied().unwrap_or(0);
            if used > total {
                return Err(Report::new(KubernetesError::AnnotationParse {
                    key: self.base.config.drs_capacity_key(),
                    message: format!(
                        "device {minor} on node {node_name} has drs capacity {total} but used {used}"
                    ),
                }));
            }
            available.insert(minor, total - used);
        }
        Ok((available, capacity))
    }
}

/// Best-fit: among cards with availability ≥ request, the smallest
/// availability wins; ties go to the lowest minor.
pub fn best_fit(available: &BTreeMap<String, i64>, request: i64) -> Option<String> {
    let mut selected: Option<(&String, i64)> = None;
    for (minor, remaining) in available {
        if *remaining < request {
            continue;
        }
        let better = selected.is_none_or(|(_, best)| *remaining < best);
        if better {
            selected = Some((minor, *remaining));
        }
    }
    selected.map(|(minor, _)| minor.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_fit_picks_the_tightest_card() {
        let available = BTreeMap::from([
            ("0".to_string(), 2),
            ("1".to_string(), 6),
        ]);
        assert_eq!(best_fit(&available, 2), Some("0".to_string()));
        assert_eq!(best_fit(&available, 3), Some("1".to_string()));
        assert_eq!(best_fit(&available, 7), None);
    }

    #[test]
    fn best_fit_breaks_ties_by_lowest_minor() {
        let available = BTreeMap::from([
            ("3".to_string(), 6),
            ("1".to_string(), 6),
        ]);
        assert_eq!(best_fit(&available, 1), Some("1".to_string()));
    }

    #[test]
    fn best_fit_on_exact_fit_empties_the_card() {
        let available = BTreeMap::from([("0".to_string(), 1)]);
        assert_eq!(best_fit(&available, 1), Some("0".to_string()));
    }
}
