//! Pod-side accessors: managed-resource requests and the annotations the
//! scheduler reads back, with the informer-lag fallback chain.

use std::collections::BTreeMap;
use std::time::Duration;

use gcushare_common::AllocateRecord;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use tracing::warn;

use super::BaseResource;

/// The annotations the most recent Reserve patched onto its pod. Single
/// slot: it papers over the window where the pod informer has not yet seen
/// the previous pod's patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReserveRecord {
    pub pod_uid: String,
    pub annotations: BTreeMap<String, String>,
}

/// Fallback result when resolving a pod's assigned card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignedMinor {
    Assigned(String),
    /// The pod vanished or was recreated under a new uid; exclude it from
    /// accounting.
    PodGone,
    Missing,
}

const ANNOTATION_RETRIES: usize = 10;
const ANNOTATION_BACKOFF: Duration = Duration::from_millis(100);

pub struct PodResource {
    pub base: BaseResource,
}

impl PodResource {
    pub fn new(base: BaseResource) -> Self {
        Self { base }
    }

    fn limit_total(&self, pod: &Pod, resource_name: &str) -> i64 {
        let Some(spec) = &pod.spec else { return 0 };
        spec.containers
            .iter()
            .filter_map(|c| c.resources.as_ref())
            .filter_map(|r| r.limits.as_ref())
            .filter_map(|limits| limits.get(resource_name))
            .filter_map(|quantity| quantity.0.parse::<i64>().ok())
            .sum()
    }

    pub fn shared_request(&self, pod: &Pod) -> i64 {
        self.limit_total(pod, &self.base.shared_resource_name)
    }

    pub fn drs_request(&self, pod: &Pod) -> i64 {
        self.limit_total(pod, &self.base.drs_resource_name)
    }

    pub fn is_sharing_pod(&self, pod: &Pod) -> bool {
        self.shared_request(pod) > 0
    }

    pub fn is_drs_pod(&self, pod: &Pod) -> bool {
        self.drs_request(pod) > 0
    }

    pub fn annotation(&self, pod: &Pod, key: &str) -> Option<String> {
        pod.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .filter(|v| !v.is_empty())
            .cloned()
    }

    pub fn assigned_minor(&self, pod: &Pod) -> Option<String> {
        self.annotation(pod, &self.base.config.assigned_minor_key())
    }

    /// The pod's recorded request size, falling back to the live container
    /// limits when the annotation is not set yet.
    pub fn request_size(&self, pod: &Pod, drs: bool) -> i64 {
        self.annotation(pod, &self.base.config.request_size_key())
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| {
                if drs {
                    self.drs_request(pod)
                } else {
                    self.shared_request(pod)
                }
            })
    }

    /// Resolves a pod's assigned card, tolerating informer lag: annotation →
    /// the reserve hint → a bounded API re-read → `PodGone` when the pod was
    /// deleted or recreated.
    pub async fn assigned_minor_with_fallback(
        &self,
        pod: &Pod,
        reserve_hint: Option<&ReserveRecord>,
    ) -> AssignedMinor {
        if let Some(minor) = self.assigned_minor(pod) {
            return AssignedMinor::Assigned(minor);
        }
        let uid = pod.metadata.uid.clone().unwrap_or_default();
        let minor_key = self.base.config.assigned_minor_key();
        if let Some(hint) = reserve_hint {
            if hint.pod_uid == uid {
                if let Some(minor) = hint.annotations.get(&minor_key) {
                    warn!(
                        pod = pod.metadata.name.as_deref().unwrap_or_default(),
                        "assigned minor not visible in informer yet, using reserve cache"
                    );
                    return AssignedMinor::Assigned(minor.clone());
                }
            }
        }

        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.base.client.clone(), &namespace);
        for attempt in 0..ANNOTATION_RETRIES {
            tokio::time::sleep(ANNOTATION_BACKOFF).await;
            match api.get(&name).await {
                Ok(fresh) => {
                    if fresh.metadata.uid.as_deref() != Some(uid.as_str()) {
                        warn!(pod = %name, "pod was recreated, skip it");
                        return AssignedMinor::PodGone;
                    }
                    if let Some(minor) = self.assigned_minor(&fresh) {
                        return AssignedMinor::Assigned(minor);
                    }
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    warn!(pod = %name, "pod was deleted, skip it");
                    return AssignedMinor::PodGone;
                }
                Err(e) => warn!(pod = %name, attempt, "re-read pod failed: {e}"),
            }
        }
        AssignedMinor::Missing
    }

    /// Initial per-container allocation records for a DRS pod: one entry per
    /// container requesting the DRS resource, carrying its slice weight.
    pub fn init_assigned_containers(&self, pod: &Pod) -> BTreeMap<String, AllocateRecord> {
        let mut records = BTreeMap::new();
        let Some(spec) = &pod.spec else {
            return records;
        };
        for container in &spec.containers {
            let request = container
                .resources
                .as_ref()
                .and_then(|r| r.limits.as_ref())
                .and_then(|limits| limits.get(&self.base.drs_resource_name))
                .and_then(|q| q.0.parse::<i64>().ok());
            if let Some(request) = request.filter(|r| *r > 0) {
                records.insert(
                    container.name.clone(),
                    AllocateRecord {
                        request: Some(request),
                        ..Default::default()
                    },
                );
            }
        }
        records
    }
}
