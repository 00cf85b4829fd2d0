//! The GCUShareSchedulerPlugin state machine: Filter → Reserve / PreBind →
//! Bind, with a per-workload filter cache and a single-slot reserve cache
//! covering the informer-lag window.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use gcushare_common::config::ASSIGNED_CONTAINERS;
use gcushare_common::config::DRS_ASSIGNED_DEVICE;
use gcushare_common::config::SCHEDULER_PLUGIN_NAME;
use gcushare_common::capacity::profile_prefix;
use gcushare_common::Clock;
use gcushare_common::FilterSpec;
use gcushare_common::GcuSharePod;
use gcushare_common::ResourceConfig;
use gcushare_common::SchedulerRecord;
use k8s_openapi::api::core::v1::Binding;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use serde_json::json;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::coordination::CoordinationRequest;
use crate::framework::NodeInfo;
use crate::framework::Status;
use crate::resources::pod::AssignedMinor;
use crate::resources::node::best_fit;
use crate::resources::BaseResource;
use crate::resources::NodeResource;
use crate::resources::PodResource;
use crate::resources::ReserveRecord;

const PATCH_RETRIES: usize = 30;
const PATCH_BACKOFF: Duration = Duration::from_secs(3);

/// Filter results for one workload, kept from Filter success until Reserve
/// success (shared) or Bind (DRS).
enum FilterEntry {
    Shared {
        /// node name → per-card availability at filter time.
        nodes: HashMap<String, BTreeMap<String, i64>>,
    },
    Drs {
        /// nodes with a live coordination object.
        nodes: BTreeSet<String>,
    },
}

#[derive(Default)]
struct PluginState {
    filter_cache: HashMap<String, FilterEntry>,
    reserve_cache: Option<ReserveRecord>,
}

pub struct GcuSharePlugin {
    config: ResourceConfig,
    client: Client,
    clock: Arc<dyn Clock>,
    pod_resource: PodResource,
    node_resource: NodeResource,
    state: Mutex<PluginState>,
}

impl GcuSharePlugin {
    pub fn new(config: ResourceConfig, client: Client, clock: Arc<dyn Clock>) -> Self {
        let base = BaseResource::new(config.clone(), client.clone());
        Self {
            config,
            client,
            clock,
            pod_resource: PodResource::new(base.clone()),
            node_resource: NodeResource::new(base),
            state: Mutex::new(PluginState::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        SCHEDULER_PLUGIN_NAME
    }

    fn uid(pod: &Pod) -> String {
        pod.metadata.uid.clone().unwrap_or_default()
    }

    fn pod_label(pod: &Pod) -> String {
        format!(
            "{}/{}",
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default()
        )
    }

    fn reserve_hint(&self) -> Option<ReserveRecord> {
        self.state.lock().unwrap().reserve_cache.clone()
    }

    // ---- Filter ----------------------------------------------------------

    pub async fn filter(&self, pod: &Pod, node_info: &NodeInfo) -> Status {
        let label = Self::pod_label(pod);
        info!(pod = %label, node = node_info.name(), "filter starting");

        let shared = self.pod_resource.is_sharing_pod(pod);
        let drs = self.pod_resource.is_drs_pod(pod);
        if !shared && !drs {
            return Status::error(format!(
                "pod {label} does not request {} or {}, please do not assign it to this scheduler",
                self.pod_resource.base.shared_resource_name,
                self.pod_resource.base.drs_resource_name
            ));
        }
        if shared && drs {
            return Status::error(format!(
                "it is not allowed for pod {label} to request {} and {} at the same time",
                self.pod_resource.base.shared_resource_name,
                self.pod_resource.base.drs_resource_name
            ));
        }
        if !self.node_resource.is_gcushare_node(drs, &node_info.node) {
            return Status::unschedulable(format!(
                "node {} is not a gcushare node, skip it",
                node_info.name()
            ));
        }

        if drs {
            self.filter_drs(pod, node_info).await
        } else {
            self.filter_shared(pod, node_info).await
        }
    }

    async fn filter_shared(&self, pod: &Pod, node_info: &NodeInfo) -> Status {
        let hint = self.reserve_hint();
        let available = match self
            .node_resource
            .available_shared(node_info, &self.pod_resource, hint.as_ref())
            .await
        {
            Ok(available) => available,
            Err(e) => return Status::error(format!("{e:?}")),
        };
        let request = self.pod_resource.shared_request(pod);
        info!(
            node = node_info.name(),
            request,
            available = ?available,
            "shared availability computed"
        );
        if !available.values().any(|remaining| *remaining >= request) {
            return Status::unschedulable(format!(
                "pod {} requests {}: {request}, but node {} has insufficient slices",
                Self::pod_label(pod),
                self.pod_resource.base.shared_resource_name,
                node_info.name()
            ));
        }

        let mut state = self.state.lock().unwrap();
        let entry = state
            .filter_cache
            .entry(Self::uid(pod))
            .or_insert_with(|| FilterEntry::Shared {
                nodes: HashMap::new(),
            });
        if let FilterEntry::Shared { nodes } = entry {
            nodes.insert(node_info.name().to_string(), available);
        }
        Status::success()
    }

    async fn filter_drs(&self, pod: &Pod, node_info: &NodeInfo) -> Status {
        // Every requested weight must have a matching profile on this node
        // before the node agent is bothered.
        let capacity = match self.node_resource.drs_capacity(&node_info.node) {
            Ok(capacity) => capacity,
            Err(e) => return Status::unschedulable(format!("{e:?}")),
        };
        let known_prefixes: BTreeSet<String> = capacity
            .profiles
            .keys()
            .filter_map(|name| profile_prefix(name))
            .collect();
        let containers = self.pod_resource.init_assigned_containers(pod);
        for (container, record) in &containers {
            let prefix = format!("{}g", record.request.unwrap_or(0));
            if !known_prefixes.contains(&prefix) {
                return Status::unschedulable(format!(
                    "container {container} requests a {prefix} profile, but node {} offers none",
                    node_info.name()
                ));
            }
        }

        let hint = self.reserve_hint();
        let (available, _) = match self
            .node_resource
            .available_drs(node_info, &self.pod_resource, hint.as_ref())
            .await
        {
            Ok(result) => result,
            Err(e) => return Status::error(format!("{e:?}")),
        };
        let request = self.pod_resource.drs_request(pod);
        if !available.values().any(|remaining| *remaining >= request) {
            return Status::unschedulable(format!(
                "pod {} requests {}: {request}, but node {} has insufficient drs weight",
                Self::pod_label(pod),
                self.pod_resource.base.drs_resource_name,
                node_info.name()
            ));
        }

        // The node agent must exclude cards the shared lane occupies.
        let mut gcu_share_pods = Vec::new();
        for candidate in &node_info.pods {
            if !self.pod_resource.is_sharing_pod(candidate) {
                continue;
            }
            let minor = match self
                .pod_resource
                .assigned_minor_with_fallback(candidate, hint.as_ref())
                .await
            {
                AssignedMinor::Assigned(minor) => minor,
                AssignedMinor::PodGone => continue,
                AssignedMinor::Missing => {
                    return Status::error(format!(
                        "assigned minor not found for pod {}",
                        Self::pod_label(candidate)
                    ));
                }
            };
            gcu_share_pods.push(GcuSharePod {
                name: candidate.metadata.name.clone().unwrap_or_default(),
                namespace: candidate.metadata.namespace.clone().unwrap_or_default(),
                uuid: Self::uid(candidate),
                assigned_minor: minor,
            });
        }

        let request = CoordinationRequest::new(self.client.clone(), pod, node_info.name());
        if let Err(status) = request.create(gcu_share_pods, containers).await {
            request.delete().await;
            return status;
        }
        info!(
            node = node_info.name(),
            "waiting for the node agent to elect a drs device"
        );
        match request.await_filter().await {
            Ok(_) => {
                let mut state = self.state.lock().unwrap();
                let entry = state
                    .filter_cache
                    .entry(Self::uid(pod))
                    .or_insert_with(|| FilterEntry::Drs {
                        nodes: BTreeSet::new(),
                    });
                if let FilterEntry::Drs { nodes } = entry {
                    nodes.insert(node_info.name().to_string());
                }
                Status::success()
            }
            Err(status) => {
                request.delete().await;
                status
            }
        }
    }

    // ---- Reserve ---------------------------------------------------------

    /// Shared lane: elect a card best-fit and patch the reservation onto the
    /// pod. DRS lane: a no-op, since the node agent elected the card during
    /// Filter and PreBind publishes the result.
    pub async fn reserve(&self, pod: &Pod, node_name: &str) -> Status {
        let label = Self::pod_label(pod);
        info!(pod = %label, node = node_name, "reserve starting");
        let uid = Self::uid(pod);

        let available = {
            let state = self.state.lock().unwrap();
            match state.filter_cache.get(&uid) {
                Some(FilterEntry::Drs { .. }) => return Status::success(),
                Some(FilterEntry::Shared { nodes }) => nodes.get(node_name).cloned(),
                None => None,
            }
        };
        let Some(available) = available else {
            return Status::error(format!(
                "internal error: node {node_name} has no cached availability for pod {label}"
            ));
        };

        let request = self.pod_resource.shared_request(pod);
        let Some(minor) = best_fit(&available, request) else {
            return Status::error(format!(
                "internal error: node {node_name} cannot hold pod {label} with available {available:?}"
            ));
        };
        info!(pod = %label, minor = %minor, request, "assigned device to pod");

        let annotations = self.reserve_annotations(&minor, request);
        if let Err(status) = self.patch_pod_annotations(pod, &annotations).await {
            return status;
        }

        let mut state = self.state.lock().unwrap();
        state.reserve_cache = Some(ReserveRecord {
            pod_uid: uid.clone(),
            annotations,
        });
        state.filter_cache.remove(&uid);
        Status::success()
    }

    /// Re-running Reserve after a crash re-patches the same annotations; the
    /// merge patch makes it idempotent.
    fn reserve_annotations(&self, minor: &str, request: i64) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.config.assigned_minor_key(), minor.to_string()),
            (self.config.request_size_key(), request.to_string()),
            (self.config.assigned_key(), "false".to_string()),
            (
                self.config.assigned_time_key(),
                self.clock.now_nanos().to_string(),
            ),
        ])
    }

    /// No rollback: the reservation annotations are idempotent and the next
    /// Filter recomputes availability from them.
    pub fn unreserve(&self, pod: &Pod, node_name: &str) {
        warn!(
            pod = %Self::pod_label(pod),
            node = node_name,
            "unreserve called; reservation left in place for re-filtering"
        );
    }

    // ---- PreBind ---------------------------------------------------------

    /// DRS lane: asks the node agent to materialize instances and publishes
    /// the result onto the pod. Shared lane: nothing left to do.
    pub async fn pre_bind(&self, pod: &Pod, node_name: &str) -> Status {
        let label = Self::pod_label(pod);
        info!(pod = %label, node = node_name, "pre-bind starting");
        let uid = Self::uid(pod);
        let is_drs = {
            let state = self.state.lock().unwrap();
            matches!(state.filter_cache.get(&uid), Some(FilterEntry::Drs { .. }))
        };
        if !is_drs {
            return Status::success();
        }

        let status = self.pre_bind_drs(pod, node_name).await;
        if !status.is_success() {
            warn!(pod = %label, "pre-bind failed, clearing filter cache: {}", status.message);
            self.clear_filter_cache("PreBind", pod).await;
        }
        status
    }

    async fn pre_bind_drs(&self, pod: &Pod, node_name: &str) -> Status {
        let request = CoordinationRequest::new(self.client.clone(), pod, node_name);
        let record = match request.read().await {
            Ok(record) => record,
            Err(status) => return status,
        };
        let Some(filter) = record.filter else {
            return Status::error(format!(
                "coordination object {} has no filter answer",
                request.name
            ));
        };
        if let Err(status) = request.issue_pre_bind(&filter).await {
            return status;
        }
        let record = match request.await_pre_bind().await {
            Ok(record) => record,
            Err(status) => return status,
        };
        match self.publish_drs_assignment(pod, &filter, &record).await {
            Ok(()) => Status::success(),
            Err(status) => status,
        }
    }

    async fn publish_drs_assignment(
        &self,
        pod: &Pod,
        filter: &FilterSpec,
        record: &SchedulerRecord,
    ) -> Result<(), Status> {
        let device = filter.device.clone().unwrap_or_default();
        let containers = record
            .pre_bind
            .as_ref()
            .map(|p| p.containers.clone())
            .unwrap_or_default();
        let device_json = serde_json::to_string(&device)
            .map_err(|e| Status::error(format!("serialize drs device: {e}")))?;
        let containers_json = serde_json::to_string(&containers)
            .map_err(|e| Status::error(format!("serialize assigned containers: {e}")))?;
        let request = self.pod_resource.drs_request(pod);

        let mut annotations = BTreeMap::from([
            (DRS_ASSIGNED_DEVICE.to_string(), device_json),
            (ASSIGNED_CONTAINERS.to_string(), containers_json),
            (self.config.assigned_index_key(), device.index.clone()),
        ]);
        annotations.extend(self.reserve_annotations(&device.minor, request));
        self.patch_pod_annotations(pod, &annotations).await?;

        let mut state = self.state.lock().unwrap();
        state.reserve_cache = Some(ReserveRecord {
            pod_uid: Self::uid(pod),
            annotations,
        });
        Ok(())
    }

    // ---- Bind ------------------------------------------------------------

    pub async fn bind(&self, pod: &Pod, node_name: &str) -> Status {
        let label = Self::pod_label(pod);
        info!(pod = %label, node = node_name, "bind starting");
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let binding = Binding {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            target: k8s_openapi::api::core::v1::ObjectReference {
                kind: Some("Node".to_string()),
                name: Some(node_name.to_string()),
                ..Default::default()
            },
        };
        let data = match serde_json::to_vec(&binding) {
            Ok(data) => data,
            Err(e) => return Status::error(format!("serialize binding: {e}")),
        };
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let result = api
            .create_subresource::<serde_json::Value>("binding", &name, &PostParams::default(), data)
            .await;

        match result {
            Ok(_) => {
                info!(pod = %label, node = node_name, "bound pod to node");
                // The bound node's coordination object lingers: its delete
                // event drives the node agent's instance cleanup. Objects on
                // nodes that were filtered but not elected are removed now.
                let uid = Self::uid(pod);
                let entry = self.state.lock().unwrap().filter_cache.remove(&uid);
                if let Some(FilterEntry::Drs { nodes }) = entry {
                    for node in nodes.iter().filter(|n| *n != node_name) {
                        CoordinationRequest::new(self.client.clone(), pod, node)
                            .delete()
                            .await;
                    }
                }
                Status::success()
            }
            Err(e) => {
                error!(pod = %label, node = node_name, "bind failed: {e}");
                self.clear_filter_cache("Bind", pod).await;
                Status::error(format!("bind pod {label} to node {node_name} failed: {e}"))
            }
        }
    }

    /// Drops the workload's filter entry; for DRS entries the coordination
    /// objects are deleted as well (failure path).
    async fn clear_filter_cache(&self, caller: &str, pod: &Pod) {
        let uid = Self::uid(pod);
        let entry = self.state.lock().unwrap().filter_cache.remove(&uid);
        if let Some(FilterEntry::Drs { nodes }) = entry {
            for node in nodes {
                CoordinationRequest::new(self.client.clone(), pod, &node)
                    .delete()
                    .await;
            }
        }
        info!(caller, pod = %Self::pod_label(pod), "cleared filter cache");
    }

    async fn patch_pod_annotations(
        &self,
        pod: &Pod,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), Status> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "metadata": { "annotations": annotations } });

        let mut last_err = String::new();
        for attempt in 0..PATCH_RETRIES {
            match api
                .patch(&name, &PatchParams::default(), &Patch::Strategic(&patch))
                .await
            {
                Ok(_) => {
                    info!(pod = %name, "patched reservation annotations");
                    return Ok(());
                }
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    info!(pod = %name, "pod gone while patching annotations");
                    return Ok(());
                }
                Err(e) => {
                    error!(pod = %name, attempt, "patch pod annotations failed: {e}");
                    last_err = e.to_string();
                    tokio::time::sleep(PATCH_BACKOFF).await;
                }
            }
        }
        Err(Status::error(format!(
            "patch pod {name} annotations failed after {PATCH_RETRIES} attempts: {last_err}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::Code;
    use gcushare_common::SystemClock;
    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn dummy_client() -> Client {
        Client::try_from(kube::Config::new("http://127.0.0.1:8080".parse().unwrap())).unwrap()
    }

    fn plugin() -> GcuSharePlugin {
        GcuSharePlugin::new(
            ResourceConfig::default(),
            dummy_client(),
            Arc::new(SystemClock),
        )
    }

    fn pod(name: &str, uid: &str, limits: &[(&str, i64)], annotations: &[(&str, &str)]) -> Pod {
        let containers = limits
            .iter()
            .enumerate()
            .map(|(i, (resource, amount))| Container {
                name: format!("c{i}"),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([(
                        (*resource).to_string(),
                        Quantity(amount.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn gcushare_node(name: &str, shared_capacity: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "enflame.com/gcushare".to_string(),
                    "true".to_string(),
                )])),
                annotations: Some(BTreeMap::from([(
                    "enflame.com/gcu-shared-capacity".to_string(),
                    shared_capacity.to_string(),
                )])),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                allocatable: Some(BTreeMap::from([(
                    "enflame.com/shared-gcu".to_string(),
                    Quantity("12".to_string()),
                )])),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn pods_without_managed_resources_are_rejected() {
        let plugin = plugin();
        let pod = pod("p", "uid-1", &[("cpu", 1)], &[]);
        let node_info = NodeInfo {
            node: gcushare_node("node-1", r#"{"0":6}"#),
            pods: vec![],
        };
        let status = plugin.filter(&pod, &node_info).await;
        assert_eq!(status.code, Code::Error);
    }

    #[tokio::test]
    async fn requesting_both_lanes_at_once_is_an_error() {
        let plugin = plugin();
        let pod = pod(
            "p",
            "uid-1",
            &[("enflame.com/shared-gcu", 1), ("enflame.com/drs-gcu", 1)],
            &[],
        );
        let node_info = NodeInfo {
            node: gcushare_node("node-1", r#"{"0":6}"#),
            pods: vec![],
        };
        let status = plugin.filter(&pod, &node_info).await;
        assert_eq!(status.code, Code::Error);
        assert!(status.message.contains("at the same time"));
    }

    #[tokio::test]
    async fn unlabeled_nodes_are_unschedulable() {
        let plugin = plugin();
        let pod = pod("p", "uid-1", &[("enflame.com/shared-gcu", 1)], &[]);
        let mut node = gcushare_node("node-1", r#"{"0":6}"#);
        node.metadata.labels = None;
        let status = plugin.filter(&pod, &NodeInfo { node, pods: vec![] }).await;
        assert_eq!(status.code, Code::Unschedulable);
    }

    #[tokio::test]
    async fn empty_node_passes_filter_and_reserves_best_fit() {
        let plugin = plugin();
        let p1 = pod("p1", "uid-1", &[("enflame.com/shared-gcu", 3)], &[]);
        let node_info = NodeInfo {
            node: gcushare_node("node-1", r#"{"0":6,"1":6}"#),
            pods: vec![],
        };
        let status = plugin.filter(&p1, &node_info).await;
        assert!(status.is_success(), "{}", status.message);

        // The availability snapshot is cached for Reserve.
        let state = plugin.state.lock().unwrap();
        let Some(FilterEntry::Shared { nodes }) = state.filter_cache.get("uid-1") else {
            panic!("expected a shared filter entry");
        };
        assert_eq!(nodes["node-1"], BTreeMap::from([
            ("0".to_string(), 6),
            ("1".to_string(), 6),
        ]));
    }

    #[tokio::test]
    async fn occupied_cards_shrink_availability() {
        let plugin = plugin();
        // p_old holds 4 slices on card 0.
        let p_old = pod(
            "p-old",
            "uid-old",
            &[("enflame.com/shared-gcu", 4)],
            &[
                ("enflame.com/gcu-assigned-minor", "0"),
                ("enflame.com/gcu-request-size", "4"),
            ],
        );
        let p2 = pod("p2", "uid-2", &[("enflame.com/shared-gcu", 2)], &[]);
        let node_info = NodeInfo {
            node: gcushare_node("node-1", r#"{"0":6,"1":6}"#),
            pods: vec![p_old],
        };
        let status = plugin.filter(&p2, &node_info).await;
        assert!(status.is_success(), "{}", status.message);

        let state = plugin.state.lock().unwrap();
        let Some(FilterEntry::Shared { nodes }) = state.filter_cache.get("uid-2") else {
            panic!("expected a shared filter entry");
        };
        // Best fit on {0:2, 1:6} with request 2 picks card 0.
        assert_eq!(best_fit(&nodes["node-1"], 2), Some("0".to_string()));
    }

    #[tokio::test]
    async fn drs_occupied_cards_are_excluded_from_the_shared_lane() {
        let plugin = plugin();
        let drs_pod = pod(
            "d1",
            "uid-d",
            &[("enflame.com/drs-gcu", 3)],
            &[
                ("enflame.com/gcu-assigned-minor", "0"),
                ("enflame.com/gcu-request-size", "3"),
                ("drs-assigned-device", r#"{"index":"0","minor":"0","pciBusID":"0000:21:12.0"}"#),
            ],
        );
        let p = pod("p", "uid-1", &[("enflame.com/shared-gcu", 6)], &[]);
        let node_info = NodeInfo {
            node: gcushare_node("node-1", r#"{"0":6,"1":6}"#),
            pods: vec![drs_pod],
        };
        let status = plugin.filter(&p, &node_info).await;
        assert!(status.is_success());

        let state = plugin.state.lock().unwrap();
        let Some(FilterEntry::Shared { nodes }) = state.filter_cache.get("uid-1") else {
            panic!("expected a shared filter entry");
        };
        assert!(!nodes["node-1"].contains_key("0"));
        assert_eq!(nodes["node-1"]["1"], 6);
    }

    #[tokio::test]
    async fn reserve_cache_covers_the_informer_lag_window() {
        let plugin = plugin();
        // p4 was just reserved on minor 1 but the informer has not seen the
        // patch: the pod carries no annotations.
        let p4 = pod("p4", "uid-4", &[("enflame.com/shared-gcu", 2)], &[]);
        plugin.state.lock().unwrap().reserve_cache = Some(ReserveRecord {
            pod_uid: "uid-4".to_string(),
            annotations: BTreeMap::from([
                ("enflame.com/gcu-assigned-minor".to_string(), "1".to_string()),
                ("enflame.com/gcu-request-size".to_string(), "2".to_string()),
            ]),
        });

        let p5 = pod("p5", "uid-5", &[("enflame.com/shared-gcu", 6)], &[]);
        let node_info = NodeInfo {
            node: gcushare_node("node-1", r#"{"0":6,"1":6}"#),
            pods: vec![p4],
        };
        let status = plugin.filter(&p5, &node_info).await;
        assert!(status.is_success(), "{}", status.message);

        let state = plugin.state.lock().unwrap();
        let Some(FilterEntry::Shared { nodes }) = state.filter_cache.get("uid-5") else {
            panic!("expected a shared filter entry");
        };
        assert_eq!(nodes["node-1"]["1"], 4);
        assert_eq!(nodes["node-1"]["0"], 6);
    }

    #[tokio::test]
    async fn filter_rejects_oversubscription_as_unschedulable() {
        let plugin = plugin();
        let p_old = pod(
            "p-old",
            "uid-old",
            &[("enflame.com/shared-gcu", 5)],
            &[
                ("enflame.com/gcu-assigned-minor", "0"),
                ("enflame.com/gcu-request-size", "5"),
            ],
        );
        let p = pod("p", "uid-1", &[("enflame.com/shared-gcu", 2)], &[]);
        let node_info = NodeInfo {
            node: gcushare_node("node-1", r#"{"0":6}"#),
            pods: vec![p_old],
        };
        let status = plugin.filter(&p, &node_info).await;
        assert_eq!(status.code, Code::Unschedulable);
    }

    #[tokio::test]
    async fn reserve_annotations_carry_the_full_reservation() {
        let plugin = plugin();
        let annotations = plugin.reserve_annotations("0", 3);
        assert_eq!(annotations["enflame.com/gcu-assigned-minor"], "0");
        assert_eq!(annotations["enflame.com/gcu-request-size"], "3");
        assert_eq!(annotations["enflame.com/gcu-assigned"], "false");
        assert!(annotations["enflame.com/gcu-assigned-time"]
            .parse::<u128>()
            .is_ok());
    }
}
