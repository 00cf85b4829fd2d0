//! Per-node cache of pods holding shared or DRS slices, fed by a pod watch.
//! Removal of a DRS holder triggers instance cleanup against the hardware.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use error_stack::Report;
use futures::StreamExt;
use gcushare_common::config::ASSIGNED_CONTAINERS;
use gcushare_common::AllocateRecord;
use gcushare_common::KubernetesError;
use gcushare_common::ResourceConfig;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::hardware::HardwareCli;
use crate::hardware::Pci;
use crate::inventory::SharedInventory;

/// Total managed-resource request of a pod, summed over container limits.
pub fn pod_request(pod: &Pod, resource_name: &str) -> i64 {
    let Some(spec) = &pod.spec else {
        return 0;
    };
    spec.containers
        .iter()
        .filter_map(|c| c.resources.as_ref())
        .filter_map(|r| r.limits.as_ref())
        .filter_map(|limits| limits.get(resource_name))
        .filter_map(|quantity| quantity.0.parse::<i64>().ok())
        .sum()
}

pub fn pod_uid(pod: &Pod) -> String {
    pod.metadata.uid.clone().unwrap_or_default()
}

pub fn pod_name(pod: &Pod) -> String {
    pod.metadata.name.clone().unwrap_or_default()
}

fn annotations(pod: &Pod) -> BTreeMap<String, String> {
    pod.metadata.annotations.clone().unwrap_or_default()
}

/// The watch-maintained pod set; split from the watcher so event application
/// is testable without a cluster.
pub struct PodSet {
    shared_resource: String,
    drs_resource: String,
    pods: DashMap<String, Pod>,
}

/// What the caller must do after an event was applied.
#[derive(Debug, PartialEq)]
pub enum CacheAction {
    None,
    /// A DRS holder left the node; its instances need cleanup.
    CleanupDrs(Box<Pod>),
}

impl PodSet {
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            shared_resource: config.shared_resource_name(),
            drs_resource: config.drs_resource_name(),
            pods: DashMap::new(),
        }
    }

    pub fn shared_request(&self, pod: &Pod) -> i64 {
        pod_request(pod, &self.shared_resource)
    }

    pub fn drs_request(&self, pod: &Pod) -> i64 {
        pod_request(pod, &self.drs_resource)
    }

    /// Insert on first sight, replace only when annotations changed.
    pub fn apply(&self, pod: Pod) {
        let uid = pod_uid(&pod);
        if uid.is_empty() {
            return;
        }
        if let Some(existing) = self.pods.get(&uid) {
            if annotations(&existing) == annotations(&pod) {
                return;
            }
            drop(existing);
            info!(pod = %pod_name(&pod), uid = %uid, "update pod in gcushare pods cache");
            self.pods.insert(uid, pod);
            return;
        }
        if self.shared_request(&pod) <= 0 && self.drs_request(&pod) <= 0 {
            return;
        }
        info!(pod = %pod_name(&pod), uid = %uid, "add pod to gcushare pods cache");
        self.pods.insert(uid, pod);
    }

    pub fn remove(&self, pod: &Pod) -> CacheAction {
        let uid = pod_uid(pod);
        let Some((_, cached)) = self.pods.remove(&uid) else {
            return CacheAction::None;
        };
        info!(pod = %pod_name(pod), uid = %uid, "remove pod from gcushare pods cache");
        if self.drs_request(&cached) > 0 {
            CacheAction::CleanupDrs(Box::new(cached))
        } else {
            CacheAction::None
        }
    }

    /// Snapshot of the cached pods.
    pub fn snapshot(&self) -> Vec<Pod> {
        self.pods.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Shared-lane usage per card minor, from the `assigned-minor` and
    /// `request-size` annotations.
    pub fn shared_used_by_minor(&self, config: &ResourceConfig) -> BTreeMap<String, i64> {
        let minor_key = config.assigned_minor_key();
        let mut used = BTreeMap::new();
        for entry in self.pods.iter() {
            let pod = entry.value();
            let request = self.shared_request(pod);
            if request <= 0 {
                continue;
            }
            if let Some(minor) = annotations(pod).get(&minor_key) {
                *used.entry(minor.clone()).or_default() += request;
            }
        }
        used
    }
}

/// Parses the `assigned-containers` annotation.
pub fn assigned_containers(
    pod: &Pod,
) -> Result<BTreeMap<String, AllocateRecord>, Report<KubernetesError>> {
    let Some(raw) = annotations(pod).get(ASSIGNED_CONTAINERS).cloned() else {
        return Ok(BTreeMap::new());
    };
    serde_json::from_str(&raw).map_err(|e| {
        Report::new(KubernetesError::AnnotationParse {
            key: ASSIGNED_CONTAINERS.to_string(),
            message: e.to_string(),
        })
    })
}

/// Watches this node's pods and keeps the [`PodSet`] fresh.
pub struct PodCache {
    pub set: Arc<PodSet>,
    config: ResourceConfig,
    node_name: String,
    client: Client,
    cli: Arc<dyn HardwareCli>,
    pci: Arc<dyn Pci>,
    inventory: SharedInventory,
}

impl PodCache {
    pub fn new(
        config: ResourceConfig,
        node_name: String,
        client: Client,
        cli: Arc<dyn HardwareCli>,
        pci: Arc<dyn Pci>,
        inventory: SharedInventory,
    ) -> Self {
        Self {
            set: Arc::new(PodSet::new(&config)),
            config,
            node_name,
            client,
            cli,
            pci,
            inventory,
        }
    }

    pub async fn run(&self, cancellation_token: CancellationToken) {
        info!(node = %self.node_name, "starting gcushare pod cache");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("pod cache shutdown requested");
                    break;
                }
                result = self.watch_pods() => {
                    match result {
                        Ok(()) => warn!("pod watch stream ended unexpectedly, restarting"),
                        Err(e) => {
                            error!("pod watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    async fn watch_pods(&self) -> Result<(), Report<KubernetesError>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let config = Config::default().fields(&format!("spec.nodeName={}", self.node_name));
        let mut stream = watcher(api, config).boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(pod) | Event::InitApply(pod)) => self.set.apply(pod),
                Ok(Event::Delete(pod)) => {
                    if let CacheAction::CleanupDrs(removed) = self.set.remove(&pod) {
                        self.cleanup_drs(&removed);
                    }
                }
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        kind: "pods",
                        message: e.to_string(),
                    }));
                }
            }
        }
        Ok(())
    }

    /// Deletes the DRS instances a removed pod held; closes DRS on the card
    /// once it is empty. Skipped entirely when the card's PCI path is gone:
    /// there is no hardware left to free.
    fn cleanup_drs(&self, pod: &Pod) {
        let ann = annotations(pod);
        let minor = ann
            .get(&self.config.assigned_minor_key())
            .cloned()
            .unwrap_or_default();
        if let Some(card) = self.inventory.cards.get(&minor) {
            if !self.pci.device_present(&card.bus_id) {
                warn!(
                    bus_id = %card.bus_id,
                    "device pci path gone, need not clear drs instances"
                );
                return;
            }
        }
        let Some(index) = ann.get(&self.config.assigned_index_key()) else {
            warn!(pod = %pod_name(pod), "drs pod removed without assigned index annotation");
            return;
        };

        let records = match assigned_containers(pod) {
            Ok(records) => records,
            Err(e) => {
                error!(pod = %pod_name(pod), "unmarshal assigned containers failed: {e:?}");
                return;
            }
        };
        for record in records.values() {
            let Some(instance_id) = &record.instance_id else {
                continue;
            };
            match self.cli.destroy_instance(index, instance_id) {
                Ok(()) => info!(index, instance_id, "deleted drs instance"),
                Err(e) => error!(index, instance_id, "delete drs instance failed: {e:?}"),
            }
        }

        match self.cli.list_instances(index) {
            Ok(instances) if instances.is_empty() => {
                info!(index, "no drs instances remain, closing drs");
                if let Err(e) = self.cli.close_drs(index) {
                    error!(index, "close drs failed: {e:?}");
                }
            }
            Ok(_) => {}
            Err(e) => error!(index, "list drs instances failed: {e:?}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    /// Builds a pod with one container per `(resource, amount)` entry.
    pub fn pod_with_containers(
        name: &str,
        uid: &str,
        containers: &[(&str, &str, i64)],
        annotations: &[(&str, &str)],
    ) -> Pod {
        let containers = containers
            .iter()
            .map(|(container_name, resource, amount)| Container {
                name: (*container_name).to_string(),
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
}
