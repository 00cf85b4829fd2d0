//! Node side of the DRS handshake: watches coordination configmaps
//! addressed to this node, elects a card and profile set during the filter
//! phase, and materializes DRS instances during the pre-bind phase.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use futures::FutureExt;
use futures::StreamExt;
use gcushare_common::config::CONFIGMAP_NODE_LABEL;
use gcushare_common::config::CONFIGMAP_OWNER_LABEL;
use gcushare_common::config::DRS_SCHEDULER_NAME;
use gcushare_common::config::SCHEDULER_RECORD_KEY;
use gcushare_common::AllocateRecord;
use gcushare_common::CoordinationName;
use gcushare_common::DeviceRef;
use gcushare_common::KubernetesError;
use gcushare_common::RecordStatus;
use gcushare_common::RequestPhase;
use gcushare_common::SchedulerRecord;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::runtime::watcher::watcher;
use kube::runtime::watcher::Config;
use kube::runtime::watcher::Event;
use kube::Api;
use kube::Client;
use serde_json::json;
use tokio::select;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::hardware::drs;
use crate::hardware::drs::AvailableInstance;
use crate::hardware::HardwareCli;
use crate::hardware::SmiDeviceInfo;
use crate::hardware::VIRT_DISABLE;
use crate::hardware::VIRT_DRS;

/// Filter-phase outcome for one coordination request.
#[derive(Debug, PartialEq, Eq)]
pub enum Selection {
    Selected {
        device: DeviceRef,
        containers: BTreeMap<String, AllocateRecord>,
    },
    Unschedulable(String),
}

/// Elects the card for a DRS request: among candidates not occupied by
/// shared pods and in `DRS` or `Disable` state, the one with the smallest
/// remaining weight that still fits every requested profile.
pub fn select_drs_device(
    cli: &dyn HardwareCli,
    slice_count: i64,
    devices: &[SmiDeviceInfo],
    excluded_minors: &[String],
    minor_of_index: &BTreeMap<String, String>,
    containers: &BTreeMap<String, AllocateRecord>,
) -> Result<Selection, Report<KubernetesError>> {
    let mut pod_request = 0;
    let mut expected_profiles: BTreeMap<String, i64> = BTreeMap::new();
    for record in containers.values() {
        let request = record.request.unwrap_or(0);
        pod_request += request;
        *expected_profiles.entry(format!("{request}g")).or_default() += 1;
    }

    let profiles = drs::profile_template(cli, devices).map_err(|e| {
        Report::new(KubernetesError::ConnectionFailed {
            message: format!("read drs profile template failed: {e:?}"),
        })
    })?;

    let mut selected: Option<(SmiDeviceInfo, i64, BTreeMap<String, AvailableInstance>)> = None;
    for device in devices {
        if device.virt != VIRT_DRS && device.virt != VIRT_DISABLE {
            warn!(index = %device.index, virt = %device.virt, "device virt unusable for drs, skip it");
            continue;
        }
        let minor = minor_of_index.get(&device.index).cloned().unwrap_or_default();
        if excluded_minors.contains(&minor) {
            warn!(index = %device.index, minor = %minor, "device occupied by shared pods, skip it");
            continue;
        }
        let (all_available, available) =
            drs::available_instances(cli, &device.index, &device.virt, slice_count, &profiles)
                .map_err(|e| {
                    Report::new(KubernetesError::ConnectionFailed {
                        message: format!("list drs availability failed: {e:?}"),
                    })
                })?;
        if all_available < pod_request {
            info!(
                index = %device.index,
                available = all_available,
                request = pod_request,
                "device weight insufficient, skip it"
            );
            continue;
        }
        let mut fits = true;
        for (prefix, count) in &expected_profiles {
            let Some(instance) = available.get(prefix) else {
                return Err(Report::new(KubernetesError::AnnotationParse {
                    key: SCHEDULER_RECORD_KEY.to_string(),
                    message: format!(
                        "container requests profile prefix {prefix}, but no such profile exists"
                    ),
                }));
            };
            if *count > instance.available_count {
                warn!(
                    index = %device.index,
                    profile = %instance.profile_name,
                    requested = *count,
                    available = instance.available_count,
                    "profile instances insufficient, skip device"
                );
                fits = false;
                break;
            }
        }
        if !fits {
            continue;
        }
        let better = selected
            .as_ref()
            .is_none_or(|(_, best, _)| all_available < *best);
        if better {
            selected = Some((device.clone(), all_available, available));
        }
    }

    let Some((device, _, available)) = selected else {
        return Ok(Selection::Unschedulable(
            "no device can allocate the requested drs instances".to_string(),
        ));
    };

    // A Disable card enters DRS mode now; the delete handler closes it once
    // the last instance is gone.
    if device.virt == VIRT_DISABLE {
        cli.open_drs(&device.index).map_err(|e| {
            Report::new(KubernetesError::ConnectionFailed {
                message: format!("open drs on device {} failed: {e:?}", device.index),
            })
        })?;
        info!(index = %device.index, "device transitioned from Disable to DRS");
    }

    let mut assigned = containers.clone();
    for record in assigned.values_mut() {
        let prefix = format!("{}g", record.request.unwrap_or(0));
        if let Some(instance) = available.get(&prefix) {
            record.profile_name = Some(instance.profile_name.clone());
            record.profile_id = Some(instance.profile_id.clone());
        }
    }
    let minor = minor_of_index
        .get(&device.index)
        .cloned()
        .unwrap_or_default();
    Ok(Selection::Selected {
        device: DeviceRef {
            index: device.index,
            minor,
            pci_bus_id: device.bus_id,
        },
        containers: assigned,
    })
}

/// The configmap watcher plus its three serialized handlers.
pub struct CoordinationWatcher {
    node_name: String,
    slice_count: i64,
    client: Client,
    cli: Arc<dyn HardwareCli>,
    /// Minor by CLI index, from the startup inventory.
    minor_of_index: BTreeMap<String, String>,
    filter_lock: Mutex<()>,
    pre_bind_lock: Mutex<()>,
    delete_lock: Mutex<()>,
}

impl CoordinationWatcher {
    pub fn new(
        node_name: String,
        slice_count: i64,
        client: Client,
        cli: Arc<dyn HardwareCli>,
        minor_of_index: BTreeMap<String, String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name,
            slice_count,
            client,
            cli,
            minor_of_index,
            filter_lock: Mutex::new(()),
            pre_bind_lock: Mutex::new(()),
            delete_lock: Mutex::new(()),
        })
    }

    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) {
        info!(node = %self.node_name, "starting drs coordination watcher");
        loop {
            select! {
                _ = cancellation_token.cancelled() => {
                    info!("coordination watcher shutdown requested");
                    return;
                }
                result = self.watch_configmaps() => {
                    match result {
                        Ok(()) => warn!("configmap watch stream ended unexpectedly, restarting"),
                        Err(e) => {
                            error!("configmap watch failed: {e:?}");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    async fn watch_configmaps(self: &Arc<Self>) -> Result<(), Report<KubernetesError>> {
        let api: Api<ConfigMap> = Api::all(self.client.clone());
        let config = Config::default().labels(&format!(
            "{CONFIGMAP_NODE_LABEL}={},{CONFIGMAP_OWNER_LABEL}={DRS_SCHEDULER_NAME}",
            self.node_name
        ));
        let mut stream = watcher(api, config).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(cm) | Event::InitApply(cm)) => self.dispatch_apply(cm).await,
                Ok(Event::Delete(cm)) => self.dispatch_delete(cm).await,
                Ok(Event::Init | Event::InitDone) => {}
                Err(e) => {
                    return Err(Report::new(KubernetesError::WatchFailed {
                        kind: "configmaps",
                        message: e.to_string(),
                    }));
                }
            }
        }
        Ok(())
    }

    /// A panic inside one handler must not kill the watcher; the event is
    /// dropped and logged instead.
    async fn dispatch_apply(self: &Arc<Self>, cm: ConfigMap) {
        let this = self.clone();
        let name = cm.metadata.name.clone().unwrap_or_default();
        let result = std::panic::AssertUnwindSafe(async move { this.handle_apply(cm).await })
            .catch_unwind()
            .await;
        if result.is_err() {
            error!(configmap = %name, "recovered from panic in configmap apply handler");
        }
    }

    async fn dispatch_delete(self: &Arc<Self>, cm: ConfigMap) {
        let this = self.clone();
        let name = cm.metadata.name.clone().unwrap_or_default();
        let result = std::panic::AssertUnwindSafe(async move { this.handle_delete(cm).await })
            .catch_unwind()
            .await;
        if result.is_err() {
            error!(configmap = %name, "recovered from panic in configmap delete handler");
        }
    }

    async fn handle_apply(&self, cm: ConfigMap) {
        let Some((name, mut record)) = self.parse_event(&cm) else {
            return;
        };
        match record.phase() {
            RequestPhase::Issued => {
                let _guard = self.filter_lock.lock().await;
                info!(configmap = %name, "start filter handler");
                let (status, message) = match self.gate_pod(&cm, &name).await {
                    Gate::Proceed => self.run_filter(&mut record),
                    Gate::Skip => return,
                    Gate::Fail(message) => (RecordStatus::Error, message),
                };
                let filter = record.filter.get_or_insert_with(Default::default);
                filter.status = Some(status);
                filter.message = message;
                self.patch_record(&cm, &record).await;
                info!(configmap = %name, status = %status, "filter handler finished");
            }
            RequestPhase::PreBindIssued => {
                let _guard = self.pre_bind_lock.lock().await;
                info!(configmap = %name, "start pre-bind handler");
                let (status, message) = match self.gate_pod(&cm, &name).await {
                    Gate::Proceed => self.run_pre_bind(&mut record),
                    Gate::Skip => return,
                    Gate::Fail(message) => (RecordStatus::Error, message),
                };
                let pre_bind = record.pre_bind.get_or_insert_with(Default::default);
                pre_bind.status = Some(status);
                pre_bind.message = message;
                self.patch_record(&cm, &record).await;
                info!(configmap = %name, status = %status, "pre-bind handler finished");
            }
            _ => {}
        }
    }

    fn parse_event(&self, cm: &ConfigMap) -> Option<(CoordinationName, SchedulerRecord)> {
        let cm_name = cm.metadata.name.as_deref().unwrap_or_default();
        let name = CoordinationName::parse(cm_name)?;
        let raw = cm.data.as_ref()?.get(SCHEDULER_RECORD_KEY)?;
        match serde_json::from_str::<SchedulerRecord>(raw) {
            Ok(record) => Some((name, record)),
            Err(e) => {
                error!(configmap = %cm_name, "unmarshal scheduler record failed: {e}");
                None
            }
        }
    }

    /// The pod a coordination object belongs to must still exist and not be
    /// terminating, otherwise the sync is pointless.
    async fn gate_pod(&self, cm: &ConfigMap, name: &CoordinationName) -> Gate {
        let namespace = cm.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(&name.pod_name).await {
            Ok(pod) => {
                if pod.metadata.deletion_timestamp.is_some() {
                    Gate::Fail(format!("pod {} is deleting, skip this sync", name.pod_name))
                } else {
                    Gate::Proceed
                }
            }
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!(pod = %name.pod_name, "pod already deleted, skip this sync");
                Gate::Skip
            }
            Err(e) => Gate::Fail(format!("get pod {} failed: {e}", name.pod_name)),
        }
    }

    fn run_filter(&self, record: &mut SchedulerRecord) -> (RecordStatus, String) {
        let Some(filter) = record.filter.as_mut() else {
            return (RecordStatus::Error, "record has no filter section".to_string());
        };
        let devices = match self.cli.device_report() {
            Ok(devices) => devices,
            Err(e) => return (RecordStatus::Error, format!("device report failed: {e:?}")),
        };
        let excluded: Vec<String> = filter
            .gcu_share_pods
            .iter()
            .map(|pod| pod.assigned_minor.clone())
            .collect();
        match select_drs_device(
            self.cli.as_ref(),
            self.slice_count,
            &devices,
            &excluded,
            &self.minor_of_index,
            &filter.containers,
        ) {
            Ok(Selection::Selected { device, containers }) => {
                info!(
                    index = %device.index,
                    minor = %device.minor,
                    bus_id = %device.pci_bus_id,
                    "selected device for drs allocation"
                );
                filter.device = Some(device);
                filter.containers = containers;
                (RecordStatus::Success, String::new())
            }
            Ok(Selection::Unschedulable(message)) => {
                warn!("{message}");
                (RecordStatus::Unschedulable, message)
            }
            Err(e) => (RecordStatus::Error, format!("{e:?}")),
        }
    }

    fn run_pre_bind(&self, record: &mut SchedulerRecord) -> (RecordStatus, String) {
        let index = record
            .filter
            .as_ref()
            .and_then(|f| f.device.as_ref())
            .map(|d| d.index.clone())
            .unwrap_or_default();
        if index.is_empty() {
            return (
                RecordStatus::Error,
                "pre-bind issued without an elected device".to_string(),
            );
        }
        let Some(pre_bind) = record.pre_bind.as_mut() else {
            return (RecordStatus::Error, "record has no preBind section".to_string());
        };
        for (container, alloc) in pre_bind.containers.iter_mut() {
            let (Some(profile_name), Some(profile_id)) =
                (alloc.profile_name.clone(), alloc.profile_id.clone())
            else {
                return (
                    RecordStatus::Error,
                    format!("container {container} has no profile reference"),
                );
            };
            match drs::create_drs_instance(self.cli.as_ref(), &index, &profile_name, &profile_id) {
                Ok((instance_id, instance_uuid)) => {
                    alloc.instance_id = Some(instance_id);
                    alloc.instance_uuid = Some(instance_uuid);
                }
                Err(e) => {
                    return (
                        RecordStatus::Error,
                        format!("create drs instance for container {container} failed: {e:?}"),
                    );
                }
            }
        }
        (RecordStatus::Success, String::new())
    }

    /// On coordination-object deletion for a deleted pod, free its instances
    /// and close DRS on an emptied card.
    async fn handle_delete(&self, cm: ConfigMap) {
        let Some((name, record)) = self.parse_event(&cm) else {
            return;
        };
        let _guard = self.delete_lock.lock().await;
        info!(configmap = %name.to_string(), "start delete handler");
        let Some(pre_bind) = &record.pre_bind else {
            return;
        };
        let namespace = cm.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(&name.pod_name).await {
            Ok(pod) if pod.metadata.deletion_timestamp.is_none() => {
                info!(pod = %name.pod_name, "pod is not being deleted, skip drs cleanup");
                return;
            }
            Ok(_) => warn!(pod = %name.pod_name, "pod is deleting, clearing drs"),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                warn!(pod = %name.pod_name, "pod already deleted, clearing drs")
            }
            Err(e) => {
                error!(pod = %name.pod_name, "get pod failed, delete handler does nothing: {e}");
                return;
            }
        }

        let index = record
            .filter
            .as_ref()
            .and_then(|f| f.device.as_ref())
            .map(|d| d.index.clone())
            .unwrap_or_default();
        for alloc in pre_bind.containers.values() {
            let Some(instance_id) = &alloc.instance_id else {
                continue;
            };
            match self.cli.destroy_instance(&index, instance_id) {
                Ok(()) => info!(index = %index, instance_id, "deleted drs instance"),
                Err(e) => error!(index = %index, instance_id, "delete drs instance failed: {e:?}"),
            }
        }
        match self.cli.list_instances(&index) {
            Ok(instances) if instances.is_empty() => {
                info!(index = %index, "no drs instances remain, closing drs");
                if let Err(e) = self.cli.close_drs(&index) {
                    error!(index = %index, "close drs failed: {e:?}");
                }
            }
            Ok(_) => {}
            Err(e) => error!(index = %index, "list drs instances failed: {e:?}"),
        }
    }

    async fn patch_record(&self, cm: &ConfigMap, record: &SchedulerRecord) {
        let name = cm.metadata.name.as_deref().unwrap_or_default();
        let namespace = cm.metadata.namespace.as_deref().unwrap_or("default");
        let content = match serde_json::to_string(record) {
            Ok(content) => content,
            Err(e) => {
                error!(configmap = %name, "serialize scheduler record failed: {e}");
                return;
            }
        };
        let patch = json!({ "data": { SCHEDULER_RECORD_KEY: content } });
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => info!(configmap = %name, "patched scheduler record"),
            Err(e) => error!(configmap = %name, "patch scheduler record failed: {e}"),
        }
    }
}

enum Gate {
    Proceed,
    Skip,
    Fail(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::fake::FakeHardware;
    use crate::hardware::Instance;
    use crate::hardware::ProfileSpec;

    fn device(index: &str, virt: &str) -> SmiDeviceInfo {
        SmiDeviceInfo {
            index: index.to_string(),
            product: "T20".to_string(),
            bus_id: format!("2{index}:12.0"),
            l3_memory_mb: 49152,
            virt: virt.to_string(),
        }
    }

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

    fn containers(requests: &[(&str, i64)]) -> BTreeMap<String, AllocateRecord> {
        requests
            .iter()
            .map(|(name, request)| {
                (
                    (*name).to_string(),
                    AllocateRecord {
                        request: Some(*request),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    fn minors(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(index, minor)| ((*index).to_string(), (*minor).to_string()))
            .collect()
    }

    #[test]
    fn elects_a_disabled_card_and_opens_drs() {
        let cli = FakeHardware::with_devices(vec![device("0", "Disable")]);
        cli.state.lock().unwrap().profiles = profiles();

        let devices = cli.device_report().unwrap();
        let selection = select_drs_device(
            &cli,
            6,
            &devices,
            &[],
            &minors(&[("0", "0")]),
            &containers(&[("c1", 1), ("c2", 3)]),
        )
        .unwrap();

        let Selection::Selected { device, containers } = selection else {
            panic!("expected a selection");
        };
        assert_eq!(device.index, "0");
        assert_eq!(device.minor, "0");
        assert_eq!(containers["c1"].profile_name.as_deref(), Some("1g.8gb"));
        assert_eq!(containers["c1"].profile_id.as_deref(), Some("id1"));
        assert_eq!(containers["c2"].profile_name.as_deref(), Some("3g.24gb"));
        // Disable → DRS transition happened exactly once for the selection
        // (the profile scan's scoped open/close happens first).
        assert_eq!(cli.state.lock().unwrap().open_calls.last().unwrap(), "0");
        let report = cli.device_report().unwrap();
        assert_eq!(report[0].virt, "DRS");
    }

    #[test]
    fn prefers_the_tightest_fitting_card() {
        let cli = FakeHardware::with_devices(vec![device("0", "DRS"), device("1", "DRS")]);
        {
            let mut state = cli.state.lock().unwrap();
            state.profiles = profiles();
            // Card 0 already lost 3 slices, leaving 3: the tighter fit for a
            // 3-slice request.
            state.instances.push(Instance {
                index: "0".to_string(),
                profile_name: "3g.24gb".to_string(),
                instance_id: "5".to_string(),
                uuid: "uuid-5".to_string(),
            });
        }
        let devices = cli.device_report().unwrap();
        let selection = select_drs_device(
            &cli,
            6,
            &devices,
            &[],
            &minors(&[("0", "0"), ("1", "1")]),
            &containers(&[("c1", 3)]),
        )
        .unwrap();
        let Selection::Selected { device, .. } = selection else {
            panic!("expected a selection");
        };
        assert_eq!(device.index, "0");
    }

    #[test]
    fn shared_occupied_cards_are_excluded() {
        let cli = FakeHardware::with_devices(vec![device("0", "Disable")]);
        cli.state.lock().unwrap().profiles = profiles();
        let devices = cli.device_report().unwrap();
        let selection = select_drs_device(
            &cli,
            6,
            &devices,
            &["0".to_string()],
            &minors(&[("0", "0")]),
            &containers(&[("c1", 1)]),
        )
        .unwrap();
        assert!(matches!(selection, Selection::Unschedulable(_)));
    }

    #[test]
    fn unknown_profile_prefix_is_an_error() {
        let cli = FakeHardware::with_devices(vec![device("0", "Disable")]);
        cli.state.lock().unwrap().profiles = profiles();
        let devices = cli.device_report().unwrap();
        let result = select_drs_device(
            &cli,
            6,
            &devices,
            &[],
            &minors(&[("0", "0")]),
            &containers(&[("c1", 5)]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn insufficient_weight_is_unschedulable() {
        let cli = FakeHardware::with_devices(vec![device("0", "DRS")]);
        {
            let mut state = cli.state.lock().unwrap();
            state.profiles = profiles();
            for i in 0..2 {
                state.instances.push(Instance {
                    index: "0".to_string(),
                    profile_name: "3g.24gb".to_string(),
                    instance_id: i.to_string(),
                    uuid: format!("uuid-{i}"),
                });
            }
        }
        let devices = cli.device_report().unwrap();
        let selection = select_drs_device(
            &cli,
            6,
            &devices,
            &[],
            &minors(&[("0", "0")]),
            &containers(&[("c1", 1)]),
        )
        .unwrap();
        assert!(matches!(selection, Selection::Unschedulable(_)));
    }
}
