//! The kubelet-facing device-plugin endpoint: one gRPC server per lane over
//! a Unix socket, serving ListAndWatch and Allocate for the advertised fake
//! devices.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::Device;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use device_plugin_pb::api::RegisterRequest;
use device_plugin_pb::HEALTHY;
use device_plugin_pb::KUBELET_SOCKET;
use device_plugin_pb::UNHEALTHY;
use futures::Stream;
use gcushare_common::config::ASSIGNED_CONTAINERS;
use gcushare_common::AllocateRecord;
use gcushare_common::ResourceConfig;
use hyper_util::rt::TokioIo;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Api;
use kube::Client;
use serde_json::json;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::health::DeviceStates;
use crate::hardware::Pci;
use crate::inventory::SharedInventory;
use crate::kubelet::KubeletClient;
use crate::node::NodeResource;
use crate::pod_cache::pod_name;
use crate::pod_cache::pod_request;
use crate::pod_cache::pod_uid;
use crate::pod_cache::PodSet;

/// 4 MiB is the gRPC default; 32 MiB accommodates the largest node reports.
const GRPC_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;
const KUBELET_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const POD_LIST_RETRIES: usize = 30;
const POD_LIST_BACKOFF: Duration = Duration::from_secs(1);

pub const ENFLAME_VISIBLE_DEVICES: &str = "ENFLAME_VISIBLE_DEVICES";
pub const TOPS_VISIBLE_DEVICES: &str = "TOPS_VISIBLE_DEVICES";
pub const ENFLAME_CONTAINER_SUB_CARD: &str = "ENFLAME_CONTAINER_SUB_CARD";
pub const ENFLAME_CONTAINER_USABLE_PROCESSOR: &str = "ENFLAME_CONTAINER_USABLE_PROCESSOR";
pub const ENFLAME_CONTAINER_USABLE_SHARED_MEM: &str = "ENFLAME_CONTAINER_USABLE_SHARED_MEM";
pub const ENFLAME_CONTAINER_USABLE_GLOBAL_MEM: &str = "ENFLAME_CONTAINER_USABLE_GLOBAL_MEM";

/// The two allocation modes. Each active lane runs its own endpoint on its
/// own socket; a card never serves both at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Shared,
    Drs,
}

impl Lane {
    pub fn socket_name(self, component: &str) -> String {
        match self {
            Self::Shared => format!("{component}.sock"),
            Self::Drs => format!("{component}-drs.sock"),
        }
    }

    pub fn resource_name(self, config: &ResourceConfig) -> String {
        config.resource_name(matches!(self, Self::Drs))
    }
}

/// One lane's device-plugin endpoint.
pub struct PluginEndpoint {
    pub lane: Lane,
    config: ResourceConfig,
    resource_name: String,
    resource_isolation: bool,
    inventory: SharedInventory,
    states: Arc<DeviceStates>,
    pod_set: Arc<PodSet>,
    node_resource: Arc<NodeResource>,
    pci: Arc<dyn Pci>,
    client: Client,
    node_name: String,
    kubelet: Option<Arc<KubeletClient>>,
    /// Taken by the first ListAndWatch stream.
    unhealthy_rx: Mutex<Option<mpsc::Receiver<Vec<String>>>>,
    all_locked_tx: mpsc::Sender<BTreeSet<String>>,
    /// Health value last reported to the kubelet, per fake device id.
    last_sent: std::sync::Mutex<BTreeMap<String, String>>,
    /// Capacity map last patched onto the node annotation.
    capacity_cache: std::sync::Mutex<BTreeMap<String, i64>>,
    /// Serializes candidate selection across Allocate calls.
    allocate_lock: Mutex<()>,
}

#[allow(clippy::too_many_arguments)]
impl PluginEndpoint {
    pub fn new(
        lane: Lane,
        config: ResourceConfig,
        resource_isolation: bool,
        inventory: SharedInventory,
        states: Arc<DeviceStates>,
        pod_set: Arc<PodSet>,
        node_resource: Arc<NodeResource>,
        pci: Arc<dyn Pci>,
        client: Client,
        node_name: String,
        kubelet: Option<Arc<KubeletClient>>,
        unhealthy_rx: mpsc::Receiver<Vec<String>>,
        all_locked_tx: mpsc::Sender<BTreeSet<String>>,
    ) -> Arc<Self> {
        let resource_name = lane.resource_name(&config);
        let last_sent = states
            .snapshot()
            .into_iter()
            .map(|(id, healthy)| (id, health_str(healthy).to_string()))
            .collect();
        Arc::new(Self {
            lane,
            config,
            resource_name,
            resource_isolation,
            inventory,
            states,
            pod_set,
            node_resource,
            pci,
            client,
            node_name,
            kubelet,
            unhealthy_rx: Mutex::new(Some(unhealthy_rx)),
            all_locked_tx,
            last_sent: std::sync::Mutex::new(last_sent),
            capacity_cache: std::sync::Mutex::new(BTreeMap::new()),
            allocate_lock: Mutex::new(()),
        })
    }

    /// Binds the lane socket and serves the gRPC service.
    pub async fn serve(
        self: &Arc<Self>,
        socket_path: &Path,
        cancellation_token: CancellationToken,
    ) -> anyhow::Result<()> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        info!(socket = %socket_path.display(), resource = %self.resource_name, "device plugin listening");

        let service = DevicePluginServer::new(PluginService(self.clone()))
            .max_decoding_message_size(GRPC_MAX_MESSAGE_SIZE)
            .max_encoding_message_size(GRPC_MAX_MESSAGE_SIZE);
        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        cancellation_token.cancelled().await;
                        info!("shutting down device plugin gRPC server");
                    },
                )
                .await;
            if let Err(e) = result {
                error!("device plugin gRPC server failed: {e}");
            }
        });
        Ok(())
    }

    /// Registers this endpoint with the kubelet once the socket answers.
    pub async fn register(&self, socket_name: &str) -> anyhow::Result<()> {
        info!(kubelet = KUBELET_SOCKET, endpoint = socket_name, "registering device plugin");
        let channel = uds_channel(KUBELET_SOCKET).await?;
        let mut client = RegistrationClient::new(channel)
            .max_decoding_message_size(GRPC_MAX_MESSAGE_SIZE)
            .max_encoding_message_size(GRPC_MAX_MESSAGE_SIZE);
        let request = RegisterRequest {
            version: device_plugin_pb::VERSION.to_string(),
            endpoint: socket_name.to_string(),
            resource_name: self.resource_name.clone(),
            options: Some(DevicePluginOptions::default()),
        };
        client.register(Request::new(request)).await?;
        info!(resource = %self.resource_name, "registered device plugin with kubelet");
        Ok(())
    }

    fn device_list(&self) -> Vec<Device> {
        self.states
            .snapshot()
            .into_iter()
            .map(|(id, healthy)| Device {
                id,
                health: health_str(healthy).to_string(),
                topology: None,
            })
            .collect()
    }

    /// Re-publishes the lane capacity annotation when the healthy counts
    /// changed.
    async fn update_capacity(&self) {
        let capacity = self.states.healthy_count_by_card();
        {
            let mut cache = self.capacity_cache.lock().unwrap();
            if *cache == capacity {
                return;
            }
            *cache = capacity.clone();
        }
        let result = match self.lane {
            Lane::Shared => self.node_resource.patch_shared_capacity(&capacity).await,
            Lane::Drs => {
                self.node_resource
                    .patch_drs_capacity(&capacity, &self.inventory)
                    .await
            }
        };
        if let Err(e) = result {
            error!("patch capacity annotation failed: {e:?}");
        }
    }

    /// Cards whose PCI path is gone but that still carry bound workloads,
    /// with the bound slice count.
    fn disabled_card_info(&self) -> BTreeMap<String, i64> {
        let used = self.pod_set.shared_used_by_minor(&self.config);
        let mut disabled = BTreeMap::new();
        for (minor, used) in used {
            let Some(card) = self.inventory.cards.get(&minor) else {
                continue;
            };
            if self.pci.device_present(&card.bus_id) {
                continue;
            }
            warn!(minor = %minor, used, "pods are using a disabled card");
            disabled.insert(minor, used);
        }
        disabled
    }

    /// Lockout policy: on a disabled card exactly `used` slices stay healthy
    /// (the ones the kubelet already handed out), everything else is
    /// silenced. A fully claimed card is reported on the `allLocked` channel
    /// so the health watcher keeps it silenced.
    async fn apply_lockout(&self) {
        let mut all_locked = BTreeSet::new();
        for (minor, used) in self.disabled_card_info() {
            let ids = self.states.ids_of_card(&minor);
            let slice_count = ids.len() as i64;
            let used = used.min(slice_count);

            let mut healthy: Vec<String> = ids
                .iter()
                .filter(|id| self.states.is_healthy(id))
                .cloned()
                .collect();
            let mut unhealthy: Vec<String> = ids
                .iter()
                .filter(|id| !self.states.is_healthy(id))
                .cloned()
                .collect();
            while healthy.len() as i64 > used {
                let id = healthy.pop().expect("non-empty");
                self.states.set(&id, false);
            }
            while (healthy.len() as i64) < used {
                let Some(id) = unhealthy.pop() else { break };
                self.states.set(&id, true);
                healthy.push(id);
            }
            if used == slice_count {
                all_locked.insert(minor);
            }
        }
        if !all_locked.is_empty() {
            warn!(cards = ?all_locked, "all slices of disabled cards are claimed, locking");
            let _ = self.all_locked_tx.send(all_locked).await;
        }
    }

    /// Whether the state differs from the last list sent to the kubelet.
    fn needs_send(&self) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap();
        let mut changed = false;
        for (id, healthy) in self.states.snapshot() {
            let health = health_str(healthy).to_string();
            if last_sent.get(&id) != Some(&health) {
                last_sent.insert(id, health);
                changed = true;
            }
        }
        changed
    }

    /// Pending pods of this node that the scheduler already reserved,
    /// oldest reservation first.
    async fn candidate_pods(&self) -> Result<Vec<Pod>, Status> {
        let all_pods = self.pending_pods().await?;
        let time_key = self.config.assigned_time_key();
        let mut candidates: Vec<Pod> = all_pods
            .into_iter()
            .filter(|pod| {
                if pod_request(pod, &self.resource_name) <= 0 {
                    return false;
                }
                let reserved = pod
                    .metadata
                    .annotations
                    .as_ref()
                    .is_some_and(|a| a.contains_key(&time_key));
                if !reserved {
                    warn!(pod = %pod_name(pod), "pod not yet reserved by the scheduler plugin, skip it");
                }
                reserved
            })
            .collect();
        candidates.sort_by_key(|pod| assigned_time(pod, &time_key));
        Ok(candidates)
    }

    async fn pending_pods(&self) -> Result<Vec<Pod>, Status> {
        if let Some(kubelet) = &self.kubelet {
            for attempt in 0..POD_LIST_RETRIES {
                match kubelet.list_node_pods().await {
                    Ok(pods) => {
                        let pending: Vec<Pod> = pods
                            .into_iter()
                            .filter(|pod| {
                                pod.status
                                    .as_ref()
                                    .and_then(|s| s.phase.as_deref())
                                    .is_some_and(|phase| phase == "Pending")
                            })
                            .collect();
                        if !pending.is_empty() {
                            return Ok(pending);
                        }
                        warn!(attempt, "no pending pod from kubelet yet, retrying");
                    }
                    Err(e) => warn!(attempt, "kubelet pod list failed: {e:?}"),
                }
                tokio::time::sleep(POD_LIST_BACKOFF).await;
            }
            warn!("kubelet pod list exhausted retries, falling back to the API server");
        }
        self.pending_pods_from_api().await
    }

    async fn pending_pods_from_api(&self) -> Result<Vec<Pod>, Status> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!(
            "spec.nodeName={},status.phase=Pending",
            self.node_name
        ));
        let mut last_err = String::new();
        for attempt in 0..POD_LIST_RETRIES {
            match api.list(&params).await {
                Ok(list) => return Ok(list.items),
                Err(e) => {
                    warn!(attempt, "pending pod list from api server failed: {e}");
                    last_err = e.to_string();
                }
            }
            tokio::time::sleep(POD_LIST_BACKOFF).await;
        }
        Err(Status::internal(format!(
            "list pending pods failed: {last_err}"
        )))
    }

    /// Marks the matched container allocated and patches the pod. Returns
    /// the selected pod and its instance uuid (DRS lane).
    async fn bind_candidate(
        &self,
        container_req: i64,
    ) -> Result<(Pod, Option<String>), Status> {
        let candidates = self.candidate_pods().await?;
        for pod in candidates {
            let binding = try_bind_container(&pod, &self.resource_name, container_req)
                .map_err(Status::internal)?;
            let Some(binding) = binding else {
                continue;
            };
            info!(
                pod = %pod_name(&pod),
                uid = %pod_uid(&pod),
                container = %binding.container_name,
                request = container_req,
                "selected candidate pod for allocation"
            );
            self.patch_assigned_containers(&pod, &binding).await?;
            return Ok((pod, binding.instance_uuid));
        }
        Err(Status::internal(format!(
            "no pod request {}: {container_req}",
            self.resource_name
        )))
    }

    async fn patch_assigned_containers(
        &self,
        pod: &Pod,
        binding: &ContainerBinding,
    ) -> Result<(), Status> {
        let records = serde_json::to_string(&binding.records)
            .map_err(|e| Status::internal(format!("serialize assigned containers: {e}")))?;
        let assigned = if binding.all_assigned {
            "true"
        } else {
            pod.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(&self.config.assigned_key()))
                .map(String::as_str)
                .unwrap_or("false")
        };
        let patch = json!({
            "metadata": { "annotations": {
                self.config.assigned_key(): assigned,
                ASSIGNED_CONTAINERS: records,
            }}
        });
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &pod_name(pod),
            &PatchParams::default(),
            &Patch::Strategic(&patch),
        )
        .await
        .map_err(|e| Status::internal(format!("patch pod annotations failed: {e}")))?;
        info!(pod = %pod_name(pod), assigned, "patched assigned containers");
        Ok(())
    }

    fn container_envs(
        &self,
        minor: &str,
        container_req: i64,
        instance_uuid: Option<&str>,
    ) -> Result<BTreeMap<String, String>, Status> {
        let mut envs = BTreeMap::new();
        envs.insert(ENFLAME_VISIBLE_DEVICES.to_string(), minor.to_string());
        if let Some(uuid) = instance_uuid {
            envs.insert(TOPS_VISIBLE_DEVICES.to_string(), format!("DRS-{uuid}"));
        }
        if !self.resource_isolation {
            warn!("resource isolation is disabled, which may cause resource conflicts");
            return Ok(envs);
        }
        let card = self
            .inventory
            .cards
            .get(minor)
            .ok_or_else(|| Status::internal(format!("unknown card minor: {minor}")))?;
        let slice_count = self.inventory.slice_count;
        envs.insert(
            ENFLAME_CONTAINER_SUB_CARD.to_string(),
            (container_req < slice_count).to_string(),
        );
        envs.insert(
            ENFLAME_CONTAINER_USABLE_PROCESSOR.to_string(),
            (card.sip_count * container_req / slice_count).to_string(),
        );
        envs.insert(
            ENFLAME_CONTAINER_USABLE_SHARED_MEM.to_string(),
            (card.l2_memory_mb * container_req / slice_count).to_string(),
        );
        envs.insert(
            ENFLAME_CONTAINER_USABLE_GLOBAL_MEM.to_string(),
            (card.l3_memory_gb * container_req / slice_count).to_string(),
        );
        Ok(envs)
    }
}

fn health_str(healthy: bool) -> &'static str {
    if healthy {
        HEALTHY
    } else {
        UNHEALTHY
    }
}

/// Nanosecond reservation timestamp, zero when absent or malformed.
pub fn assigned_time(pod: &Pod, time_key: &str) -> u128 {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(time_key))
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Result of matching an Allocate request against one pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerBinding {
    pub container_name: String,
    /// Updated records, with the selected container marked allocated.
    pub records: BTreeMap<String, AllocateRecord>,
    /// True when this was the pod's last unbound container.
    pub all_assigned: bool,
    pub instance_uuid: Option<String>,
}

/// Finds an unbound container of `pod` whose limit equals the request and
/// marks it allocated. `Ok(None)` when no container of this pod matches.
pub fn try_bind_container(
    pod: &Pod,
    resource_name: &str,
    container_req: i64,
) -> Result<Option<ContainerBinding>, String> {
    let mut records: BTreeMap<String, AllocateRecord> = match pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ASSIGNED_CONTAINERS))
    {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| format!("unmarshal assigned containers of pod {}: {e}", pod_name(pod)))?,
        None => BTreeMap::new(),
    };

    let Some(spec) = &pod.spec else {
        return Ok(None);
    };
    let mut requesting = 0;
    let mut already_allocated = 0;
    let mut selected = None;
    for container in &spec.containers {
        let limit = container
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .and_then(|limits| limits.get(resource_name))
            .and_then(|q| q.0.parse::<i64>().ok());
        let Some(limit) = limit else { continue };
        requesting += 1;
        if records
            .get(&container.name)
            .and_then(|r| r.kubelet_allocated)
            .unwrap_or(false)
        {
            already_allocated += 1;
            continue;
        }
        if limit == container_req && selected.is_none() {
            selected = Some(container.name.clone());
        }
    }
    let Some(container_name) = selected else {
        return Ok(None);
    };

    let record = records.entry(container_name.clone()).or_default();
    record.kubelet_allocated = Some(true);
    let instance_uuid = record.instance_uuid.clone();
    let all_assigned = requesting - already_allocated == 1;
    Ok(Some(ContainerBinding {
        container_name,
        records,
        all_assigned,
        instance_uuid,
    }))
}

/// Dials a Unix socket with the registration timeout.
async fn uds_channel(socket_path: &str) -> anyhow::Result<tonic::transport::Channel> {
    let socket_path = socket_path.to_string();
    let endpoint = Endpoint::from_static("http://localhost").connect_timeout(KUBELET_DIAL_TIMEOUT);
    let connect = endpoint
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }));
    let channel = tokio::time::timeout(KUBELET_DIAL_TIMEOUT, connect).await??;
    Ok(channel)
}

/// gRPC service wrapper; the endpoint lives behind an `Arc` so the
/// ListAndWatch task can outlive the call that spawned it.
pub struct PluginService(pub Arc<PluginEndpoint>);

#[tonic::async_trait]
impl DevicePlugin for PluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(resource = %self.0.resource_name, "kubelet opened ListAndWatch");
        let mut unhealthy_rx = self
            .0
            .unhealthy_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Status::failed_precondition("ListAndWatch already active"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        // Initial list, then one update per health batch that changed state.
        let _ = tx.send(Ok(ListAndWatchResponse {
            devices: self.0.device_list(),
        }));

        let endpoint = self.0.clone();
        tokio::spawn(async move {
            while let Some(batch) = unhealthy_rx.recv().await {
                for id in &batch {
                    endpoint.states.toggle(id);
                }
                endpoint.update_capacity().await;
                endpoint.apply_lockout().await;
                if !endpoint.needs_send() {
                    info!("device states unchanged, skip ListAndWatch update");
                    continue;
                }
                info!("sending updated device list to kubelet");
                if tx
                    .send(Ok(ListAndWatchResponse {
                        devices: endpoint.device_list(),
                    }))
                    .is_err()
                {
                    warn!("ListAndWatch stream closed by kubelet");
                    break;
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let endpoint = &self.0;
        let request = request.into_inner();
        // The candidate search, annotation patch and env construction must
        // not interleave between concurrent Allocate calls.
        let _guard = endpoint.allocate_lock.lock().await;

        if request.container_requests.len() != 1 {
            return Err(Status::internal(
                "internal error! Allocate can only serve one container per call currently",
            ));
        }
        let container_req = request.container_requests[0].devices_ids.len() as i64;
        info!(
            resource = %endpoint.resource_name,
            request = container_req,
            ids = ?request.container_requests[0].devices_ids,
            "allocate starting"
        );

        let (pod, instance_uuid) = endpoint.bind_candidate(container_req).await?;
        let minor = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&endpoint.config.assigned_minor_key()))
            .cloned()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                Status::internal(format!(
                    "pod {} has not been assigned a device",
                    pod_name(&pod)
                ))
            })?;

        let envs = endpoint.container_envs(&minor, container_req, instance_uuid.as_deref())?;
        info!(
            pod = %pod_name(&pod),
            uid = %pod_uid(&pod),
            minor = %minor,
            "allocate success"
        );
        Ok(Response::new(AllocateResponse {
            container_responses: vec![ContainerAllocateResponse {
                envs: envs.into_iter().collect(),
                mounts: vec![],
                devices: vec![],
                annotations: Default::default(),
                cdi_devices: vec![],
            }],
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
