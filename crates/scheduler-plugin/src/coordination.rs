//! Scheduler side of the DRS handshake: a request/response protocol over a
//! named configmap, with explicit phases instead of ad-hoc status string
//! comparisons at every call site.

use std::collections::BTreeMap;
use std::time::Duration;

use gcushare_common::config::CONFIGMAP_NODE_LABEL;
use gcushare_common::config::CONFIGMAP_OWNER_LABEL;
use gcushare_common::config::DRS_SCHEDULER_NAME;
use gcushare_common::config::SCHEDULER_RECORD_KEY;
use gcushare_common::AllocateRecord;
use gcushare_common::CoordinationName;
use gcushare_common::FilterSpec;
use gcushare_common::GcuSharePod;
use gcushare_common::PreBindSpec;
use gcushare_common::RecordStatus;
use gcushare_common::RequestPhase;
use gcushare_common::SchedulerRecord;
use k8s_openapi::api::core::v1::ConfigMap;
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

use crate::framework::Status;

const POLL_ATTEMPTS: usize = 60;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const DELETE_ATTEMPTS: usize = 60;
const DELETE_BACKOFF: Duration = Duration::from_secs(3);

/// One coordination exchange with the node agent of one candidate node.
pub struct CoordinationRequest {
    pub name: CoordinationName,
    namespace: String,
    node_name: String,
    client: Client,
}

impl CoordinationRequest {
    pub fn new(client: Client, pod: &Pod, node_name: &str) -> Self {
        let pod_name = pod.metadata.name.as_deref().unwrap_or_default();
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let uid = pod.metadata.uid.as_deref().unwrap_or_default();
        Self {
            name: CoordinationName::new(pod_name, namespace, uid, node_name),
            namespace: namespace.to_string(),
            node_name: node_name.to_string(),
            client,
        }
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Phase `Issued`: creates the labeled configmap carrying the initial
    /// filter section.
    pub async fn create(
        &self,
        gcu_share_pods: Vec<GcuSharePod>,
        containers: BTreeMap<String, AllocateRecord>,
    ) -> Result<(), Status> {
        let record = SchedulerRecord {
            filter: Some(FilterSpec {
                gcu_share_pods,
                containers,
                ..Default::default()
            }),
            pre_bind: None,
        };
        let content = serde_json::to_string(&record)
            .map_err(|e| Status::error(format!("serialize scheduler record: {e}")))?;
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (CONFIGMAP_NODE_LABEL.to_string(), self.node_name.clone()),
                    (
                        CONFIGMAP_OWNER_LABEL.to_string(),
                        DRS_SCHEDULER_NAME.to_string(),
                    ),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(SCHEDULER_RECORD_KEY.to_string(), content)])),
            ..Default::default()
        };
        self.api()
            .create(&PostParams::default(), &configmap)
            .await
            .map_err(|e| {
                Status::error(format!("create configmap {} failed: {e}", self.name))
            })?;
        info!(configmap = %self.name.to_string(), "created coordination configmap");
        Ok(())
    }

    /// Current state of the exchange.
    pub async fn read(&self) -> Result<SchedulerRecord, Status> {
        let cm = self
            .api()
            .get(&self.name.to_string())
            .await
            .map_err(|e| Status::error(format!("get configmap {} failed: {e}", self.name)))?;
        let raw = cm
            .data
            .as_ref()
            .and_then(|d| d.get(SCHEDULER_RECORD_KEY))
            .ok_or_else(|| {
                Status::error(format!("configmap {} has no scheduler record", self.name))
            })?;
        serde_json::from_str(raw)
            .map_err(|e| Status::error(format!("unmarshal scheduler record: {e}")))
    }

    fn terminal_status(section: &str, status: Option<RecordStatus>, message: &str) -> Status {
        match status {
            Some(RecordStatus::Unschedulable) => {
                warn!("{section} answered unschedulable: {message}");
                Status::unschedulable(message)
            }
            other => {
                error!("{section} answered {other:?}: {message}");
                Status::error(message)
            }
        }
    }

    /// Waits for the node agent to elect a device (`FilterDone`).
    pub async fn await_filter(&self) -> Result<FilterSpec, Status> {
        for attempt in 0..POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let record = self.read().await?;
            match record.phase() {
                RequestPhase::Issued => {
                    warn!(
                        configmap = %self.name.to_string(),
                        attempt,
                        "filter answer not ready yet"
                    );
                }
                _ => {
                    let filter = record.filter.unwrap_or_default();
                    if filter.status == Some(RecordStatus::Success) {
                        info!(configmap = %self.name.to_string(), "node agent elected a device");
                        return Ok(filter);
                    }
                    return Err(Self::terminal_status(
                        "filter",
                        filter.status,
                        &filter.message,
                    ));
                }
            }
        }
        Err(Status::error(format!(
            "wait for filter answer of configmap {} timed out after {POLL_ATTEMPTS} attempts",
            self.name
        )))
    }

    /// Phase `PreBindIssued`: hands the elected containers back so the node
    /// agent materializes instances for them.
    pub async fn issue_pre_bind(
        &self,
        filter: &FilterSpec,
    ) -> Result<(), Status> {
        let record = SchedulerRecord {
            filter: Some(filter.clone()),
            pre_bind: Some(PreBindSpec {
                containers: filter.containers.clone(),
                ..Default::default()
            }),
        };
        let content = serde_json::to_string(&record)
            .map_err(|e| Status::error(format!("serialize scheduler record: {e}")))?;
        let patch = json!({ "data": { SCHEDULER_RECORD_KEY: content } });
        self.api()
            .patch(
                &self.name.to_string(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| Status::error(format!("patch configmap {} failed: {e}", self.name)))?;
        info!(configmap = %self.name.to_string(), "issued pre-bind, waiting for instance creation");
        Ok(())
    }

    /// Waits for the node agent to create the instances (`PreBindDone`).
    pub async fn await_pre_bind(&self) -> Result<SchedulerRecord, Status> {
        for attempt in 0..POLL_ATTEMPTS {
            tokio::time::sleep(POLL_INTERVAL).await;
            let record = self.read().await?;
            match record.phase() {
                RequestPhase::PreBindIssued => {
                    warn!(
                        configmap = %self.name.to_string(),
                        attempt,
                        "instance creation not finished yet"
                    );
                }
                RequestPhase::PreBindDone => {
                    info!(configmap = %self.name.to_string(), "node agent created drs instances");
                    return Ok(record);
                }
                _ => {
                    let pre_bind = record.pre_bind.unwrap_or_default();
                    return Err(Self::terminal_status(
                        "preBind",
                        pre_bind.status,
                        &pre_bind.message,
                    ));
                }
            }
        }
        Err(Status::error(format!(
            "wait for drs instances of configmap {} timed out after {POLL_ATTEMPTS} attempts",
            self.name
        )))
    }

    /// Terminal cleanup on failure paths. On success the object lingers
    /// until the pod is deleted; its delete event drives the node agent's
    /// instance cleanup.
    pub async fn delete(&self) {
        let api = self.api();
        for attempt in 0..DELETE_ATTEMPTS {
            match api.delete(&self.name.to_string(), &Default::default()).await {
                Ok(_) => {
                    info!(configmap = %self.name.to_string(), "deleted coordination configmap");
                    return;
                }
                Err(kube::Error::Api(e)) if e.code == 404 => return,
                Err(e) => {
                    error!(
                        configmap = %self.name.to_string(),
                        attempt,
                        "delete coordination configmap failed: {e}"
                    );
                    tokio::time::sleep(DELETE_BACKOFF).await;
                }
            }
        }
        error!(configmap = %self.name.to_string(), "delete coordination configmap gave up");
    }
}
