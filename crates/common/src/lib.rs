//! Types shared between the gcushare device plugin (node agent) and the
//! gcushare scheduler plugin: resource-name configuration, the annotation
//! keys both sides read and write, the scheduler-record schema carried by
//! DRS coordination configmaps, and the node capacity annotations.

pub mod capacity;
pub mod clock;
pub mod config;
pub mod kube_client;
pub mod record;

pub use capacity::{DrsCapacity, DrsDeviceSpec, SharedCapacity};
pub use clock::{Clock, SystemClock};
pub use config::ResourceConfig;
pub use record::{
    AllocateRecord, CoordinationName, DeviceRef, FilterSpec, GcuSharePod, PreBindSpec,
    RecordStatus, RequestPhase, SchedulerRecord,
};

/// Errors raised while talking to the cluster.
#[derive(Debug, thiserror::Error)]
pub enum KubernetesError {
    #[error("failed to connect to the Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("failed to watch {kind}: {message}")]
    WatchFailed { kind: &'static str, message: String },
    #[error("failed to patch {kind}/{name}: {message}")]
    PatchFailed {
        kind: &'static str,
        name: String,
        message: String,
    },
    #[error("{kind}/{name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("malformed annotation {key}: {message}")]
    AnnotationParse { key: String, message: String },
}
