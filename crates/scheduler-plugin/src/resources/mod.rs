//! Cluster-state views: pod-side request/annotation accessors and node-side
//! availability computation for both lanes.

pub mod node;
pub mod pod;

use gcushare_common::ResourceConfig;
use kube::Client;

pub use node::NodeResource;
pub use pod::PodResource;
pub use pod::ReserveRecord;

/// Shared plumbing both resource views embed. Explicit composition: the
/// outer types hold a value and define their own methods.
#[derive(Clone)]
pub struct BaseResource {
    pub config: ResourceConfig,
    pub shared_resource_name: String,
    pub drs_resource_name: String,
    pub client: Client,
}

impl BaseResource {
    pub fn new(config: ResourceConfig, client: Client) -> Self {
        Self {
            shared_resource_name: config.shared_resource_name(),
            drs_resource_name: config.drs_resource_name(),
            config,
            client,
        }
    }
}
