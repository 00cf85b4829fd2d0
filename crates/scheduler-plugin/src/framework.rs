//! The scheduler-framework contract this plugin implements: extension-point
//! statuses and the per-node view handed to Filter.

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    Success,
    Error,
    Unschedulable,
}

/// Outcome of one extension-point invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: Code::Success,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: Code::Error,
            message: message.into(),
        }
    }

    pub fn unschedulable(message: impl Into<String>) -> Self {
        Self {
            code: Code::Unschedulable,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }
}

/// A candidate node together with the pods currently placed on it, as the
/// framework presents it to Filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: Node,
    #[serde(default)]
    pub pods: Vec<Pod>,
}

impl NodeInfo {
    pub fn name(&self) -> &str {
        self.node.metadata.name.as_deref().unwrap_or_default()
    }
}
