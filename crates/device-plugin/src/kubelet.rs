//! Read-only kubelet client: lists this node's pods from the kubelet's
//! HTTPS API as a lower-latency alternative to the API server.

use error_stack::Report;
use error_stack::ResultExt;
use gcushare_common::KubernetesError;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::List;
use std::time::Duration;
use tracing::info;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

pub struct KubeletClient {
    url: String,
    token: String,
    client: reqwest::Client,
}

impl KubeletClient {
    /// Builds a client against the kubelet's authenticated port. The
    /// kubelet's serving certificate is commonly self-signed, so server
    /// verification is disabled and the service-account bearer token is
    /// presented instead.
    pub fn new(address: &str, port: u16, token: Option<String>) -> Result<Self, Report<KubernetesError>> {
        let token = match token {
            Some(token) => token,
            None => std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN_PATH)
                .map(|t| t.trim().to_string())
                .change_context(KubernetesError::ConnectionFailed {
                    message: "read service account token failed".to_string(),
                })?,
        };
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(10))
            .build()
            .change_context(KubernetesError::ConnectionFailed {
                message: "build kubelet http client failed".to_string(),
            })?;
        info!(address, port, "built kubelet client");
        Ok(Self {
            url: format!("https://{address}:{port}/pods/"),
            token,
            client,
        })
    }

    /// All pods the kubelet currently knows on this node.
    pub async fn list_node_pods(&self) -> Result<Vec<Pod>, Report<KubernetesError>> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .send()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: format!("get {} failed", self.url),
            })?;
        let list: List<Pod> =
            response
                .json()
                .await
                .change_context(KubernetesError::ConnectionFailed {
                    message: "decode kubelet pod list failed".to_string(),
                })?;
        Ok(list.items)
    }
}
