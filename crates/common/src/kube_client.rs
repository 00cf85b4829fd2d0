//! Kubernetes client bootstrap shared by both binaries.

use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::KubernetesError;

fn connection(message: String) -> KubernetesError {
    KubernetesError::ConnectionFailed { message }
}

/// Builds the cluster client. An explicit kubeconfig path (the `KUBECONFIG`
/// flag/env both binaries expose) wins; otherwise the configuration is
/// inferred, which inside a pod resolves to the service account and on a
/// workstation to `~/.kube/config`.
pub async fn init_kube_client(
    kubeconfig: Option<PathBuf>,
) -> Result<Client, Report<KubernetesError>> {
    let config = match &kubeconfig {
        Some(path) => load_kubeconfig(path).await?,
        None => Config::infer().await.change_context_lazy(|| {
            connection("failed to infer in-cluster or local Kubernetes config".to_string())
        })?,
    };
    Client::try_from(config).change_context_lazy(|| {
        connection(format!(
            "failed to build Kubernetes client (kubeconfig: {:?})",
            kubeconfig
        ))
    })
}

async fn load_kubeconfig(path: &Path) -> Result<Config, Report<KubernetesError>> {
    let kubeconfig = Kubeconfig::read_from(path)
        .change_context_lazy(|| connection(format!("unreadable kubeconfig: {}", path.display())))?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(|| {
            connection(format!(
                "kubeconfig {} does not yield a usable cluster config",
                path.display()
            ))
        })
}
