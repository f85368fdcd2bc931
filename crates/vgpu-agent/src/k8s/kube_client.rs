use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::Client;
use kube::Config;

use crate::k8s::KubernetesError;

/// Client for the API server. An explicit kubeconfig wins, otherwise the
/// in-cluster service account, otherwise `~/.kube/config`.
pub async fn init_kube_client(
    kubeconfig: Option<&Path>,
) -> Result<Client, Report<KubernetesError>> {
    let config = match kubeconfig {
        Some(path) => load_kubeconfig(path).await?,
        None => Config::infer()
            .await
            .change_context(KubernetesError::ConnectionFailed {
                message: "no in-cluster or local kubeconfig found".to_string(),
            })?,
    };

    Client::try_from(config).change_context(KubernetesError::ConnectionFailed {
        message: "Failed to create Kubernetes client".to_string(),
    })
}

async fn load_kubeconfig(path: &Path) -> Result<Config, Report<KubernetesError>> {
    let failed = || KubernetesError::ConnectionFailed {
        message: format!("unusable kubeconfig {}", path.display()),
    };
    let kubeconfig = Kubeconfig::read_from(path).change_context_lazy(failed)?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .change_context_lazy(failed)
}
