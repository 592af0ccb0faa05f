//! Kubernetes client construction and namespace detection

use kube_client::config::{
    Config, InferConfigError, KubeConfigOptions, Kubeconfig, KubeconfigError,
};
use std::path::PathBuf;

pub use kube_client::Client;

/// Configures the Kubernetes client
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct ClientArgs {
    /// The kubeconfig context to use.
    #[cfg_attr(feature = "clap", clap(long = "kube-context", env = "K8M_KUBE_CONTEXT"))]
    pub context: Option<String>,

    /// The path to a kubeconfig file.
    #[cfg_attr(feature = "clap", clap(long, env = "KUBECONFIG"))]
    pub kubeconfig: Option<PathBuf>,
}

/// Indicates that no usable Kubernetes client could be constructed
#[derive(Debug, thiserror::Error)]
pub enum ConstructionError {
    /// Neither in-cluster nor local configuration could be inferred
    #[error(transparent)]
    Infer(#[from] InferConfigError),

    /// The kubeconfig could not be loaded
    #[error(transparent)]
    Kubeconfig(#[from] KubeconfigError),

    /// The client could not be built from its configuration
    #[error(transparent)]
    Client(#[from] kube_client::Error),
}

const NAMESPACE_ENV: [&str; 2] = ["K8M_NAMESPACE", "POD_NAMESPACE"];
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

// === impl ClientArgs ===

impl ClientArgs {
    /// Constructs a client.
    ///
    /// When neither a context nor a kubeconfig path is set, the configuration
    /// is inferred from the in-cluster environment or the default local
    /// kubeconfig.
    pub async fn try_client(self) -> Result<Client, ConstructionError> {
        let options = KubeConfigOptions {
            context: self.context.clone(),
            ..Default::default()
        };
        let config = match self.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kubeconfig, &options).await?
            }
            None if self.context.is_some() => Config::from_kubeconfig(&options).await?,
            None => Config::infer().await?,
        };
        Client::try_from(config).map_err(Into::into)
    }
}

/// Determines the namespace that k8m's own objects live in
///
/// `K8M_NAMESPACE` or `POD_NAMESPACE` take precedence, then the in-cluster
/// service account's namespace, then the client's default namespace.
pub fn detect_namespace(client: Option<&Client>) -> String {
    let fallback = client.map_or("default", |c| c.default_namespace());
    detect_namespace_with(
        |name| std::env::var(name).ok(),
        || std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE).ok(),
        fallback,
    )
}

fn detect_namespace_with(
    env: impl Fn(&str) -> Option<String>,
    service_account: impl FnOnce() -> Option<String>,
    fallback: &str,
) -> String {
    let non_empty = |s: String| {
        let s = s.trim().to_string();
        (!s.is_empty()).then_some(s)
    };
    NAMESPACE_ENV
        .iter()
        .find_map(|name| env(name).and_then(non_empty))
        .or_else(|| service_account().and_then(non_empty))
        .unwrap_or_else(|| fallback.to_string())
}
