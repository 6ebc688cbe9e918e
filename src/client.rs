use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use kube::api::{DeleteParams, EvictParams, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use std::path::PathBuf;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("failed to connect to cluster: {0}")]
    Connection(String),
    /// The API server answered with a failure status.
    #[error("api error {code} ({reason}): {message}")]
    Api {
        code: u16,
        reason: String,
        message: String,
    },
    #[error("request timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

impl ClientError {
    pub fn code(&self) -> Option<u16> {
        match self {
            ClientError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => ClientError::Api {
                code: resp.code,
                reason: resp.reason,
                message: resp.message,
            },
            other => ClientError::Other(other.to_string()),
        }
    }
}

/// The slice of the cluster API the descheduler needs.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClientError>;
    async fn list_pods(&self) -> Result<Vec<Pod>, ClientError>;
    async fn list_pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>, ClientError>;
    async fn list_priority_classes(&self) -> Result<Vec<PriorityClass>, ClientError>;
    /// Evicts through the policy/v1 eviction subresource, which honours
    /// PodDisruptionBudgets.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
    /// Whether the server exposes the `pods/eviction` subresource.
    async fn supports_eviction(&self) -> Result<bool, ClientError>;
}

pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the given kubeconfig, or from the in-cluster /
    /// default kubeconfig when none is supplied.
    pub async fn connect(kubeconfig: Option<PathBuf>) -> Result<Self, ClientError> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
                    ClientError::Connection(format!(
                        "failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let config =
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| ClientError::Connection(e.to_string()))?;
                Client::try_from(config).map_err(|e| ClientError::Connection(e.to_string()))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| ClientError::Connection(e.to_string()))?,
        };
        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClientError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClientError> {
        let api: Api<Pod> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>, ClientError> {
        let api: Api<PodDisruptionBudget> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_priority_classes(&self) -> Result<Vec<PriorityClass>, ClientError> {
        let api: Api<PriorityClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.evict(name, &EvictParams::default()).await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn supports_eviction(&self) -> Result<bool, ClientError> {
        let resources = self.client.list_core_api_resources("v1").await?;
        Ok(resources
            .resources
            .iter()
            .any(|r| r.name == "pods/eviction"))
    }
}
