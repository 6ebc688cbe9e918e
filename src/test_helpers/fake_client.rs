use crate::client::{ClientError, ClusterClient};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// In-memory cluster. Evicted and deleted pods disappear from later listings.
#[derive(Default)]
pub struct FakeClusterClient {
    nodes: Vec<Node>,
    pods: Mutex<Vec<Pod>>,
    pdbs: Vec<PodDisruptionBudget>,
    priority_classes: Vec<PriorityClass>,
    eviction_unsupported: bool,
    latency: Option<Duration>,
    evicted: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, ClientError>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

#[allow(unused)]
impl FakeClusterClient {
    pub fn new(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        Self {
            nodes,
            pods: Mutex::new(pods),
            ..Default::default()
        }
    }

    pub fn with_pdbs(mut self, pdbs: Vec<PodDisruptionBudget>) -> Self {
        self.pdbs = pdbs;
        self
    }

    pub fn with_priority_classes(mut self, classes: Vec<PriorityClass>) -> Self {
        self.priority_classes = classes;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn without_eviction_support(mut self) -> Self {
        self.eviction_unsupported = true;
        self
    }

    /// Makes evicting `pod` ("namespace/name") fail with `err`.
    pub fn fail_eviction(&self, pod: &str, err: ClientError) {
        self.failures.lock().unwrap().insert(pod.to_string(), err);
    }

    /// Cancels `token` once `count` pods have been evicted.
    pub fn cancel_after(&self, count: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((count, token));
    }

    pub fn evicted(&self) -> Vec<String> {
        self.evicted.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    async fn remove(&self, namespace: &str, name: &str, log: &Mutex<Vec<String>>) -> Result<(), ClientError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let key = format!("{}/{}", namespace, name);
        if let Some(err) = self.failures.lock().unwrap().get(&key) {
            return Err(err.clone());
        }
        self.pods.lock().unwrap().retain(|p| {
            !(p.metadata.namespace.as_deref() == Some(namespace) && p.metadata.name.as_deref() == Some(name))
        });
        let mut log = log.lock().unwrap();
        log.push(key);

        if let Some((count, token)) = self.cancel_after.lock().unwrap().as_ref() {
            if log.len() >= *count {
                token.cancel();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn list_nodes(&self) -> Result<Vec<Node>, ClientError> {
        Ok(self.nodes.clone())
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, ClientError> {
        Ok(self.pods.lock().unwrap().clone())
    }

    async fn list_pod_disruption_budgets(&self) -> Result<Vec<PodDisruptionBudget>, ClientError> {
        Ok(self.pdbs.clone())
    }

    async fn list_priority_classes(&self) -> Result<Vec<PriorityClass>, ClientError> {
        Ok(self.priority_classes.clone())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.remove(namespace, name, &self.evicted).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.remove(namespace, name, &self.deleted).await
    }

    async fn supports_eviction(&self) -> Result<bool, ClientError> {
        Ok(!self.eviction_unsupported)
    }
}
