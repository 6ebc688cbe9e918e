use crate::helpers::labels::Selector;
use crate::helpers::pod_helpers::{pod_labels, pod_name, pod_namespace, pod_node_name};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::scheduling::v1::PriorityClass;
use std::collections::HashMap;
use std::sync::Arc;

/// Predicate over pods used by listers and strategies.
pub type PodFilter<'a> = dyn Fn(&Pod) -> bool + Send + Sync + 'a;

pub trait PodLister: Send + Sync {
    /// Pods bound to `node_name` that pass `filter`, ordered by namespaced name.
    fn pods_assigned_to_node(&self, node_name: &str, filter: &PodFilter<'_>) -> Vec<Arc<Pod>>;
}

/// Point-in-time view of the cluster taken at the start of a descheduling
/// cycle. Nothing in it is refreshed while the cycle runs.
#[derive(Debug, Default)]
pub struct ClusterSnapshot {
    nodes: Vec<Node>,
    pods_by_node: HashMap<String, Vec<Arc<Pod>>>,
    pod_disruption_budgets: Vec<PodDisruptionBudget>,
    priority_classes: HashMap<String, i32>,
}

impl ClusterSnapshot {
    pub fn new(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        let mut pods_by_node: HashMap<String, Vec<Arc<Pod>>> = HashMap::new();
        for pod in pods {
            if let Some(node) = pod_node_name(&pod) {
                pods_by_node
                    .entry(node.to_string())
                    .or_default()
                    .push(Arc::new(pod));
            }
        }
        for pods in pods_by_node.values_mut() {
            pods.sort_by_key(|p| pod_name(p));
        }
        Self {
            nodes,
            pods_by_node,
            pod_disruption_budgets: vec![],
            priority_classes: HashMap::new(),
        }
    }

    pub fn with_pod_disruption_budgets(mut self, pdbs: Vec<PodDisruptionBudget>) -> Self {
        self.pod_disruption_budgets = pdbs;
        self
    }

    pub fn with_priority_classes(mut self, classes: Vec<PriorityClass>) -> Self {
        self.priority_classes = classes
            .into_iter()
            .filter_map(|pc| pc.metadata.name.map(|name| (name, pc.value)))
            .collect();
        self
    }

    pub fn priority_class_value(&self, name: &str) -> Option<i32> {
        self.priority_classes.get(name).copied()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn pod_count(&self) -> usize {
        self.pods_by_node.values().map(|p| p.len()).sum()
    }

    /// True when some PodDisruptionBudget in the pod's namespace selects it.
    pub fn has_matching_pdb(&self, pod: &Pod) -> bool {
        let labels = pod_labels(pod);
        self.pod_disruption_budgets.iter().any(|pdb| {
            if pdb.metadata.namespace.as_deref() != Some(pod_namespace(pod)) {
                return false;
            }
            let selector = pdb.spec.as_ref().and_then(|s| s.selector.as_ref());
            match selector.map(Selector::try_from) {
                // a PDB with an empty selector selects every pod in its namespace
                Some(Ok(selector)) => selector.matches(labels),
                Some(Err(_)) | None => false,
            }
        })
    }
}

impl PodLister for ClusterSnapshot {
    fn pods_assigned_to_node(&self, node_name: &str, filter: &PodFilter<'_>) -> Vec<Arc<Pod>> {
        self.pods_by_node
            .get(node_name)
            .map(|pods| pods.iter().filter(|p| filter(p)).cloned().collect())
            .unwrap_or_default()
    }
}
