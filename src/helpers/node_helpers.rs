use crate::cache::PodLister;
use crate::helpers::labels::{Selector, EMPTY_LABELS};
use crate::helpers::pod_helpers::{pod_name, pod_requests, pod_tolerations, tolerates_taint};
use crate::helpers::quantity::{resource_value, RESOURCE_CPU, RESOURCE_MEMORY, RESOURCE_PODS};
use k8s_openapi::api::core::v1::{Node, NodeSelectorRequirement, NodeSelectorTerm, Pod};
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

pub fn node_labels(node: &Node) -> &BTreeMap<String, String> {
    node.metadata.labels.as_ref().unwrap_or(&EMPTY_LABELS)
}

pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

pub fn is_node_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

/// Allocatable amount of a resource on the node, falling back to capacity when
/// the kubelet has not reported allocatable.
pub fn node_capacity(node: &Node, resource: &str) -> i64 {
    let status = match node.status.as_ref() {
        None => return 0,
        Some(status) => status,
    };
    status
        .allocatable
        .as_ref()
        .and_then(|a| a.get(resource))
        .or_else(|| status.capacity.as_ref().and_then(|c| c.get(resource)))
        .and_then(|q| resource_value(resource, q).ok())
        .unwrap_or(0)
}

/// Ready nodes, optionally narrowed down by a label selector.
pub fn ready_nodes(nodes: Vec<Node>, selector: Option<&Selector>) -> Vec<Node> {
    nodes
        .into_iter()
        .filter(is_node_ready)
        .filter(|n| selector.map(|s| s.matches(node_labels(n))).unwrap_or(true))
        .collect()
}

fn node_selector_matches(pod: &Pod, node: &Node) -> Result<(), String> {
    let node_selector = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_selector.as_ref());
    let node_selector = match node_selector {
        None => return Ok(()),
        Some(ns) => ns,
    };
    let labels = node_labels(node);
    for (k, v) in node_selector.iter() {
        if labels.get(k) != Some(v) {
            return Err(format!("node selector {}:{} did not match", k, v));
        }
    }
    Ok(())
}

fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
        "NotIn" => !value.is_some_and(|v| values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        op @ ("Gt" | "Lt") => {
            let actual = value.and_then(|v| v.parse::<i64>().ok());
            let bound = values.first().and_then(|v| v.parse::<i64>().ok());
            match (actual, bound) {
                (Some(actual), Some(bound)) if op == "Gt" => actual > bound,
                (Some(actual), Some(bound)) => actual < bound,
                _ => false,
            }
        }
        _ => false,
    }
}

/// A term with neither expressions nor fields selects no node.
pub fn node_selector_term_matches(term: &NodeSelectorTerm, node: &Node) -> bool {
    let expressions = term.match_expressions.as_deref().unwrap_or_default();
    let fields = term.match_fields.as_deref().unwrap_or_default();
    if expressions.is_empty() && fields.is_empty() {
        return false;
    }
    let labels = node_labels(node);
    expressions
        .iter()
        .all(|r| requirement_matches(r, labels.get(&r.key).map(String::as_str)))
        && fields
            .iter()
            .all(|r| r.key == "metadata.name" && requirement_matches(r, Some(node_name(node))))
}

/// True when the node satisfies the pod's required node affinity, or the pod
/// has none.
pub fn pod_matches_required_node_affinity(pod: &Pod, node: &Node) -> bool {
    let required = pod
        .spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref());
    match required {
        None => true,
        Some(selector) => selector
            .node_selector_terms
            .iter()
            .any(|term| node_selector_term_matches(term, node)),
    }
}

/// Sum of the weights of the pod's preferred node affinity terms the node
/// matches.
pub fn preferred_node_affinity_weight(pod: &Pod, node: &Node) -> i32 {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.preferred_during_scheduling_ignored_during_execution.as_ref())
        .map(|terms| {
            terms
                .iter()
                .filter(|t| node_selector_term_matches(&t.preference, node))
                .map(|t| t.weight)
                .sum()
        })
        .unwrap_or(0)
}

fn taints_tolerated(pod: &Pod, node: &Node) -> Result<(), String> {
    let taints = node.spec.as_ref().and_then(|s| s.taints.as_ref());
    for taint in taints.into_iter().flatten() {
        if taint.effect != "NoSchedule" && taint.effect != "NoExecute" {
            continue;
        }
        if !tolerates_taint(pod_tolerations(pod), taint) {
            return Err(format!(
                "taint {}={}:{} not tolerated",
                taint.key,
                taint.value.as_deref().unwrap_or_default(),
                taint.effect
            ));
        }
    }
    Ok(())
}

fn resources_fit(pod: &Pod, node: &Node, node_pods: &[Arc<Pod>]) -> Result<(), String> {
    let mut names = vec![
        RESOURCE_CPU.to_string(),
        RESOURCE_MEMORY.to_string(),
        RESOURCE_PODS.to_string(),
    ];
    // extended resources the pod asks for are checked as well
    if let Some(spec) = pod.spec.as_ref() {
        for c in &spec.containers {
            for name in c
                .resources
                .as_ref()
                .and_then(|r| r.requests.as_ref())
                .into_iter()
                .flat_map(|r| r.keys())
            {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
    }

    let wanted = pod_requests(pod, &names).map_err(|e| e.to_string())?;
    let mut used: BTreeMap<String, i64> = BTreeMap::new();
    for p in node_pods {
        for (name, value) in pod_requests(p, &names).map_err(|e| e.to_string())? {
            *used.entry(name).or_insert(0) += value;
        }
    }

    for name in &names {
        let want = wanted.get(name).copied().unwrap_or(0);
        if want == 0 {
            continue;
        }
        let free = node_capacity(node, name) - used.get(name).copied().unwrap_or(0);
        if want > free {
            return Err(format!("insufficient {}", name));
        }
    }
    Ok(())
}

/// Checks whether `pod` could be scheduled on `node` given the pods already
/// running there.
pub fn pod_fits_on_node(pod: &Pod, node: &Node, node_pods: &[Arc<Pod>]) -> Result<(), String> {
    if is_node_unschedulable(node) {
        return Err("node is unschedulable".to_string());
    }
    node_selector_matches(pod, node)?;
    if !pod_matches_required_node_affinity(pod, node) {
        return Err("required node affinity did not match".to_string());
    }
    taints_tolerated(pod, node)?;
    resources_fit(pod, node, node_pods)
}

/// True when at least one ready node other than the pod's current one could
/// take it.
pub fn pod_fits_any_other_node(pod: &Pod, nodes: &[Node], lister: &dyn PodLister) -> bool {
    let current = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
    for node in nodes {
        if Some(node_name(node)) == current {
            continue;
        }
        let node_pods = lister.pods_assigned_to_node(node_name(node), &|_| true);
        match pod_fits_on_node(pod, node, &node_pods) {
            Ok(()) => return true,
            Err(reason) => {
                log::debug!(
                    "pod {} does not fit on node {}: {}",
                    pod_name(pod),
                    node_name(node),
                    reason
                );
            }
        }
    }
    false
}
