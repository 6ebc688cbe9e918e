use crate::api::ResourceThresholds;
use crate::cache::{PodFilter, PodLister};
use crate::helpers::node_helpers::{is_node_unschedulable, node_capacity, node_name};
use crate::helpers::pod_helpers::{pod_name, pod_phase, pod_requests, ResourceList};
use crate::helpers::quantity::RESOURCE_CPU;
use itertools::Itertools;
use k8s_openapi::api::core::v1::{Node, Pod};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Absolute per-resource amounts, in the same units as [`ResourceList`].
pub type ResourceAmounts = BTreeMap<String, f64>;

#[derive(Debug, Clone)]
pub struct NodeUsage {
    pub node: Node,
    pub usage: ResourceList,
    pub pods: Vec<Arc<Pod>>,
}

impl NodeUsage {
    pub fn name(&self) -> &str {
        node_name(&self.node)
    }

    pub fn used(&self, resource: &str) -> i64 {
        self.usage.get(resource).copied().unwrap_or(0)
    }

    /// Usage as a percentage of allocatable. Zero when the node has none of
    /// the resource.
    pub fn percentage(&self, resource: &str) -> f64 {
        let capacity = node_capacity(&self.node, resource);
        if capacity <= 0 {
            return 0.0;
        }
        self.used(resource) as f64 * 100.0 / capacity as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeThresholds {
    pub low: ResourceAmounts,
    pub high: ResourceAmounts,
}

/// A node's usage joined with its thresholds.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub usage: NodeUsage,
    pub thresholds: NodeThresholds,
}

impl NodeInfo {
    pub fn name(&self) -> &str {
        self.usage.name()
    }

    pub fn node(&self) -> &Node {
        &self.usage.node
    }

    /// Removes an evicted pod's requests from the projected usage.
    pub fn subtract(&mut self, requests: &ResourceList) {
        for (name, value) in requests {
            if let Some(used) = self.usage.usage.get_mut(name) {
                *used -= value;
            }
        }
    }
}

/// Pods that still hold their requests: everything not Succeeded or Failed.
pub fn is_active_pod(pod: &Pod) -> bool {
    !matches!(pod_phase(pod), "Succeeded" | "Failed")
}

/// Sorted union of the resources named by both threshold maps.
pub fn resource_names(low: &ResourceThresholds, high: &ResourceThresholds) -> Vec<String> {
    low.keys().chain(high.keys()).cloned().sorted().dedup().collect()
}

pub fn compute_node_usage(
    nodes: &[Node],
    resource_names: &[String],
    lister: &dyn PodLister,
    filter: &PodFilter<'_>,
) -> Vec<NodeUsage> {
    nodes
        .iter()
        .map(|node| {
            let pods = lister.pods_assigned_to_node(node_name(node), filter);
            let mut usage: ResourceList = resource_names.iter().map(|r| (r.clone(), 0)).collect();
            for pod in &pods {
                match pod_requests(pod, resource_names) {
                    Ok(requests) => {
                        for (name, value) in requests {
                            *usage.entry(name).or_insert(0) += value;
                        }
                    }
                    Err(e) => warn!("ignoring requests of pod {}: {}", pod_name(pod), e),
                }
            }
            debug!("node {} usage {:?}", node_name(node), usage);
            NodeUsage {
                node: node.clone(),
                usage,
                pods,
            }
        })
        .collect()
}

/// Converts percentage thresholds into absolute amounts per node. In deviation
/// mode the percentages are distances from the cluster-wide average
/// utilization of each resource.
pub fn compute_node_thresholds(
    usages: &[NodeUsage],
    low: &ResourceThresholds,
    high: &ResourceThresholds,
    resource_names: &[String],
    use_deviation: bool,
) -> Vec<NodeThresholds> {
    let averages: BTreeMap<&str, f64> = resource_names
        .iter()
        .map(|r| (r.as_str(), average_percentage(usages, r)))
        .collect();

    usages
        .iter()
        .map(|usage| {
            let mut thresholds = NodeThresholds::default();
            for resource in resource_names {
                let capacity = node_capacity(&usage.node, resource) as f64;
                let average = averages.get(resource.as_str()).copied().unwrap_or(0.0);
                let (low_pct, high_pct) = match (use_deviation, low.get(resource), high.get(resource)) {
                    (false, l, h) => (l.copied(), h.copied()),
                    (true, l, h) => (
                        l.map(|l| (average - l).max(0.0)),
                        h.map(|h| (average + h).min(100.0)),
                    ),
                };
                thresholds
                    .low
                    .insert(resource.clone(), capacity * low_pct.unwrap_or(100.0) / 100.0);
                thresholds
                    .high
                    .insert(resource.clone(), capacity * high_pct.unwrap_or(100.0) / 100.0);
            }
            thresholds
        })
        .collect()
}

fn average_percentage(usages: &[NodeUsage], resource: &str) -> f64 {
    let percentages: Vec<f64> = usages
        .iter()
        .filter(|u| node_capacity(&u.node, resource) > 0)
        .map(|u| u.percentage(resource))
        .collect();
    if percentages.is_empty() {
        return 0.0;
    }
    percentages.iter().sum::<f64>() / percentages.len() as f64
}

/// Every resource at or below its low threshold.
pub fn is_underutilized(info: &NodeInfo) -> bool {
    info.thresholds
        .low
        .iter()
        .all(|(name, threshold)| info.usage.used(name) as f64 <= *threshold)
}

/// Any resource above its high threshold.
pub fn is_overutilized(info: &NodeInfo) -> bool {
    info.thresholds
        .high
        .iter()
        .any(|(name, threshold)| info.usage.used(name) as f64 > *threshold)
}

/// Splits nodes into (underutilized, overutilized). A node lands in at most one
/// set and unschedulable nodes are never underutilized.
pub fn classify_nodes(
    usages: Vec<NodeUsage>,
    thresholds: Vec<NodeThresholds>,
    low_predicate: impl Fn(&NodeInfo) -> bool,
    high_predicate: impl Fn(&NodeInfo) -> bool,
) -> (Vec<NodeInfo>, Vec<NodeInfo>) {
    let mut low_nodes = vec![];
    let mut high_nodes = vec![];
    for (usage, thresholds) in usages.into_iter().zip(thresholds) {
        let info = NodeInfo { usage, thresholds };
        let schedulable = !is_node_unschedulable(info.node());
        if schedulable && low_predicate(&info) {
            debug!("node {} is underutilized", info.name());
            low_nodes.push(info);
        } else if high_predicate(&info) {
            debug!("node {} is overutilized", info.name());
            high_nodes.push(info);
        } else {
            if !schedulable {
                debug!("node {} is unschedulable, not considered underutilized", info.name());
            }
            debug!("node {} is appropriately utilized", info.name());
        }
    }
    (low_nodes, high_nodes)
}

/// Sum of usage percentages across the given resources.
pub fn usage_score(info: &NodeInfo, resource_names: &[String]) -> f64 {
    resource_names.iter().map(|r| info.usage.percentage(r)).sum()
}

/// CPU utilization when cpu is among the resources, the mean otherwise.
pub fn cpu_utilization(info: &NodeInfo, resource_names: &[String]) -> f64 {
    if resource_names.iter().any(|r| r == RESOURCE_CPU) || resource_names.is_empty() {
        return info.usage.percentage(RESOURCE_CPU);
    }
    usage_score(info, resource_names) / resource_names.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ClusterSnapshot;
    use crate::helpers::quantity::RESOURCE_MEMORY;
    use crate::test_helpers::objects::{node, pod};

    fn cpu() -> Vec<String> {
        vec![RESOURCE_CPU.to_string()]
    }

    fn thresholds(cpu: f64) -> ResourceThresholds {
        ResourceThresholds::from([(RESOURCE_CPU.to_string(), cpu)])
    }

    #[test]
    fn should_sum_requests_per_node() {
        let snapshot = ClusterSnapshot::new(
            vec![node("node1").with_allocatable("2", "4Gi", "10").build()],
            vec![
                pod("default", "a").on_node("node1").with_cpu_request("500m").build(),
                pod("default", "b").on_node("node1").with_cpu_request("500m").build(),
            ],
        );
        let usages = compute_node_usage(snapshot.nodes(), &cpu(), &snapshot, &|_| true);
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].used(RESOURCE_CPU), 1000);
        assert_eq!(usages[0].pods.len(), 2);
        assert_eq!(usages[0].percentage(RESOURCE_CPU), 50.0);
    }

    #[test]
    fn filtered_pods_contribute_nothing() {
        let snapshot = ClusterSnapshot::new(
            vec![node("node1").with_allocatable("2", "4Gi", "10").build()],
            vec![
                pod("default", "a").on_node("node1").with_cpu_request("500m").build(),
                pod("default", "done")
                    .on_node("node1")
                    .with_cpu_request("500m")
                    .with_phase("Succeeded")
                    .build(),
            ],
        );
        let usages = compute_node_usage(snapshot.nodes(), &cpu(), &snapshot, &is_active_pod);
        assert_eq!(usages[0].used(RESOURCE_CPU), 500);
    }

    #[test]
    fn should_compute_static_thresholds() {
        let usages = vec![NodeUsage {
            node: node("node1").with_allocatable("4", "8Gi", "10").build(),
            usage: ResourceList::new(),
            pods: vec![],
        }];
        let names = vec![RESOURCE_CPU.to_string(), RESOURCE_MEMORY.to_string()];
        let t = compute_node_thresholds(&usages, &thresholds(20.0), &thresholds(50.0), &names, false);
        assert_eq!(t[0].low.get(RESOURCE_CPU), Some(&800.0));
        assert_eq!(t[0].high.get(RESOURCE_CPU), Some(&2000.0));
        // memory is not configured, so it sits at capacity on both sides
        let memory = 8.0 * 1024.0 * 1024.0 * 1024.0;
        assert_eq!(t[0].low.get(RESOURCE_MEMORY), Some(&memory));
        assert_eq!(t[0].high.get(RESOURCE_MEMORY), Some(&memory));
    }

    #[test]
    fn deviation_mode_classifies_around_average() {
        let snapshot = ClusterSnapshot::new(
            vec![
                node("node1").with_allocatable("1", "4Gi", "10").build(),
                node("node2").with_allocatable("1", "4Gi", "10").build(),
                node("node3").with_allocatable("1", "4Gi", "10").build(),
            ],
            vec![
                pod("default", "a").on_node("node1").with_cpu_request("200m").build(),
                pod("default", "b").on_node("node2").with_cpu_request("400m").build(),
                pod("default", "c").on_node("node3").with_cpu_request("600m").build(),
            ],
        );
        let usages = compute_node_usage(snapshot.nodes(), &cpu(), &snapshot, &|_| true);
        let t = compute_node_thresholds(&usages, &thresholds(10.0), &thresholds(10.0), &cpu(), true);
        for nt in &t {
            assert!((nt.low[RESOURCE_CPU] - 300.0).abs() < 1e-6);
            assert!((nt.high[RESOURCE_CPU] - 500.0).abs() < 1e-6);
        }

        let (low, high) = classify_nodes(usages, t, is_underutilized, is_overutilized);
        assert_eq!(low.iter().map(|n| n.name()).collect::<Vec<_>>(), vec!["node1"]);
        assert_eq!(high.iter().map(|n| n.name()).collect::<Vec<_>>(), vec!["node3"]);
    }

    #[test]
    fn deviation_thresholds_are_clamped() {
        let snapshot = ClusterSnapshot::new(
            vec![node("node1").with_allocatable("1", "4Gi", "10").build()],
            vec![pod("default", "a").on_node("node1").with_cpu_request("900m").build()],
        );
        let usages = compute_node_usage(snapshot.nodes(), &cpu(), &snapshot, &|_| true);
        let t = compute_node_thresholds(&usages, &thresholds(95.0), &thresholds(50.0), &cpu(), true);
        assert_eq!(t[0].low[RESOURCE_CPU], 0.0);
        assert_eq!(t[0].high[RESOURCE_CPU], 1000.0);
    }

    #[test]
    fn nodes_are_never_in_both_sets() {
        let nodes: Vec<_> = (0..6)
            .map(|i| node(&format!("node{}", i)).with_allocatable("1", "1Gi", "10").build())
            .collect();
        let pods: Vec<_> = (0..6)
            .map(|i| {
                pod("default", &format!("p{}", i))
                    .on_node(&format!("node{}", i))
                    .with_cpu_request(&format!("{}m", i * 200))
                    .build()
            })
            .collect();
        let snapshot = ClusterSnapshot::new(nodes, pods);

        for (low, high) in [(0.0, 0.0), (20.0, 20.0), (30.0, 70.0), (100.0, 100.0)] {
            for deviation in [false, true] {
                let usages = compute_node_usage(snapshot.nodes(), &cpu(), &snapshot, &|_| true);
                let t = compute_node_thresholds(&usages, &thresholds(low), &thresholds(high), &cpu(), deviation);
                let (lows, highs) = classify_nodes(usages, t, is_underutilized, is_overutilized);
                for l in &lows {
                    assert!(highs.iter().all(|h| h.name() != l.name()));
                }
            }
        }
    }

    #[test]
    fn unschedulable_nodes_are_not_underutilized() {
        let snapshot = ClusterSnapshot::new(
            vec![
                node("cordoned").with_allocatable("1", "1Gi", "10").unschedulable().build(),
                node("busy").with_allocatable("1", "1Gi", "10").unschedulable().build(),
            ],
            vec![pod("default", "a").on_node("busy").with_cpu_request("900m").build()],
        );
        let usages = compute_node_usage(snapshot.nodes(), &cpu(), &snapshot, &|_| true);
        let t = compute_node_thresholds(&usages, &thresholds(20.0), &thresholds(50.0), &cpu(), false);
        let (low, high) = classify_nodes(usages, t, is_underutilized, is_overutilized);
        assert!(low.is_empty());
        assert_eq!(high.len(), 1);
        assert_eq!(high[0].name(), "busy");
    }
}
