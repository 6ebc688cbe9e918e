use crate::api::{validate_namespaces, ExtensionPoint, Namespaces, ResourceThresholds, ValidationError};
use crate::evictions::EvictOptions;
use crate::framework::plugins::nodeutilization::usage::{
    classify_nodes, compute_node_thresholds, compute_node_usage, cpu_utilization, is_active_pod,
    is_overutilized, is_underutilized, resource_names, NodeInfo,
};
use crate::framework::plugins::nodeutilization::validate_thresholds;
use crate::framework::plugins::{evict_one, namespace_allowed, PluginArgs, Step};
use crate::framework::registry::PluginRegistration;
use crate::framework::{BalancePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use crate::helpers::node_helpers::{node_capacity, node_labels};
use crate::helpers::pod_helpers::{pod_labels, pod_name, pod_request, pod_requests};
use crate::helpers::quantity::{RESOURCE_CPU, RESOURCE_MEMORY};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "CustomPolicyOne";

pub const DEFAULT_RELATEDNESS_LABEL_KEYS: [&str; 3] = ["app", "service", "database"];

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PodOrder {
    /// Smallest footprint first.
    #[default]
    Ascending,
    Descending,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomPolicyOneArgs {
    #[serde(default)]
    pub use_deviation_thresholds: bool,
    #[serde(default)]
    pub thresholds: ResourceThresholds,
    #[serde(default)]
    pub target_thresholds: ResourceThresholds,
    #[serde(default)]
    pub number_of_nodes: usize,
    #[serde(default)]
    pub evictable_namespaces: Option<Namespaces>,
    #[serde(default)]
    pub pod_order: PodOrder,
    /// Pod and node labels that mark a node as related to a pod.
    #[serde(default)]
    pub relatedness_label_keys: Vec<String>,
}

pub fn set_defaults(args: &mut CustomPolicyOneArgs) {
    if args.relatedness_label_keys.is_empty() {
        args.relatedness_label_keys = DEFAULT_RELATEDNESS_LABEL_KEYS.iter().map(|k| k.to_string()).collect();
    }
}

pub fn validate_args(args: &CustomPolicyOneArgs) -> Result<(), ValidationError> {
    validate_thresholds(&args.thresholds, Some(&args.target_thresholds))?;
    validate_namespaces(args.evictable_namespaces.as_ref())
}

/// Chooses where an evicted pod would ideally land. The choice is only
/// logged; the scheduler makes the real placement.
pub trait DestinationPicker: Send + Sync {
    fn pick<'a>(&self, pod: &Pod, candidates: &'a [NodeInfo]) -> Option<&'a NodeInfo>;
}

/// Prefers the first node sharing a relatedness label value with the pod,
/// then the node with the most free capacity.
pub struct LabelAffinityPicker {
    keys: Vec<String>,
}

impl LabelAffinityPicker {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    fn is_related(&self, pod: &Pod, node: &Node) -> bool {
        let labels = pod_labels(pod);
        let node_labels = node_labels(node);
        self.keys.iter().any(|key| match (labels.get(key), node_labels.get(key)) {
            (Some(p), Some(n)) => p == n,
            _ => false,
        })
    }
}

/// Free fraction of every tracked resource, summed.
fn free_capacity(info: &NodeInfo) -> f64 {
    info.usage
        .usage
        .iter()
        .map(|(resource, used)| {
            let capacity = node_capacity(info.node(), resource);
            if capacity <= 0 {
                0.0
            } else {
                (capacity - used) as f64 / capacity as f64
            }
        })
        .sum()
}

impl DestinationPicker for LabelAffinityPicker {
    fn pick<'a>(&self, pod: &Pod, candidates: &'a [NodeInfo]) -> Option<&'a NodeInfo> {
        if let Some(related) = candidates.iter().find(|c| self.is_related(pod, c.node())) {
            return Some(related);
        }
        candidates.iter().fold(None, |best: Option<&NodeInfo>, c| match best {
            Some(b) if free_capacity(b) >= free_capacity(c) => Some(b),
            _ => Some(c),
        })
    }
}

/// Drains the most CPU-loaded overutilized nodes first, pod by pod, until
/// each is back under its target thresholds.
pub struct CustomPolicyOne {
    args: CustomPolicyOneArgs,
    picker: Arc<dyn DestinationPicker>,
}

impl CustomPolicyOne {
    pub fn from_args(args: CustomPolicyOneArgs) -> Self {
        let picker = Arc::new(LabelAffinityPicker::new(args.relatedness_label_keys.clone()));
        Self { args, picker }
    }

    pub fn with_destination_picker(mut self, picker: Arc<dyn DestinationPicker>) -> Self {
        self.picker = picker;
        self
    }

    fn order_candidates(&self, pods: &mut [Arc<Pod>]) {
        pods.sort_by(|a, b| {
            pod_request(a, RESOURCE_CPU)
                .cmp(&pod_request(b, RESOURCE_CPU))
                .then_with(|| pod_request(a, RESOURCE_MEMORY).cmp(&pod_request(b, RESOURCE_MEMORY)))
                .then_with(|| pod_name(a).cmp(&pod_name(b)))
        });
        if self.args.pod_order == PodOrder::Descending {
            pods.reverse();
        }
    }
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::CustomPolicyOne(args) => args,
        other => return Err(FrameworkError::arg_type(PLUGIN_NAME, "CustomPolicyOneArgs", &other)),
    };
    Ok(PluginInstance::new(PLUGIN_NAME).with_balance(Arc::new(CustomPolicyOne::from_args(args))))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::CustomPolicyOne(CustomPolicyOneArgs::default()),
        decode: |raw| Ok(PluginArgs::CustomPolicyOne(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::CustomPolicyOne(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::CustomPolicyOne(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Balance],
    }
}

impl Plugin for CustomPolicyOne {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

#[async_trait]
impl BalancePlugin for CustomPolicyOne {
    async fn balance(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status {
        let names = resource_names(&self.args.thresholds, &self.args.target_thresholds);
        let usages = compute_node_usage(nodes, &names, handle.pod_lister(), &is_active_pod);
        let thresholds = compute_node_thresholds(
            &usages,
            &self.args.thresholds,
            &self.args.target_thresholds,
            &names,
            self.args.use_deviation_thresholds,
        );
        let (low_nodes, mut source_nodes) =
            classify_nodes(usages, thresholds, is_underutilized, is_overutilized);

        if source_nodes.is_empty() || low_nodes.is_empty() {
            info!(
                "{}: {} underutilized and {} overutilized nodes, nothing to do here",
                PLUGIN_NAME,
                low_nodes.len(),
                source_nodes.len()
            );
            return Status::success();
        }
        if low_nodes.len() <= self.args.number_of_nodes {
            info!(
                "number of underutilized nodes ({}) is not above numberOfNodes ({}), nothing to do here",
                low_nodes.len(),
                self.args.number_of_nodes
            );
            return Status::success();
        }

        source_nodes.sort_by(|a, b| {
            cpu_utilization(b, &names)
                .partial_cmp(&cpu_utilization(a, &names))
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name().cmp(b.name()))
        });

        let evictor = handle.evictor();
        for source in source_nodes.iter_mut() {
            let mut candidates: Vec<Arc<Pod>> = source
                .usage
                .pods
                .iter()
                .filter(|p| {
                    evictor.filter(p) && namespace_allowed(self.args.evictable_namespaces.as_ref(), p)
                })
                .cloned()
                .collect();
            if candidates.is_empty() {
                debug!("no evictable pods on node {}", source.name());
                continue;
            }
            self.order_candidates(&mut candidates);
            info!(
                "{}: draining node {} ({:.1}% cpu)",
                PLUGIN_NAME,
                source.name(),
                cpu_utilization(source, &names)
            );

            for pod in candidates {
                if !is_overutilized(source) {
                    debug!("node {} is back under its target thresholds", source.name());
                    break;
                }
                match self.picker.pick(&pod, &low_nodes) {
                    Some(dest) => info!("pod {} would fit best on node {}", pod_name(&pod), dest.name()),
                    None => debug!("no destination suggested for pod {}", pod_name(&pod)),
                }

                let opts = EvictOptions::new(PLUGIN_NAME).with_reason("node is above target utilization");
                match evict_one(ctx, evictor, &pod, opts).await {
                    Ok(Step::Evicted) => {
                        let requests = pod_requests(&pod, &names).unwrap_or_default();
                        source.subtract(&requests);
                    }
                    Ok(Step::NextPod) => {}
                    Ok(Step::NextNode) => break,
                    Ok(Step::Stop) => return Status::success(),
                    Err(status) => return status,
                }
            }
        }
        Status::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::plugins::defaultevictor::DefaultEvictorArgs;
    use crate::framework::plugins::nodeutilization::usage::{NodeThresholds, NodeUsage};
    use crate::framework::profile::test_handle;
    use crate::helpers::pod_helpers::ResourceList;
    use crate::test_helpers::fake_client::FakeClusterClient;
    use crate::test_helpers::objects::{node, pod};

    fn args() -> CustomPolicyOneArgs {
        let mut args = CustomPolicyOneArgs {
            thresholds: ResourceThresholds::from([("cpu".to_string(), 20.0)]),
            target_thresholds: ResourceThresholds::from([("cpu".to_string(), 50.0)]),
            ..Default::default()
        };
        set_defaults(&mut args);
        args
    }

    fn replica(name: &str, node: &str, cpu: &str) -> Pod {
        pod("default", name).owned_by("ReplicaSet", name).on_node(node).with_cpu_request(cpu).build()
    }

    fn cluster(pods: Vec<Pod>) -> (Vec<Node>, Vec<Pod>, Arc<FakeClusterClient>) {
        let nodes = vec![
            node("busy").with_allocatable("2", "4Gi", "10").build(),
            node("idle").with_allocatable("2", "4Gi", "10").build(),
        ];
        let client = Arc::new(FakeClusterClient::new(nodes.clone(), pods.clone()));
        (nodes, pods, client)
    }

    #[tokio::test]
    async fn per_node_limit_allows_exactly_one_eviction() {
        let (nodes, pods, client) = cluster(vec![
            replica("a", "busy", "600m"),
            replica("b", "busy", "600m"),
            replica("c", "busy", "600m"),
        ]);
        let handle = test_handle(client.clone(), nodes.clone(), pods, DefaultEvictorArgs::default(), Some(1));
        let plugin = CustomPolicyOne::from_args(args());

        let status = plugin.balance(&CancellationToken::new(), &handle, &nodes).await;
        assert!(status.is_success());
        assert_eq!(client.evicted().len(), 1);
    }

    #[tokio::test]
    async fn should_never_select_daemonset_pods() {
        let (nodes, pods, client) = cluster(vec![
            pod("kube-system", "agent").owned_by("DaemonSet", "agent").on_node("busy").with_cpu_request("100m").build(),
            replica("a", "busy", "900m"),
            replica("b", "busy", "900m"),
        ]);
        let handle = test_handle(client.clone(), nodes.clone(), pods, DefaultEvictorArgs::default(), None);
        let plugin = CustomPolicyOne::from_args(args());

        plugin.balance(&CancellationToken::new(), &handle, &nodes).await;
        let evicted = client.evicted();
        assert!(!evicted.is_empty());
        assert!(!evicted.contains(&"kube-system/agent".to_string()));
    }

    #[tokio::test]
    async fn cancellation_after_first_eviction_halts_with_error() {
        let (nodes, pods, client) = cluster(vec![
            replica("a", "busy", "600m"),
            replica("b", "busy", "600m"),
            replica("c", "busy", "600m"),
        ]);
        let ctx = CancellationToken::new();
        client.cancel_after(1, ctx.clone());
        let handle = test_handle(client.clone(), nodes.clone(), pods, DefaultEvictorArgs::default(), None);
        let plugin = CustomPolicyOne::from_args(args());

        let status = plugin.balance(&ctx, &handle, &nodes).await;
        assert!(!status.is_success());
        assert_eq!(client.evicted().len(), 1);
    }

    #[tokio::test]
    async fn should_follow_pod_order() {
        let pods = vec![
            replica("small", "busy", "300m"),
            replica("large", "busy", "900m"),
            replica("medium", "busy", "600m"),
        ];

        let (nodes, pods_asc, client) = cluster(pods.clone());
        let handle = test_handle(client.clone(), nodes.clone(), pods_asc, DefaultEvictorArgs::default(), None);
        CustomPolicyOne::from_args(args())
            .balance(&CancellationToken::new(), &handle, &nodes)
            .await;
        assert_eq!(client.evicted(), vec!["default/small".to_string(), "default/medium".to_string()]);

        let (nodes, pods_desc, client) = cluster(pods);
        let handle = test_handle(client.clone(), nodes.clone(), pods_desc, DefaultEvictorArgs::default(), None);
        let mut descending = args();
        descending.pod_order = PodOrder::Descending;
        CustomPolicyOne::from_args(descending)
            .balance(&CancellationToken::new(), &handle, &nodes)
            .await;
        assert_eq!(client.evicted(), vec!["default/large".to_string()]);
    }

    /// Picks nothing and remembers who asked.
    #[derive(Default)]
    struct RecordingPicker {
        asked: std::sync::Mutex<Vec<String>>,
    }

    impl DestinationPicker for RecordingPicker {
        fn pick<'a>(&self, pod: &Pod, _candidates: &'a [NodeInfo]) -> Option<&'a NodeInfo> {
            self.asked.lock().unwrap().push(pod_name(pod));
            None
        }
    }

    #[tokio::test]
    async fn destination_picker_is_advisory() {
        let (nodes, pods, client) = cluster(vec![
            replica("a", "busy", "600m"),
            replica("b", "busy", "600m"),
            replica("c", "busy", "600m"),
        ]);
        let handle = test_handle(client.clone(), nodes.clone(), pods, DefaultEvictorArgs::default(), None);
        let picker = Arc::new(RecordingPicker::default());
        let plugin = CustomPolicyOne::from_args(args()).with_destination_picker(picker.clone());

        let status = plugin.balance(&CancellationToken::new(), &handle, &nodes).await;
        assert!(status.is_success());
        // 1800m on 2 cores needs two 600m evictions to get under 50%
        assert_eq!(client.evicted().len(), 2);
        assert_eq!(picker.asked.lock().unwrap().len(), 2);
    }

    fn info(node: Node, cpu_used: i64) -> NodeInfo {
        NodeInfo {
            usage: NodeUsage {
                node,
                usage: ResourceList::from([(RESOURCE_CPU.to_string(), cpu_used)]),
                pods: vec![],
            },
            thresholds: NodeThresholds::default(),
        }
    }

    #[test]
    fn picker_prefers_related_nodes() {
        let picker = LabelAffinityPicker::new(vec!["app".to_string()]);
        let candidates = vec![
            info(node("roomy").with_allocatable("4", "4Gi", "10").build(), 0),
            info(node("web").with_allocatable("4", "4Gi", "10").with_label("app", "web").build(), 3000),
        ];
        let web = pod("default", "web").with_label("app", "web").build();
        assert_eq!(picker.pick(&web, &candidates).map(|n| n.name()), Some("web"));

        let other = pod("default", "db").with_label("app", "db").build();
        assert_eq!(picker.pick(&other, &candidates).map(|n| n.name()), Some("roomy"));
        assert!(picker.pick(&other, &[]).is_none());
    }

    #[test]
    fn test_set_defaults() {
        let mut args = CustomPolicyOneArgs::default();
        set_defaults(&mut args);
        assert_eq!(args.relatedness_label_keys, vec!["app", "service", "database"]);
        assert_eq!(args.pod_order, PodOrder::Ascending);

        let mut custom = CustomPolicyOneArgs {
            relatedness_label_keys: vec!["team".to_string()],
            ..Default::default()
        };
        set_defaults(&mut custom);
        assert_eq!(custom.relatedness_label_keys, vec!["team"]);
    }

    #[test]
    fn should_decode_pod_order() {
        let args: CustomPolicyOneArgs = serde_yaml::from_str(
            "thresholds: {cpu: 20}\ntargetThresholds: {cpu: 50}\npodOrder: Descending\n",
        )
        .unwrap();
        assert_eq!(args.pod_order, PodOrder::Descending);
    }
}
