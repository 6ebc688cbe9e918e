use crate::api::{validate_label_selector, validate_namespaces, ExtensionPoint, Namespaces, ValidationError};
use crate::evictions::EvictOptions;
use crate::framework::plugins::{
    evict_one, labels_match, namespace_allowed, pods_on_nodes, selector_or_everything, PluginArgs, Step,
};
use crate::framework::registry::PluginRegistration;
use crate::framework::{DeschedulePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use crate::helpers::labels::Selector;
use crate::helpers::node_helpers::{node_labels, node_name};
use crate::helpers::pod_helpers::{
    pod_labels, pod_name, pod_namespace, pod_node_name, sort_pods_by_priority_low_to_high,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, PodAffinityTerm};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "RemovePodsViolatingInterPodAntiAffinity";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemovePodsViolatingInterPodAntiAffinityArgs {
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
}

pub fn set_defaults(_args: &mut RemovePodsViolatingInterPodAntiAffinityArgs) {}

pub fn validate_args(args: &RemovePodsViolatingInterPodAntiAffinityArgs) -> Result<(), ValidationError> {
    validate_namespaces(args.namespaces.as_ref())?;
    validate_label_selector(args.label_selector.as_ref())
}

pub struct RemovePodsViolatingInterPodAntiAffinity {
    args: RemovePodsViolatingInterPodAntiAffinityArgs,
    selector: Selector,
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::RemovePodsViolatingInterPodAntiAffinity(args) => args,
        other => {
            return Err(FrameworkError::arg_type(
                PLUGIN_NAME,
                "RemovePodsViolatingInterPodAntiAffinityArgs",
                &other,
            ))
        }
    };
    let selector = selector_or_everything(args.label_selector.as_ref());
    Ok(PluginInstance::new(PLUGIN_NAME)
        .with_deschedule(Arc::new(RemovePodsViolatingInterPodAntiAffinity { args, selector })))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::RemovePodsViolatingInterPodAntiAffinity(Default::default()),
        decode: |raw| {
            Ok(PluginArgs::RemovePodsViolatingInterPodAntiAffinity(
                serde_yaml::from_value(raw)?,
            ))
        },
        validate: |args| match args {
            PluginArgs::RemovePodsViolatingInterPodAntiAffinity(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::RemovePodsViolatingInterPodAntiAffinity(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Deschedule],
    }
}

impl Plugin for RemovePodsViolatingInterPodAntiAffinity {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

fn anti_affinity_terms(pod: &Pod) -> &[PodAffinityTerm] {
    pod.spec
        .as_ref()
        .and_then(|s| s.affinity.as_ref())
        .and_then(|a| a.pod_anti_affinity.as_ref())
        .and_then(|aa| aa.required_during_scheduling_ignored_during_execution.as_deref())
        .unwrap_or_default()
}

fn same_topology(a: Option<&Node>, b: Option<&Node>, topology_key: &str) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => match (node_labels(a).get(topology_key), node_labels(b).get(topology_key)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => false,
    }
}

/// True when one of the pod's required anti-affinity terms selects another
/// pod in the same topology domain. A term without a label selector selects
/// nothing.
fn violates_anti_affinity(pod: &Pod, others: &[Arc<Pod>], nodes: &HashMap<&str, &Node>) -> bool {
    let own_node = pod_node_name(pod).and_then(|n| nodes.get(n).copied());
    anti_affinity_terms(pod).iter().any(|term| {
        let Some(selector) = term.label_selector.as_ref().and_then(|s| Selector::try_from(s).ok()) else {
            return false;
        };
        let namespaces: Vec<&str> = match term.namespaces.as_deref() {
            Some(ns) if !ns.is_empty() => ns.iter().map(String::as_str).collect(),
            _ => vec![pod_namespace(pod)],
        };
        others.iter().any(|other| {
            pod_name(other) != pod_name(pod)
                && namespaces.contains(&pod_namespace(other))
                && selector.matches(pod_labels(other))
                && same_topology(
                    own_node,
                    pod_node_name(other).and_then(|n| nodes.get(n).copied()),
                    &term.topology_key,
                )
        })
    })
}

#[async_trait]
impl DeschedulePlugin for RemovePodsViolatingInterPodAntiAffinity {
    async fn deschedule(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status {
        let evictor = handle.evictor();
        let by_name: HashMap<&str, &Node> = nodes.iter().map(|n| (node_name(n), n)).collect();
        // every pod on the cycle's nodes; evicted pods drop out so their
        // peers are not evicted for the same conflict
        let mut remaining = pods_on_nodes(handle, nodes, &|_| true);

        for node in nodes {
            let mut candidates = handle.pod_lister().pods_assigned_to_node(node_name(node), &|pod: &Pod| {
                !anti_affinity_terms(pod).is_empty()
                    && evictor.filter(pod)
                    && namespace_allowed(self.args.namespaces.as_ref(), pod)
                    && labels_match(&self.selector, pod)
            });
            sort_pods_by_priority_low_to_high(&mut candidates);

            for pod in &candidates {
                if evictor.node_limit_exceeded(node_name(node)) {
                    break;
                }
                if !violates_anti_affinity(pod, &remaining, &by_name) {
                    continue;
                }
                debug!("pod {} violates inter-pod anti-affinity on node {}", pod_name(pod), node_name(node));
                let opts = EvictOptions::new(PLUGIN_NAME).with_reason("pod violates inter-pod anti-affinity");
                match evict_one(ctx, evictor, pod, opts).await {
                    Ok(Step::Evicted) => {
                        let evicted = pod_name(pod);
                        remaining.retain(|p| pod_name(p) != evicted);
                    }
                    Ok(Step::NextPod) => {}
                    Ok(Step::NextNode) => break,
                    Ok(Step::Stop) => return Status::success(),
                    Err(status) => return status,
                }
            }
        }
        info!("{}: {} pods evicted in total so far", PLUGIN_NAME, evictor.total_evicted());
        Status::success()
    }
}
