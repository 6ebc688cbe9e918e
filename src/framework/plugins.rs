pub mod custompolicy;
pub mod defaultevictor;
pub mod nodeutilization;
pub mod podlifetime;
pub mod removeduplicates;
pub mod removefailedpods;
pub mod removepodshavingtoomanyrestarts;
pub mod removepodsviolatinginterpodantiaffinity;
pub mod removepodsviolatingnodeaffinity;
pub mod removepodsviolatingnodetaints;

use crate::api::Namespaces;
use crate::cache::PodFilter;
use crate::evictions::{EvictOptions, EvictionError, EvictionOutcome, LimitKind};
use crate::framework::{Evictor, Handle, Status};
use crate::helpers::labels::Selector;
use crate::helpers::node_helpers::node_name;
use crate::helpers::pod_helpers::{owner_refs, pod_labels, pod_name, pod_namespace, pod_node_name};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::{debug, warn};
use std::sync::Arc;
use strum_macros::IntoStaticStr;
use tokio_util::sync::CancellationToken;

use custompolicy::CustomPolicyOneArgs;
use defaultevictor::DefaultEvictorArgs;
use nodeutilization::{HighNodeUtilizationArgs, LowNodeUtilizationArgs};
use podlifetime::PodLifeTimeArgs;
use removeduplicates::RemoveDuplicatesArgs;
use removefailedpods::RemoveFailedPodsArgs;
use removepodshavingtoomanyrestarts::RemovePodsHavingTooManyRestartsArgs;
use removepodsviolatinginterpodantiaffinity::RemovePodsViolatingInterPodAntiAffinityArgs;
use removepodsviolatingnodeaffinity::RemovePodsViolatingNodeAffinityArgs;
use removepodsviolatingnodetaints::RemovePodsViolatingNodeTaintsArgs;

/// Decoded arguments of every built-in plugin.
#[derive(Debug, Clone, PartialEq, IntoStaticStr)]
pub enum PluginArgs {
    DefaultEvictor(DefaultEvictorArgs),
    LowNodeUtilization(LowNodeUtilizationArgs),
    HighNodeUtilization(HighNodeUtilizationArgs),
    CustomPolicyOne(CustomPolicyOneArgs),
    RemoveDuplicates(RemoveDuplicatesArgs),
    RemoveFailedPods(RemoveFailedPodsArgs),
    RemovePodsHavingTooManyRestarts(RemovePodsHavingTooManyRestartsArgs),
    RemovePodsViolatingNodeTaints(RemovePodsViolatingNodeTaintsArgs),
    RemovePodsViolatingNodeAffinity(RemovePodsViolatingNodeAffinityArgs),
    RemovePodsViolatingInterPodAntiAffinity(RemovePodsViolatingInterPodAntiAffinityArgs),
    PodLifeTime(PodLifeTimeArgs),
}

impl PluginArgs {
    /// Variant name, for error messages.
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

/// What a strategy does after asking the evictor for one pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Evicted,
    NextPod,
    NextNode,
    Stop,
}

/// Asks the evictor for one pod and maps the answer onto the strategy's next
/// move. Cancellation comes back as an error status.
pub(crate) async fn evict_one(
    ctx: &CancellationToken,
    evictor: &dyn Evictor,
    pod: &Pod,
    opts: EvictOptions,
) -> Result<Step, Status> {
    match evictor.evict(ctx, pod, opts).await {
        Ok(outcome) if outcome.is_evicted() => Ok(Step::Evicted),
        Ok(EvictionOutcome::LimitReached(LimitKind::Node)) => Ok(Step::NextNode),
        Ok(EvictionOutcome::LimitReached(LimitKind::Total)) => Ok(Step::Stop),
        Ok(outcome) => {
            debug!("pod {} not evicted: {:?}", pod_name(pod), outcome);
            Ok(Step::NextPod)
        }
        Err(EvictionError::Cancelled) => Err(Status::error("descheduling cycle cancelled")),
        Err(err) => {
            warn!("failed to evict pod {}: {}", pod_name(pod), err);
            Ok(Step::NextPod)
        }
    }
}

/// Evicts the given pods in order, skipping nodes whose limit is reached.
pub(crate) async fn evict_pods(
    ctx: &CancellationToken,
    handle: &dyn Handle,
    plugin: &str,
    pods: &[Arc<Pod>],
    reason: &str,
) -> Status {
    let evictor = handle.evictor();
    for pod in pods {
        let node = pod_node_name(pod).unwrap_or_default();
        if evictor.node_limit_exceeded(node) {
            continue;
        }
        let opts = EvictOptions::new(plugin).with_reason(reason);
        match evict_one(ctx, evictor, pod, opts).await {
            Ok(Step::Stop) => break,
            Ok(_) => {}
            Err(status) => return status,
        }
    }
    Status::success()
}

/// Pods on the given nodes passing `filter`, node by node.
pub(crate) fn pods_on_nodes(handle: &dyn Handle, nodes: &[Node], filter: &PodFilter<'_>) -> Vec<Arc<Pod>> {
    nodes
        .iter()
        .flat_map(|node| handle.pod_lister().pods_assigned_to_node(node_name(node), filter))
        .collect()
}

/// Selector for already validated args; a missing selector selects everything.
pub(crate) fn selector_or_everything(selector: Option<&LabelSelector>) -> Selector {
    selector
        .and_then(|s| Selector::try_from(s).ok())
        .unwrap_or_else(Selector::everything)
}

pub(crate) fn namespace_allowed(namespaces: Option<&Namespaces>, pod: &Pod) -> bool {
    namespaces.map(|ns| ns.allows(pod_namespace(pod))).unwrap_or(true)
}

pub(crate) fn labels_match(selector: &Selector, pod: &Pod) -> bool {
    selector.is_empty() || selector.matches(pod_labels(pod))
}

pub(crate) fn owned_by_excluded_kind(excluded: &[String], pod: &Pod) -> bool {
    owner_refs(pod).iter().any(|o| excluded.contains(&o.kind))
}
