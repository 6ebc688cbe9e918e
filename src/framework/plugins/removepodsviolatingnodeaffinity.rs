use crate::api::{validate_label_selector, validate_namespaces, ExtensionPoint, Namespaces, ValidationError};
use crate::framework::plugins::{
    evict_pods, labels_match, namespace_allowed, selector_or_everything, PluginArgs,
};
use crate::framework::registry::PluginRegistration;
use crate::framework::{DeschedulePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use crate::helpers::labels::Selector;
use crate::helpers::node_helpers::{
    node_name, pod_fits_any_other_node, pod_fits_on_node, pod_matches_required_node_affinity,
    preferred_node_affinity_weight,
};
use crate::helpers::pod_helpers::pod_name;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "RemovePodsViolatingNodeAffinity";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum NodeAffinityType {
    #[strum(serialize = "requiredDuringSchedulingIgnoredDuringExecution")]
    Required,
    #[strum(serialize = "preferredDuringSchedulingIgnoredDuringExecution")]
    Preferred,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemovePodsViolatingNodeAffinityArgs {
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub node_affinity_type: Vec<String>,
}

pub fn set_defaults(_args: &mut RemovePodsViolatingNodeAffinityArgs) {}

pub fn validate_args(args: &RemovePodsViolatingNodeAffinityArgs) -> Result<(), ValidationError> {
    if args.node_affinity_type.is_empty() {
        return Err(ValidationError::Invalid("nodeAffinityType needs to be set".to_string()));
    }
    for kind in &args.node_affinity_type {
        NodeAffinityType::from_str(kind)
            .map_err(|_| ValidationError::Invalid(format!("unsupported nodeAffinityType {:?}", kind)))?;
    }
    validate_namespaces(args.namespaces.as_ref())?;
    validate_label_selector(args.label_selector.as_ref())
}

pub struct RemovePodsViolatingNodeAffinity {
    args: RemovePodsViolatingNodeAffinityArgs,
    selector: Selector,
    kinds: Vec<NodeAffinityType>,
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::RemovePodsViolatingNodeAffinity(args) => args,
        other => {
            return Err(FrameworkError::arg_type(
                PLUGIN_NAME,
                "RemovePodsViolatingNodeAffinityArgs",
                &other,
            ))
        }
    };
    Ok(PluginInstance::new(PLUGIN_NAME).with_deschedule(Arc::new(RemovePodsViolatingNodeAffinity::new(args))))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::RemovePodsViolatingNodeAffinity(Default::default()),
        decode: |raw| Ok(PluginArgs::RemovePodsViolatingNodeAffinity(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::RemovePodsViolatingNodeAffinity(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::RemovePodsViolatingNodeAffinity(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Deschedule],
    }
}

impl Plugin for RemovePodsViolatingNodeAffinity {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

impl RemovePodsViolatingNodeAffinity {
    fn new(args: RemovePodsViolatingNodeAffinityArgs) -> Self {
        let selector = selector_or_everything(args.label_selector.as_ref());
        let kinds = args
            .node_affinity_type
            .iter()
            .filter_map(|k| NodeAffinityType::from_str(k).ok())
            .collect();
        Self { args, selector, kinds }
    }

    /// True when another node ranks strictly higher in the pod's preferred
    /// node affinity and could take the pod.
    fn better_node_exists(&self, pod: &Pod, node: &Node, nodes: &[Node], handle: &dyn Handle) -> bool {
        let current = preferred_node_affinity_weight(pod, node);
        nodes
            .iter()
            .filter(|n| node_name(n) != node_name(node))
            .filter(|n| preferred_node_affinity_weight(pod, n) > current)
            .any(|n| {
                let node_pods = handle.pod_lister().pods_assigned_to_node(node_name(n), &|_| true);
                pod_fits_on_node(pod, n, &node_pods).is_ok()
            })
    }

    async fn deschedule_kind(
        &self,
        ctx: &CancellationToken,
        handle: &dyn Handle,
        nodes: &[Node],
        kind: NodeAffinityType,
    ) -> Status {
        let evictor = handle.evictor();
        let mut pods: Vec<Arc<Pod>> = vec![];
        for node in nodes {
            let violating = handle.pod_lister().pods_assigned_to_node(node_name(node), &|pod: &Pod| {
                let violates = match kind {
                    NodeAffinityType::Required => {
                        !pod_matches_required_node_affinity(pod, node)
                            && pod_fits_any_other_node(pod, nodes, handle.pod_lister())
                    }
                    NodeAffinityType::Preferred => {
                        pod_matches_required_node_affinity(pod, node)
                            && self.better_node_exists(pod, node, nodes, handle)
                    }
                };
                violates
                    && evictor.filter(pod)
                    && namespace_allowed(self.args.namespaces.as_ref(), pod)
                    && labels_match(&self.selector, pod)
            });
            for pod in &violating {
                debug!("pod {} violates {} on node {}", pod_name(pod), kind, node_name(node));
            }
            pods.extend(violating);
        }
        info!("{}: {} pods violate {}", PLUGIN_NAME, pods.len(), kind);
        evict_pods(ctx, handle, PLUGIN_NAME, &pods, "pod violates node affinity").await
    }
}

#[async_trait]
impl DeschedulePlugin for RemovePodsViolatingNodeAffinity {
    async fn deschedule(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status {
        for kind in &self.kinds {
            let status = self.deschedule_kind(ctx, handle, nodes, *kind).await;
            if !status.is_success() {
                return status;
            }
        }
        Status::success()
    }
}
