use crate::api::{validate_label_selector, validate_namespaces, ExtensionPoint, Namespaces, ValidationError};
use crate::framework::plugins::{
    evict_pods, labels_match, namespace_allowed, selector_or_everything, PluginArgs,
};
use crate::framework::registry::PluginRegistration;
use crate::framework::{DeschedulePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use crate::helpers::labels::Selector;
use crate::helpers::node_helpers::node_name;
use crate::helpers::pod_helpers::{pod_name, pod_tolerations, tolerates_taint};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "RemovePodsViolatingNodeTaints";

const NO_SCHEDULE: &str = "NoSchedule";
const PREFER_NO_SCHEDULE: &str = "PreferNoSchedule";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemovePodsViolatingNodeTaintsArgs {
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub include_prefer_no_schedule: bool,
    /// Taints to ignore, as `key` or `key=value`.
    #[serde(default)]
    pub excluded_taints: Vec<String>,
}

pub fn set_defaults(_args: &mut RemovePodsViolatingNodeTaintsArgs) {}

pub fn validate_args(args: &RemovePodsViolatingNodeTaintsArgs) -> Result<(), ValidationError> {
    validate_namespaces(args.namespaces.as_ref())?;
    validate_label_selector(args.label_selector.as_ref())
}

pub struct RemovePodsViolatingNodeTaints {
    args: RemovePodsViolatingNodeTaintsArgs,
    selector: Selector,
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::RemovePodsViolatingNodeTaints(args) => args,
        other => {
            return Err(FrameworkError::arg_type(
                PLUGIN_NAME,
                "RemovePodsViolatingNodeTaintsArgs",
                &other,
            ))
        }
    };
    let selector = selector_or_everything(args.label_selector.as_ref());
    Ok(PluginInstance::new(PLUGIN_NAME)
        .with_deschedule(Arc::new(RemovePodsViolatingNodeTaints { args, selector })))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::RemovePodsViolatingNodeTaints(Default::default()),
        decode: |raw| Ok(PluginArgs::RemovePodsViolatingNodeTaints(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::RemovePodsViolatingNodeTaints(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::RemovePodsViolatingNodeTaints(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Deschedule],
    }
}

impl Plugin for RemovePodsViolatingNodeTaints {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

impl RemovePodsViolatingNodeTaints {
    fn is_excluded(&self, taint: &Taint) -> bool {
        self.args.excluded_taints.iter().any(|excluded| match excluded.split_once('=') {
            Some((key, value)) => taint.key == key && taint.value.as_deref().unwrap_or_default() == value,
            None => taint.key == *excluded,
        })
    }

    /// Taints on `node` that running pods have to tolerate.
    fn enforced_taints(&self, node: &Node) -> Vec<Taint> {
        node.spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default()
            .into_iter()
            .filter(|t| {
                t.effect == NO_SCHEDULE
                    || (self.args.include_prefer_no_schedule && t.effect == PREFER_NO_SCHEDULE)
            })
            .filter(|t| !self.is_excluded(t))
            .collect()
    }
}

#[async_trait]
impl DeschedulePlugin for RemovePodsViolatingNodeTaints {
    async fn deschedule(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status {
        let evictor = handle.evictor();
        let mut pods: Vec<Arc<Pod>> = vec![];
        for node in nodes {
            let taints = self.enforced_taints(node);
            if taints.is_empty() {
                continue;
            }
            let violating = handle.pod_lister().pods_assigned_to_node(node_name(node), &|pod: &Pod| {
                !taints.iter().all(|t| tolerates_taint(pod_tolerations(pod), t))
                    && evictor.filter(pod)
                    && namespace_allowed(self.args.namespaces.as_ref(), pod)
                    && labels_match(&self.selector, pod)
            });
            for pod in &violating {
                debug!("pod {} does not tolerate the taints of node {}", pod_name(pod), node_name(node));
            }
            pods.extend(violating);
        }
        info!("{}: {} pods violate node taints", PLUGIN_NAME, pods.len());
        evict_pods(ctx, handle, PLUGIN_NAME, &pods, "pod does not tolerate node taint").await
    }
}
