use crate::api::{validate_label_selector, ExtensionPoint, ValidationError};
use crate::cache::ClusterSnapshot;
use crate::framework::plugins::{labels_match, selector_or_everything, PluginArgs};
use crate::framework::registry::PluginRegistration;
use crate::framework::{
    FilterPlugin, FrameworkError, Handle, Plugin, PluginInstance, PreEvictionFilterPlugin,
};
use crate::helpers::labels::Selector;
use crate::helpers::node_helpers::{pod_fits_any_other_node, ready_nodes};
use crate::helpers::pod_helpers::{
    has_evict_annotation, has_local_storage, has_pvc, is_critical_pod, is_daemonset_pod,
    is_mirror_pod, is_pod_terminating, is_static_pod, owner_refs, pod_phase, pod_priority,
    SYSTEM_CRITICAL_PRIORITY,
};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const PLUGIN_NAME: &str = "DefaultEvictor";

/// Either a raw priority value or the name of a PriorityClass.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriorityThreshold {
    #[serde(default)]
    pub value: Option<i32>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefaultEvictorArgs {
    /// Restricts the nodes considered by `nodeFit`.
    #[serde(default)]
    pub node_selector: Option<String>,
    #[serde(default)]
    pub evict_local_storage_pods: bool,
    #[serde(default)]
    pub evict_system_critical_pods: bool,
    #[serde(default)]
    pub ignore_pvc_pods: bool,
    #[serde(default)]
    pub evict_failed_bare_pods: bool,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub priority_threshold: Option<PriorityThreshold>,
    #[serde(default)]
    pub node_fit: bool,
    #[serde(default, rename = "ignorePodsWithoutPDB")]
    pub ignore_pods_without_pdb: bool,
}

pub fn set_defaults(_args: &mut DefaultEvictorArgs) {}

pub fn validate_args(args: &DefaultEvictorArgs) -> Result<(), ValidationError> {
    if let Some(pt) = args.priority_threshold.as_ref() {
        if pt.value.is_some() && pt.name.as_deref().is_some_and(|n| !n.is_empty()) {
            return Err(ValidationError::Invalid(
                "priority threshold misconfigured, only one of priorityThreshold fields can be set"
                    .to_string(),
            ));
        }
    }
    if let Some(selector) = args.node_selector.as_deref() {
        selector
            .parse::<Selector>()
            .map_err(ValidationError::LabelSelector)?;
    }
    validate_label_selector(args.label_selector.as_ref())
}

/// Decides which pods are evictable at all, and re-checks right before the
/// eviction whether the pod still fits elsewhere.
pub struct DefaultEvictor {
    args: DefaultEvictorArgs,
    snapshot: Arc<ClusterSnapshot>,
    label_selector: Selector,
    node_selector: Option<Selector>,
    priority_threshold: i32,
}

pub fn new(args: PluginArgs, handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::DefaultEvictor(args) => args,
        other => return Err(FrameworkError::arg_type(PLUGIN_NAME, "DefaultEvictorArgs", &other)),
    };
    let snapshot = handle.snapshot();

    let priority_threshold = match args.priority_threshold.as_ref() {
        Some(PriorityThreshold { value: Some(value), .. }) => *value,
        Some(PriorityThreshold { name: Some(name), .. }) if !name.is_empty() => {
            snapshot.priority_class_value(name).ok_or_else(|| FrameworkError::Init {
                plugin: PLUGIN_NAME.to_string(),
                message: format!("unable to find priority class {:?}", name),
            })?
        }
        _ => SYSTEM_CRITICAL_PRIORITY,
    };
    if args.evict_system_critical_pods && args.priority_threshold.is_some() {
        warn!("evictSystemCriticalPods is set, the priority threshold is ignored");
    }

    let node_selector = match args.node_selector.as_deref() {
        Some(s) => Some(s.parse::<Selector>().map_err(|e| FrameworkError::Init {
            plugin: PLUGIN_NAME.to_string(),
            message: e.to_string(),
        })?),
        None => None,
    };

    let plugin = Arc::new(DefaultEvictor {
        label_selector: selector_or_everything(args.label_selector.as_ref()),
        node_selector,
        priority_threshold,
        snapshot,
        args,
    });
    Ok(PluginInstance::new(PLUGIN_NAME)
        .with_filter(plugin.clone())
        .with_pre_eviction_filter(plugin))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::DefaultEvictor(DefaultEvictorArgs::default()),
        decode: |raw| Ok(PluginArgs::DefaultEvictor(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::DefaultEvictor(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::DefaultEvictor(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Filter, ExtensionPoint::PreEvictionFilter],
    }
}

impl Plugin for DefaultEvictor {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

impl DefaultEvictor {
    /// Checks skipped for pods carrying the evict annotation.
    fn check_constraints(&self, pod: &Pod) -> Result<(), String> {
        if owner_refs(pod).is_empty() {
            if !(self.args.evict_failed_bare_pods && pod_phase(pod) == "Failed") {
                return Err("pod does not have any ownerRefs".to_string());
            }
        }
        if is_daemonset_pod(pod) {
            return Err("pod is related to daemonset".to_string());
        }
        if !self.args.evict_system_critical_pods {
            if is_critical_pod(pod) {
                return Err("pod has system critical priority".to_string());
            }
            if pod_priority(pod) >= self.priority_threshold {
                return Err("pod has higher priority than specified priority class threshold".to_string());
            }
        }
        if !self.args.evict_local_storage_pods && has_local_storage(pod) {
            return Err(
                "pod has local storage and descheduler is not configured with evictLocalStoragePods"
                    .to_string(),
            );
        }
        if self.args.ignore_pvc_pods && has_pvc(pod) {
            return Err("pod has a PVC and descheduler is configured to ignore PVC pods".to_string());
        }
        Ok(())
    }
}

impl FilterPlugin for DefaultEvictor {
    fn filter(&self, pod: &Pod) -> Result<(), String> {
        if is_pod_terminating(pod) {
            return Err("pod is terminating".to_string());
        }
        if is_mirror_pod(pod) {
            return Err("pod is a mirror pod".to_string());
        }
        if is_static_pod(pod) {
            return Err("pod is a static pod".to_string());
        }
        if !has_evict_annotation(pod) {
            self.check_constraints(pod)?;
        }
        if !labels_match(&self.label_selector, pod) {
            return Err("pod labels do not match the labelSelector filter".to_string());
        }
        if self.args.ignore_pods_without_pdb && !self.snapshot.has_matching_pdb(pod) {
            return Err("pod does not have an associated PDB".to_string());
        }
        Ok(())
    }
}

impl PreEvictionFilterPlugin for DefaultEvictor {
    fn pre_eviction_filter(&self, pod: &Pod) -> Result<(), String> {
        if !self.args.node_fit {
            return Ok(());
        }
        let nodes = ready_nodes(self.snapshot.nodes().to_vec(), self.node_selector.as_ref());
        if nodes.is_empty() {
            return Err("no ready nodes to fit the pod on".to_string());
        }
        if !pod_fits_any_other_node(pod, &nodes, self.snapshot.as_ref()) {
            return Err("pod does not fit on any other node".to_string());
        }
        Ok(())
    }
}
