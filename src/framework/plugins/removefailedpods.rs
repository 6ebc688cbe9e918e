use crate::api::{validate_label_selector, validate_namespaces, ExtensionPoint, Namespaces, ValidationError};
use crate::framework::plugins::{
    evict_pods, labels_match, namespace_allowed, owned_by_excluded_kind, pods_on_nodes,
    selector_or_everything, PluginArgs,
};
use crate::framework::registry::PluginRegistration;
use crate::framework::{DeschedulePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use crate::helpers::labels::Selector;
use crate::helpers::pod_helpers::{pod_creation_time, pod_phase};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{ContainerStatus, Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "RemoveFailedPods";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveFailedPodsArgs {
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub exclude_owner_kinds: Vec<String>,
    /// Pod or container reasons to match; empty matches every failed pod.
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub including_init_containers: bool,
    #[serde(default)]
    pub min_pod_lifetime_seconds: Option<u64>,
}

pub fn set_defaults(_args: &mut RemoveFailedPodsArgs) {}

pub fn validate_args(args: &RemoveFailedPodsArgs) -> Result<(), ValidationError> {
    validate_namespaces(args.namespaces.as_ref())?;
    validate_label_selector(args.label_selector.as_ref())
}

pub struct RemoveFailedPods {
    args: RemoveFailedPodsArgs,
    selector: Selector,
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::RemoveFailedPods(args) => args,
        other => return Err(FrameworkError::arg_type(PLUGIN_NAME, "RemoveFailedPodsArgs", &other)),
    };
    let selector = selector_or_everything(args.label_selector.as_ref());
    Ok(PluginInstance::new(PLUGIN_NAME).with_deschedule(Arc::new(RemoveFailedPods { args, selector })))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::RemoveFailedPods(RemoveFailedPodsArgs::default()),
        decode: |raw| Ok(PluginArgs::RemoveFailedPods(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::RemoveFailedPods(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::RemoveFailedPods(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Deschedule],
    }
}

impl Plugin for RemoveFailedPods {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

fn container_reasons(statuses: Option<&Vec<ContainerStatus>>) -> Vec<String> {
    statuses
        .into_iter()
        .flatten()
        .filter_map(|cs| cs.state.as_ref())
        .flat_map(|state| {
            let waiting = state.waiting.as_ref().and_then(|w| w.reason.clone());
            let terminated = state.terminated.as_ref().and_then(|t| t.reason.clone());
            waiting.into_iter().chain(terminated)
        })
        .collect()
}

impl RemoveFailedPods {
    fn failure_reasons(&self, pod: &Pod) -> Vec<String> {
        let status = match pod.status.as_ref() {
            None => return vec![],
            Some(status) => status,
        };
        let mut reasons: Vec<String> = status.reason.iter().cloned().collect();
        reasons.extend(container_reasons(status.container_statuses.as_ref()));
        if self.args.including_init_containers {
            reasons.extend(container_reasons(status.init_container_statuses.as_ref()));
        }
        reasons
    }

    fn should_evict(&self, pod: &Pod) -> Result<(), String> {
        if owned_by_excluded_kind(&self.args.exclude_owner_kinds, pod) {
            return Err("pod owner kind is excluded".to_string());
        }
        if let Some(min) = self.args.min_pod_lifetime_seconds {
            if let Some(created) = pod_creation_time(pod) {
                let age = (Utc::now() - created).num_seconds();
                if age < min as i64 {
                    return Err(format!("pod is {}s old, younger than {}s", age, min));
                }
            }
        }
        if !self.args.reasons.is_empty() {
            let reasons = self.failure_reasons(pod);
            if !reasons.iter().any(|r| self.args.reasons.contains(r)) {
                return Err(format!("pod failure reasons {:?} are not configured", reasons));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeschedulePlugin for RemoveFailedPods {
    async fn deschedule(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status {
        let evictor = handle.evictor();
        let pods = pods_on_nodes(handle, nodes, &|pod: &Pod| {
            pod_phase(pod) == "Failed"
                && evictor.filter(pod)
                && namespace_allowed(self.args.namespaces.as_ref(), pod)
                && labels_match(&self.selector, pod)
                && self.should_evict(pod).is_ok()
        });
        info!("{}: {} failed pods to evict", PLUGIN_NAME, pods.len());
        evict_pods(ctx, handle, PLUGIN_NAME, &pods, "pod has failed").await
    }
}
