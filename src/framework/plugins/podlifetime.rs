use crate::api::{validate_label_selector, validate_namespaces, ExtensionPoint, Namespaces, ValidationError};
use crate::framework::plugins::{
    evict_pods, labels_match, namespace_allowed, pods_on_nodes, selector_or_everything, PluginArgs,
};
use crate::framework::registry::PluginRegistration;
use crate::framework::{DeschedulePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use crate::helpers::labels::Selector;
use crate::helpers::pod_helpers::{pod_creation_time, pod_name, pod_phase};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "PodLifeTime";

/// Pod phases and container waiting reasons `states` may name.
const ALLOWED_STATES: [&str; 10] = [
    "Running",
    "Pending",
    "PodInitializing",
    "ContainerCreating",
    "ImagePullBackOff",
    "ErrImagePull",
    "CrashLoopBackOff",
    "CreateContainerError",
    "CreateContainerConfigError",
    "InvalidImageName",
];

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodLifeTimeArgs {
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub max_pod_life_time_seconds: Option<u64>,
    /// Only pods in one of these phases or waiting reasons are evicted.
    #[serde(default)]
    pub states: Vec<String>,
}

pub fn set_defaults(_args: &mut PodLifeTimeArgs) {}

pub fn validate_args(args: &PodLifeTimeArgs) -> Result<(), ValidationError> {
    if args.max_pod_life_time_seconds.is_none() {
        return Err(ValidationError::Invalid("MaxPodLifeTimeSeconds not set".to_string()));
    }
    validate_namespaces(args.namespaces.as_ref())?;
    validate_label_selector(args.label_selector.as_ref())?;
    let unknown: Vec<&String> = args
        .states
        .iter()
        .filter(|s| !ALLOWED_STATES.contains(&s.as_str()))
        .collect();
    if !unknown.is_empty() {
        return Err(ValidationError::Invalid(format!(
            "states must be one of {:?}, got {:?}",
            ALLOWED_STATES, unknown
        )));
    }
    Ok(())
}

pub struct PodLifeTime {
    args: PodLifeTimeArgs,
    selector: Selector,
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::PodLifeTime(args) => args,
        other => return Err(FrameworkError::arg_type(PLUGIN_NAME, "PodLifeTimeArgs", &other)),
    };
    let selector = selector_or_everything(args.label_selector.as_ref());
    Ok(PluginInstance::new(PLUGIN_NAME).with_deschedule(Arc::new(PodLifeTime { args, selector })))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::PodLifeTime(PodLifeTimeArgs::default()),
        decode: |raw| Ok(PluginArgs::PodLifeTime(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::PodLifeTime(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::PodLifeTime(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Deschedule],
    }
}

impl Plugin for PodLifeTime {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

fn waiting_reasons(pod: &Pod) -> impl Iterator<Item = &str> {
    pod.status
        .iter()
        .flat_map(|s| s.container_statuses.iter().flatten())
        .filter_map(|cs| cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
}

impl PodLifeTime {
    fn in_state(&self, pod: &Pod) -> bool {
        if self.args.states.is_empty() {
            return true;
        }
        self.args.states.iter().any(|s| s == pod_phase(pod))
            || waiting_reasons(pod).any(|r| self.args.states.iter().any(|s| s == r))
    }

    /// Pods without a creation timestamp never expire. Ages are compared as
    /// unsigned seconds so any configured limit stays meaningful.
    fn is_expired(&self, pod: &Pod, now: DateTime<Utc>) -> bool {
        let Some(max) = self.args.max_pod_life_time_seconds else {
            return false;
        };
        pod_creation_time(pod)
            .and_then(|created| u64::try_from((now - created).num_seconds()).ok())
            .is_some_and(|age| age > max)
    }
}

#[async_trait]
impl DeschedulePlugin for PodLifeTime {
    async fn deschedule(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status {
        let evictor = handle.evictor();
        let now = Utc::now();
        let mut pods = pods_on_nodes(handle, nodes, &|pod: &Pod| {
            self.is_expired(pod, now)
                && self.in_state(pod)
                && evictor.filter(pod)
                && namespace_allowed(self.args.namespaces.as_ref(), pod)
                && labels_match(&self.selector, pod)
        });
        // oldest first
        pods.sort_by(|a, b| {
            pod_creation_time(a)
                .cmp(&pod_creation_time(b))
                .then_with(|| pod_name(a).cmp(&pod_name(b)))
        });
        info!("{}: {} pods exceeded their lifetime", PLUGIN_NAME, pods.len());
        evict_pods(ctx, handle, PLUGIN_NAME, &pods, "pod exceeded its maximum lifetime").await
    }
}
