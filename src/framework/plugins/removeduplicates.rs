use crate::api::{validate_namespaces, ExtensionPoint, Namespaces, ValidationError};
use crate::framework::plugins::{
    evict_pods, namespace_allowed, owned_by_excluded_kind, PluginArgs,
};
use crate::framework::registry::PluginRegistration;
use crate::framework::{BalancePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use crate::helpers::node_helpers::{node_name, pod_fits_any_other_node};
use crate::helpers::pod_helpers::{owner_refs, pod_name, pod_namespace};
use async_trait::async_trait;
use itertools::Itertools;
use k8s_openapi::api::core::v1::{Node, Pod};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "RemoveDuplicates";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveDuplicatesArgs {
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
    #[serde(default)]
    pub exclude_owner_kinds: Vec<String>,
}

pub fn set_defaults(_args: &mut RemoveDuplicatesArgs) {}

pub fn validate_args(args: &RemoveDuplicatesArgs) -> Result<(), ValidationError> {
    validate_namespaces(args.namespaces.as_ref())
}

/// Spreads replicas of the same workload that ended up on one node.
pub struct RemoveDuplicates {
    args: RemoveDuplicatesArgs,
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::RemoveDuplicates(args) => args,
        other => return Err(FrameworkError::arg_type(PLUGIN_NAME, "RemoveDuplicatesArgs", &other)),
    };
    Ok(PluginInstance::new(PLUGIN_NAME).with_balance(Arc::new(RemoveDuplicates { args })))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::RemoveDuplicates(RemoveDuplicatesArgs::default()),
        decode: |raw| Ok(PluginArgs::RemoveDuplicates(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::RemoveDuplicates(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::RemoveDuplicates(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Balance],
    }
}

impl Plugin for RemoveDuplicates {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

/// Namespace, owners and sorted container images: pods with equal keys are
/// replicas of the same thing.
fn duplicate_key(pod: &Pod) -> String {
    let owners = owner_refs(pod)
        .iter()
        .map(|o| format!("{}/{}", o.kind, o.name))
        .sorted()
        .join(",");
    let images = pod
        .spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .filter_map(|c| c.image.clone())
        .sorted()
        .join(",");
    format!("{}|{}|{}", pod_namespace(pod), owners, images)
}

#[async_trait]
impl BalancePlugin for RemoveDuplicates {
    async fn balance(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status {
        let evictor = handle.evictor();
        let mut duplicates: Vec<Arc<Pod>> = vec![];

        for node in nodes {
            let pods = handle.pod_lister().pods_assigned_to_node(node_name(node), &|pod: &Pod| {
                !owner_refs(pod).is_empty()
                    && !owned_by_excluded_kind(&self.args.exclude_owner_kinds, pod)
                    && evictor.filter(pod)
                    && namespace_allowed(self.args.namespaces.as_ref(), pod)
            });

            let mut groups: BTreeMap<String, Vec<Arc<Pod>>> = BTreeMap::new();
            for pod in pods {
                groups.entry(duplicate_key(&pod)).or_default().push(pod);
            }
            for (key, group) in groups {
                if group.len() < 2 {
                    continue;
                }
                if !pod_fits_any_other_node(&group[0], nodes, handle.pod_lister()) {
                    debug!("duplicates {} on node {} fit on no other node", key, node_name(node));
                    continue;
                }
                debug!(
                    "node {} runs {} copies of {}",
                    node_name(node),
                    group.len(),
                    pod_name(&group[0])
                );
                duplicates.extend(group.into_iter().skip(1));
            }
        }

        info!("{}: {} duplicate pods to evict", PLUGIN_NAME, duplicates.len());
        evict_pods(ctx, handle, PLUGIN_NAME, &duplicates, "pod is a duplicate").await
    }
}
