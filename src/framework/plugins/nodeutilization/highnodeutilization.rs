use super::usage::{
    compute_node_thresholds, compute_node_usage, is_active_pod, is_underutilized, resource_names,
    usage_score, NodeInfo, ResourceAmounts,
};
use super::{evict_pods_from_source_nodes, has_room, validate_thresholds};
use crate::api::{validate_namespaces, ExtensionPoint, Namespaces, ResourceThresholds, ValidationError};
use crate::framework::plugins::PluginArgs;
use crate::framework::registry::PluginRegistration;
use crate::framework::{BalancePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use crate::helpers::node_helpers::is_node_unschedulable;
use async_trait::async_trait;
use itertools::{Either, Itertools};
use k8s_openapi::api::core::v1::Node;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "HighNodeUtilization";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HighNodeUtilizationArgs {
    #[serde(default)]
    pub thresholds: ResourceThresholds,
    #[serde(default)]
    pub number_of_nodes: usize,
    #[serde(default)]
    pub evictable_namespaces: Option<Namespaces>,
}

pub fn set_defaults(_args: &mut HighNodeUtilizationArgs) {}

pub fn validate_args(args: &HighNodeUtilizationArgs) -> Result<(), ValidationError> {
    validate_thresholds(&args.thresholds, None)?;
    validate_namespaces(args.evictable_namespaces.as_ref())
}

/// Compaction: empties the least utilized nodes into the rest of the cluster
/// so the emptied nodes can be scaled down.
pub struct HighNodeUtilization {
    args: HighNodeUtilizationArgs,
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::HighNodeUtilization(args) => args,
        other => {
            return Err(FrameworkError::arg_type(PLUGIN_NAME, "HighNodeUtilizationArgs", &other))
        }
    };
    Ok(PluginInstance::new(PLUGIN_NAME).with_balance(Arc::new(HighNodeUtilization { args })))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::HighNodeUtilization(HighNodeUtilizationArgs::default()),
        decode: |raw| Ok(PluginArgs::HighNodeUtilization(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::HighNodeUtilization(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::HighNodeUtilization(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Balance],
    }
}

impl Plugin for HighNodeUtilization {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

fn keep_evicting(_node: &NodeInfo, available: &ResourceAmounts) -> bool {
    has_room(available)
}

#[async_trait]
impl BalancePlugin for HighNodeUtilization {
    async fn balance(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status {
        // destinations may fill up completely
        let target: ResourceThresholds = self
            .args
            .thresholds
            .keys()
            .map(|k| (k.clone(), 100.0))
            .collect();
        let names = resource_names(&self.args.thresholds, &target);
        let usages = compute_node_usage(nodes, &names, handle.pod_lister(), &is_active_pod);
        let thresholds = compute_node_thresholds(&usages, &self.args.thresholds, &target, &names, false);

        let (mut source_nodes, destination_nodes): (Vec<_>, Vec<_>) = usages
            .into_iter()
            .zip(thresholds)
            .map(|(usage, thresholds)| NodeInfo { usage, thresholds })
            .filter(|info| {
                let schedulable = !is_node_unschedulable(info.node());
                if !schedulable {
                    debug!("node {} is unschedulable, skipping", info.name());
                }
                schedulable
            })
            .partition_map(|info| {
                if is_underutilized(&info) {
                    Either::Left(info)
                } else {
                    Either::Right(info)
                }
            });

        info!(
            "{}: {} underutilized nodes, {} nodes to receive pods",
            PLUGIN_NAME,
            source_nodes.len(),
            destination_nodes.len()
        );
        if source_nodes.is_empty() {
            info!("no node is underutilized, nothing to do here");
            return Status::success();
        }
        if source_nodes.len() <= self.args.number_of_nodes {
            info!(
                "number of underutilized nodes ({}) is not above numberOfNodes ({}), nothing to do here",
                source_nodes.len(),
                self.args.number_of_nodes
            );
            return Status::success();
        }
        if source_nodes.len() == nodes.len() {
            info!("all nodes are underutilized, nothing to do here");
            return Status::success();
        }
        if destination_nodes.is_empty() {
            info!("no node can receive the evicted pods, nothing to do here");
            return Status::success();
        }

        source_nodes.sort_by(|a, b| {
            usage_score(a, &names)
                .partial_cmp(&usage_score(b, &names))
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name().cmp(b.name()))
        });

        evict_pods_from_source_nodes(
            ctx,
            handle,
            PLUGIN_NAME,
            &mut source_nodes,
            &destination_nodes,
            &names,
            self.args.evictable_namespaces.as_ref(),
            keep_evicting,
        )
        .await
    }
}
