use super::usage::{
    classify_nodes, compute_node_thresholds, compute_node_usage, is_active_pod, is_overutilized,
    is_underutilized, resource_names, usage_score, NodeInfo, ResourceAmounts,
};
use super::{evict_pods_from_source_nodes, has_room, validate_thresholds};
use crate::api::{validate_namespaces, ExtensionPoint, Namespaces, ResourceThresholds, ValidationError};
use crate::framework::plugins::PluginArgs;
use crate::framework::registry::PluginRegistration;
use crate::framework::{BalancePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use log::info;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "LowNodeUtilization";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LowNodeUtilizationArgs {
    #[serde(default)]
    pub use_deviation_thresholds: bool,
    #[serde(default)]
    pub thresholds: ResourceThresholds,
    #[serde(default)]
    pub target_thresholds: ResourceThresholds,
    #[serde(default)]
    pub number_of_nodes: usize,
    /// Pods in these namespaces still count toward usage but are never evicted.
    #[serde(default)]
    pub evictable_namespaces: Option<Namespaces>,
}

pub fn set_defaults(_args: &mut LowNodeUtilizationArgs) {}

pub fn validate_args(args: &LowNodeUtilizationArgs) -> Result<(), ValidationError> {
    validate_thresholds(&args.thresholds, Some(&args.target_thresholds))?;
    validate_namespaces(args.evictable_namespaces.as_ref())
}

/// Moves pods off nodes above the target thresholds, as long as the nodes
/// below the low thresholds have room to take them.
pub struct LowNodeUtilization {
    args: LowNodeUtilizationArgs,
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::LowNodeUtilization(args) => args,
        other => {
            return Err(FrameworkError::arg_type(PLUGIN_NAME, "LowNodeUtilizationArgs", &other))
        }
    };
    Ok(PluginInstance::new(PLUGIN_NAME).with_balance(Arc::new(LowNodeUtilization { args })))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::LowNodeUtilization(LowNodeUtilizationArgs::default()),
        decode: |raw| Ok(PluginArgs::LowNodeUtilization(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::LowNodeUtilization(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::LowNodeUtilization(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Balance],
    }
}

impl Plugin for LowNodeUtilization {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

fn keep_evicting(node: &NodeInfo, available: &ResourceAmounts) -> bool {
    is_overutilized(node) && has_room(available)
}

#[async_trait]
impl BalancePlugin for LowNodeUtilization {
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

        info!(
            "{}: {} underutilized nodes, {} overutilized nodes",
            PLUGIN_NAME,
            low_nodes.len(),
            source_nodes.len()
        );
        if low_nodes.is_empty() {
            info!("no node is underutilized, nothing to do here, you might tune your thresholds further");
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
        if low_nodes.len() == nodes.len() {
            info!("all nodes are underutilized, nothing to do here");
            return Status::success();
        }
        if source_nodes.is_empty() {
            info!("all nodes are under target utilization, nothing to do here");
            return Status::success();
        }

        source_nodes.sort_by(|a, b| {
            usage_score(b, &names)
                .partial_cmp(&usage_score(a, &names))
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.name().cmp(b.name()))
        });

        evict_pods_from_source_nodes(
            ctx,
            handle,
            PLUGIN_NAME,
            &mut source_nodes,
            &low_nodes,
            &names,
            self.args.evictable_namespaces.as_ref(),
            keep_evicting,
        )
        .await
    }
}
