mod highnodeutilization;
mod lownodeutilization;
pub mod usage;

pub use highnodeutilization::{HighNodeUtilization, HighNodeUtilizationArgs};
pub use lownodeutilization::{LowNodeUtilization, LowNodeUtilizationArgs};

use crate::api::{
    validate_low_not_above_high, validate_threshold_range, Namespaces, ResourceThresholds,
    ValidationError,
};
use crate::evictions::EvictOptions;
use crate::framework::plugins::{evict_one, namespace_allowed, Step};
use crate::framework::{Handle, Status};
use crate::helpers::pod_helpers::{is_critical_pod, pod_name, pod_requests, sort_pods_by_priority_low_to_high};
use log::{debug, info};
use tokio_util::sync::CancellationToken;
use usage::{NodeInfo, ResourceAmounts};

pub use highnodeutilization::registration as highnodeutilization_registration;
pub use highnodeutilization::PLUGIN_NAME as HIGH_NODE_UTILIZATION;
pub use lownodeutilization::registration as lownodeutilization_registration;
pub use lownodeutilization::PLUGIN_NAME as LOW_NODE_UTILIZATION;

/// Checks shared by the utilization strategies: ranges, low <= high and the
/// same resources on both sides.
pub fn validate_thresholds(
    thresholds: &ResourceThresholds,
    target_thresholds: Option<&ResourceThresholds>,
) -> Result<(), ValidationError> {
    if thresholds.is_empty() {
        return Err(ValidationError::NoThresholds);
    }
    validate_threshold_range(thresholds)?;
    if let Some(target) = target_thresholds {
        validate_threshold_range(target)?;
        if thresholds.len() != target.len() || thresholds.keys().any(|k| !target.contains_key(k)) {
            return Err(ValidationError::Invalid(
                "thresholds and targetThresholds configured different resources".to_string(),
            ));
        }
        validate_low_not_above_high(thresholds, target)?;
    }
    Ok(())
}

/// Sum over destination nodes of the room left below their high threshold.
pub(crate) fn total_available(destinations: &[NodeInfo], resource_names: &[String]) -> ResourceAmounts {
    resource_names
        .iter()
        .map(|r| {
            let room: f64 = destinations
                .iter()
                .map(|d| d.thresholds.high.get(r).copied().unwrap_or(0.0) - d.usage.used(r) as f64)
                .sum();
            (r.clone(), room)
        })
        .collect()
}

pub(crate) fn has_room(available: &ResourceAmounts) -> bool {
    available.values().all(|v| *v > 0.0)
}

/// Evicts pods from `sources`, in order, while `continue_eviction` holds for
/// the node and the destinations' remaining room.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn evict_pods_from_source_nodes(
    ctx: &CancellationToken,
    handle: &dyn Handle,
    plugin: &str,
    sources: &mut [NodeInfo],
    destinations: &[NodeInfo],
    resource_names: &[String],
    evictable_namespaces: Option<&Namespaces>,
    continue_eviction: fn(&NodeInfo, &ResourceAmounts) -> bool,
) -> Status {
    let evictor = handle.evictor();
    let mut available = total_available(destinations, resource_names);
    debug!("total capacity to be moved {:?}", available);

    for source in sources.iter_mut() {
        let mut candidates: Vec<_> = source
            .usage
            .pods
            .iter()
            .filter(|p| evictor.filter(p) && namespace_allowed(evictable_namespaces, p))
            .cloned()
            .collect();
        if candidates.is_empty() {
            debug!("no removable pods on node {}, try next node", source.name());
            continue;
        }
        // non-critical pods first, each group lowest priority first
        sort_pods_by_priority_low_to_high(&mut candidates);
        candidates.sort_by_key(|p| is_critical_pod(p));

        info!(
            "evicting pods from node {} (usage {:?})",
            source.name(),
            source.usage.usage
        );
        for pod in candidates {
            if !continue_eviction(source, &available) {
                break;
            }
            let opts = EvictOptions::new(plugin).with_reason("node is overutilized");
            match evict_one(ctx, evictor, &pod, opts).await {
                Ok(Step::Evicted) => {
                    let requests = pod_requests(&pod, resource_names).unwrap_or_default();
                    source.subtract(&requests);
                    for (name, value) in &requests {
                        if let Some(room) = available.get_mut(name) {
                            *room -= *value as f64;
                        }
                    }
                    debug!("evicted pod {}, node usage now {:?}", pod_name(&pod), source.usage.usage);
                }
                Ok(Step::NextPod) => {}
                Ok(Step::NextNode) => break,
                Ok(Step::Stop) => return Status::success(),
                Err(status) => return status,
            }
            if evictor.node_limit_exceeded(source.name()) {
                break;
            }
        }
        if evictor.total_limit_exceeded() {
            break;
        }
    }
    Status::success()
}
