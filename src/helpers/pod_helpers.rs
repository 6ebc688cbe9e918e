use crate::helpers::labels::EMPTY_LABELS;
use crate::helpers::quantity::{resource_value, QuantityError, RESOURCE_CPU, RESOURCE_MEMORY, RESOURCE_PODS};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Pod, Taint, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use strum_macros::{Display, EnumString};

/// Requested quantities keyed by resource name. cpu is in millicores.
pub type ResourceList = BTreeMap<String, i64>;

pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
pub const CONFIG_SOURCE_ANNOTATION: &str = "kubernetes.io/config.source";
pub const EVICT_POD_ANNOTATION: &str = "descheduler.alpha.kubernetes.io/evict";

pub const SYSTEM_CRITICAL_PRIORITY: i32 = 2_000_000_000;
pub const SYSTEM_CLUSTER_CRITICAL: &str = "system-cluster-critical";
pub const SYSTEM_NODE_CRITICAL: &str = "system-node-critical";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString)]
pub enum QosClass {
    BestEffort,
    Burstable,
    Guaranteed,
}

pub fn pod_name(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

pub fn pod_labels(pod: &Pod) -> &BTreeMap<String, String> {
    pod.metadata.labels.as_ref().unwrap_or(&EMPTY_LABELS)
}

pub fn pod_namespace(pod: &Pod) -> &str {
    pod.metadata.namespace.as_deref().unwrap_or("default")
}

pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref())
}

pub fn pod_priority(pod: &Pod) -> i32 {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.priority)
        .unwrap_or(0)
}

pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

fn container_requests(
    c: &Container,
    resource_names: &[String],
) -> Result<ResourceList, QuantityError> {
    let mut out = ResourceList::new();
    let requests = c.resources.as_ref().and_then(|r| r.requests.as_ref());
    if let Some(requests) = requests {
        for name in resource_names {
            if let Some(q) = requests.get(name) {
                out.insert(name.clone(), resource_value(name, q)?);
            }
        }
    }
    Ok(out)
}

/// Effective requests of a pod for the given resources: the sum over regular
/// containers, raised to the largest init container where that is bigger, plus
/// the pod overhead. `pods` always counts as one.
pub fn pod_requests(pod: &Pod, resource_names: &[String]) -> Result<ResourceList, QuantityError> {
    let mut total: ResourceList = resource_names.iter().map(|r| (r.clone(), 0)).collect();
    let spec = match pod.spec.as_ref() {
        None => return Ok(total),
        Some(spec) => spec,
    };

    for c in &spec.containers {
        for (name, value) in container_requests(c, resource_names)? {
            *total.entry(name).or_insert(0) += value;
        }
    }

    if let Some(init_containers) = &spec.init_containers {
        for c in init_containers {
            for (name, value) in container_requests(c, resource_names)? {
                let entry = total.entry(name).or_insert(0);
                *entry = (*entry).max(value);
            }
        }
    }

    if let Some(overhead) = &spec.overhead {
        for name in resource_names {
            if let Some(q) = overhead.get(name) {
                *total.entry(name.clone()).or_insert(0) += resource_value(name, q)?;
            }
        }
    }

    if resource_names.iter().any(|r| r == RESOURCE_PODS) {
        total.insert(RESOURCE_PODS.to_string(), 1);
    }

    Ok(total)
}

pub fn pod_request(pod: &Pod, resource: &str) -> i64 {
    pod_requests(pod, &[resource.to_string()])
        .ok()
        .and_then(|r| r.get(resource).copied())
        .unwrap_or(0)
}

pub fn owner_refs(pod: &Pod) -> &[OwnerReference] {
    pod.metadata.owner_references.as_deref().unwrap_or_default()
}

pub fn is_daemonset_pod(pod: &Pod) -> bool {
    owner_refs(pod).iter().any(|o| o.kind == "DaemonSet")
}

pub fn is_mirror_pod(pod: &Pod) -> bool {
    has_annotation(pod, MIRROR_POD_ANNOTATION)
}

pub fn is_static_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(CONFIG_SOURCE_ANNOTATION))
        .map(|source| source != "api")
        .unwrap_or(false)
}

pub fn has_evict_annotation(pod: &Pod) -> bool {
    has_annotation(pod, EVICT_POD_ANNOTATION)
}

fn has_annotation(pod: &Pod, key: &str) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .map(|a| a.contains_key(key))
        .unwrap_or(false)
}

pub fn is_pod_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn is_critical_pod(pod: &Pod) -> bool {
    if is_static_pod(pod) || is_mirror_pod(pod) {
        return true;
    }
    let class = pod.spec.as_ref().and_then(|s| s.priority_class_name.as_deref());
    if matches!(class, Some(SYSTEM_CLUSTER_CRITICAL) | Some(SYSTEM_NODE_CRITICAL)) {
        return true;
    }
    pod_priority(pod) >= SYSTEM_CRITICAL_PRIORITY
}

pub fn has_local_storage(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .any(|v| v.empty_dir.is_some() || v.host_path.is_some())
        })
        .unwrap_or(false)
}

pub fn has_pvc(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| volumes.iter().any(|v| v.persistent_volume_claim.is_some()))
        .unwrap_or(false)
}

pub fn qos_class(pod: &Pod) -> QosClass {
    if let Some(class) = pod
        .status
        .as_ref()
        .and_then(|s| s.qos_class.as_deref())
        .and_then(|c| c.parse::<QosClass>().ok())
    {
        return class;
    }

    let spec = match pod.spec.as_ref() {
        None => return QosClass::BestEffort,
        Some(spec) => spec,
    };
    let containers = spec
        .containers
        .iter()
        .chain(spec.init_containers.iter().flatten());

    let mut any_set = false;
    let mut guaranteed = true;
    for c in containers {
        let requests = c.resources.as_ref().and_then(|r| r.requests.clone()).unwrap_or_default();
        let limits = c.resources.as_ref().and_then(|r| r.limits.clone()).unwrap_or_default();
        if !requests.is_empty() || !limits.is_empty() {
            any_set = true;
        }
        for name in [RESOURCE_CPU, RESOURCE_MEMORY] {
            let limit = limits.get(name).and_then(|q| resource_value(name, q).ok());
            // requests default to limits when omitted
            let request = requests
                .get(name)
                .and_then(|q| resource_value(name, q).ok())
                .or(limit);
            if limit.is_none() || request != limit {
                guaranteed = false;
            }
        }
    }

    match (any_set, guaranteed) {
        (false, _) => QosClass::BestEffort,
        (true, true) => QosClass::Guaranteed,
        (true, false) => QosClass::Burstable,
    }
}

/// Orders pods so the cheapest to lose come first: lower priority, then lower
/// QoS class.
pub fn sort_pods_by_priority_low_to_high(pods: &mut [Arc<Pod>]) {
    pods.sort_by(|a, b| {
        let by_priority = pod_priority(a).cmp(&pod_priority(b));
        if by_priority != Ordering::Equal {
            return by_priority;
        }
        qos_class(a).cmp(&qos_class(b))
    });
}

pub fn container_restarts(pod: &Pod, including_init_containers: bool) -> i32 {
    let status = match pod.status.as_ref() {
        None => return 0,
        Some(status) => status,
    };
    let mut restarts: i32 = status
        .container_statuses
        .iter()
        .flatten()
        .map(|cs| cs.restart_count)
        .sum();
    if including_init_containers {
        restarts += status
            .init_container_statuses
            .iter()
            .flatten()
            .map(|cs| cs.restart_count)
            .sum::<i32>();
    }
    restarts
}

/// Decodes a kubernetes timestamp through its RFC3339 wire form.
pub fn time_to_utc(t: &Time) -> Option<DateTime<Utc>> {
    let raw = serde_json::to_value(t).ok()?;
    let raw = raw.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn pod_creation_time(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().and_then(time_to_utc)
}

pub fn pod_tolerations(pod: &Pod) -> &[Toleration] {
    pod.spec
        .as_ref()
        .and_then(|s| s.tolerations.as_deref())
        .unwrap_or_default()
}

pub fn toleration_tolerates_taint(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = toleration.effect.as_deref() {
        if !effect.is_empty() && effect != taint.effect {
            return false;
        }
    }

    let key = toleration.key.as_deref().unwrap_or_default();
    let operator = toleration.operator.as_deref().unwrap_or("Equal");

    if key.is_empty() {
        // an empty key with Exists tolerates everything
        return operator == "Exists";
    }
    if key != taint.key {
        return false;
    }

    match operator {
        "Exists" => true,
        "Equal" | "" => toleration.value.as_deref().unwrap_or_default() == taint.value.as_deref().unwrap_or_default(),
        _ => false,
    }
}

pub fn tolerates_taint(tolerations: &[Toleration], taint: &Taint) -> bool {
    tolerations
        .iter()
        .any(|t| toleration_tolerates_taint(t, taint))
}
