use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerStatus, EmptyDirVolumeSource, Node, NodeAffinity, NodeCondition,
    NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, NodeSpec, NodeStatus,
    PersistentVolumeClaimVolumeSource, Pod, PodAffinityTerm, PodAntiAffinity, PodSpec, PodStatus,
    PreferredSchedulingTerm, ResourceRequirements, Taint, Toleration, Volume,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference, Time};
use std::collections::BTreeMap;

fn time(rfc3339: &str) -> Time {
    serde_json::from_value(serde_json::Value::String(rfc3339.to_string())).unwrap()
}

pub struct PodBuilder {
    pod: Pod,
}

#[allow(unused)]
pub fn pod(namespace: &str, name: &str) -> PodBuilder {
    PodBuilder {
        pod: Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(format!("{}-{}", namespace, name)),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    image: Some("nginx:latest".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        },
    }
}

#[allow(unused)]
impl PodBuilder {
    fn spec(&mut self) -> &mut PodSpec {
        self.pod.spec.get_or_insert_with(Default::default)
    }

    fn status(&mut self) -> &mut PodStatus {
        self.pod.status.get_or_insert_with(Default::default)
    }

    pub fn on_node(mut self, node: &str) -> Self {
        self.spec().node_name = Some(node.to_string());
        self
    }

    /// Sets a request on the first container.
    pub fn with_request(mut self, resource: &str, quantity: &str) -> Self {
        let container = &mut self.spec().containers[0];
        container
            .resources
            .get_or_insert_with(ResourceRequirements::default)
            .requests
            .get_or_insert_with(BTreeMap::new)
            .insert(resource.to_string(), Quantity(quantity.to_string()));
        self
    }

    pub fn with_cpu_request(self, quantity: &str) -> Self {
        self.with_request("cpu", quantity)
    }

    pub fn with_memory_request(self, quantity: &str) -> Self {
        self.with_request("memory", quantity)
    }

    /// Adds another container with the given requests.
    pub fn with_container_requests(mut self, cpu: &str, memory: &str) -> Self {
        let spec = self.spec();
        let name = format!("c{}", spec.containers.len());
        spec.containers.push(Container {
            name,
            image: Some("busybox:latest".to_string()),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity(cpu.to_string())),
                    ("memory".to_string(), Quantity(memory.to_string())),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        });
        self
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.spec().containers[0].image = Some(image.to_string());
        self
    }

    pub fn owned_by(mut self, kind: &str, name: &str) -> Self {
        self.pod.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("{}-uid", name),
            controller: Some(true),
            ..Default::default()
        }]);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.pod
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.pod
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.spec().priority = Some(priority);
        self
    }

    pub fn with_priority_class(mut self, name: &str) -> Self {
        self.spec().priority_class_name = Some(name.to_string());
        self
    }

    pub fn created_at(mut self, rfc3339: &str) -> Self {
        self.pod.metadata.creation_timestamp = Some(time(rfc3339));
        self
    }

    pub fn with_phase(mut self, phase: &str) -> Self {
        self.status().phase = Some(phase.to_string());
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.status().reason = Some(reason.to_string());
        self
    }

    pub fn with_restarts(mut self, restarts: i32) -> Self {
        self.status().container_statuses = Some(vec![ContainerStatus {
            name: "main".to_string(),
            restart_count: restarts,
            ..Default::default()
        }]);
        self
    }

    pub fn with_toleration(mut self, key: &str, value: &str, effect: &str) -> Self {
        self.spec()
            .tolerations
            .get_or_insert_with(Vec::new)
            .push(Toleration {
                key: Some(key.to_string()),
                operator: Some("Equal".to_string()),
                value: Some(value.to_string()),
                effect: Some(effect.to_string()),
                ..Default::default()
            });
        self
    }

    pub fn with_node_selector(mut self, key: &str, value: &str) -> Self {
        self.spec()
            .node_selector
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    fn node_affinity(&mut self) -> &mut NodeAffinity {
        self.spec()
            .affinity
            .get_or_insert_with(Affinity::default)
            .node_affinity
            .get_or_insert_with(NodeAffinity::default)
    }

    /// Requires `key` to be one of `values` on the node.
    pub fn with_node_affinity(mut self, key: &str, values: &[&str]) -> Self {
        self.node_affinity()
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(NodeSelector::default)
            .node_selector_terms
            .push(NodeSelectorTerm {
                match_expressions: Some(vec![NodeSelectorRequirement {
                    key: key.to_string(),
                    operator: "In".to_string(),
                    values: Some(values.iter().map(|v| v.to_string()).collect()),
                }]),
                match_fields: None,
            });
        self
    }

    pub fn with_preferred_node_affinity(mut self, weight: i32, key: &str, value: &str) -> Self {
        self.node_affinity()
            .preferred_during_scheduling_ignored_during_execution
            .get_or_insert_with(Vec::new)
            .push(PreferredSchedulingTerm {
                weight,
                preference: NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: key.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![value.to_string()]),
                    }]),
                    match_fields: None,
                },
            });
        self
    }

    /// Refuses to share a `topology_key` domain with pods labelled `key=value`.
    pub fn with_anti_affinity(mut self, key: &str, value: &str, topology_key: &str) -> Self {
        self.spec()
            .affinity
            .get_or_insert_with(Affinity::default)
            .pod_anti_affinity
            .get_or_insert_with(PodAntiAffinity::default)
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(Vec::new)
            .push(PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
                    ..Default::default()
                }),
                topology_key: topology_key.to_string(),
                ..Default::default()
            });
        self
    }

    pub fn with_local_storage(mut self) -> Self {
        self.spec().volumes.get_or_insert_with(Vec::new).push(Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        });
        self
    }

    pub fn with_pvc(mut self, claim: &str) -> Self {
        self.spec().volumes.get_or_insert_with(Vec::new).push(Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        self
    }

    pub fn terminating(mut self) -> Self {
        self.pod.metadata.deletion_timestamp = Some(time("2024-01-01T00:00:00Z"));
        self
    }

    pub fn build(self) -> Pod {
        self.pod
    }
}

pub struct NodeBuilder {
    node: Node,
}

#[allow(unused)]
pub fn node(name: &str) -> NodeBuilder {
    NodeBuilder {
        node: Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    "kubernetes.io/hostname".to_string(),
                    name.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        },
    }
}

#[allow(unused)]
impl NodeBuilder {
    pub fn with_allocatable(mut self, cpu: &str, memory: &str, pods: &str) -> Self {
        let status = self.node.status.get_or_insert_with(Default::default);
        status.allocatable = Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
            ("pods".to_string(), Quantity(pods.to_string())),
        ]));
        self
    }

    pub fn not_ready(mut self) -> Self {
        let status = self.node.status.get_or_insert_with(Default::default);
        status.conditions = Some(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "False".to_string(),
            ..Default::default()
        }]);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.node
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn unschedulable(mut self) -> Self {
        self.node.spec.get_or_insert_with(Default::default).unschedulable = Some(true);
        self
    }

    pub fn with_taint(mut self, key: &str, value: &str, effect: &str) -> Self {
        self.node
            .spec
            .get_or_insert_with(Default::default)
            .taints
            .get_or_insert_with(Vec::new)
            .push(Taint {
                key: key.to_string(),
                value: Some(value.to_string()),
                effect: effect.to_string(),
                ..Default::default()
            });
        self
    }

    pub fn build(self) -> Node {
        self.node
    }
}

#[allow(unused)]
pub fn pdb(namespace: &str, name: &str, key: &str, value: &str) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}
