use crate::api::{validate_label_selector, validate_namespaces, ExtensionPoint, Namespaces, ValidationError};
use crate::framework::plugins::{
    evict_pods, labels_match, namespace_allowed, pods_on_nodes, selector_or_everything, PluginArgs,
};
use crate::framework::registry::PluginRegistration;
use crate::framework::{DeschedulePlugin, FrameworkError, Handle, Plugin, PluginInstance, Status};
use crate::helpers::labels::Selector;
use crate::helpers::pod_helpers::container_restarts;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const PLUGIN_NAME: &str = "RemovePodsHavingTooManyRestarts";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemovePodsHavingTooManyRestartsArgs {
    #[serde(default)]
    pub namespaces: Option<Namespaces>,
    #[serde(default)]
    pub label_selector: Option<LabelSelector>,
    #[serde(default)]
    pub pod_restart_threshold: i32,
    #[serde(default)]
    pub including_init_containers: bool,
}

pub fn set_defaults(_args: &mut RemovePodsHavingTooManyRestartsArgs) {}

pub fn validate_args(args: &RemovePodsHavingTooManyRestartsArgs) -> Result<(), ValidationError> {
    validate_namespaces(args.namespaces.as_ref())?;
    validate_label_selector(args.label_selector.as_ref())?;
    if args.pod_restart_threshold < 1 {
        return Err(ValidationError::Invalid(
            "invalid PodsHavingTooManyRestarts threshold".to_string(),
        ));
    }
    Ok(())
}

pub struct RemovePodsHavingTooManyRestarts {
    args: RemovePodsHavingTooManyRestartsArgs,
    selector: Selector,
}

pub fn new(args: PluginArgs, _handle: &dyn Handle) -> Result<PluginInstance, FrameworkError> {
    let args = match args {
        PluginArgs::RemovePodsHavingTooManyRestarts(args) => args,
        other => {
            return Err(FrameworkError::arg_type(
                PLUGIN_NAME,
                "RemovePodsHavingTooManyRestartsArgs",
                &other,
            ))
        }
    };
    let selector = selector_or_everything(args.label_selector.as_ref());
    Ok(PluginInstance::new(PLUGIN_NAME)
        .with_deschedule(Arc::new(RemovePodsHavingTooManyRestarts { args, selector })))
}

pub fn registration() -> PluginRegistration {
    PluginRegistration {
        name: PLUGIN_NAME.to_string(),
        factory: new,
        new_args: || PluginArgs::RemovePodsHavingTooManyRestarts(Default::default()),
        decode: |raw| Ok(PluginArgs::RemovePodsHavingTooManyRestarts(serde_yaml::from_value(raw)?)),
        validate: |args| match args {
            PluginArgs::RemovePodsHavingTooManyRestarts(args) => validate_args(args),
            other => Err(ValidationError::Invalid(format!(
                "{} got {} args",
                PLUGIN_NAME,
                other.kind()
            ))),
        },
        set_defaults: |args| {
            if let PluginArgs::RemovePodsHavingTooManyRestarts(args) = args {
                set_defaults(args)
            }
        },
        extension_points: vec![ExtensionPoint::Deschedule],
    }
}

impl Plugin for RemovePodsHavingTooManyRestarts {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }
}

#[async_trait]
impl DeschedulePlugin for RemovePodsHavingTooManyRestarts {
    async fn deschedule(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status {
        let evictor = handle.evictor();
        let threshold = self.args.pod_restart_threshold;
        let pods = pods_on_nodes(handle, nodes, &|pod: &Pod| {
            container_restarts(pod, self.args.including_init_containers) >= threshold
                && evictor.filter(pod)
                && namespace_allowed(self.args.namespaces.as_ref(), pod)
                && labels_match(&self.selector, pod)
        });
        info!("{}: {} pods restarted at least {} times", PLUGIN_NAME, pods.len(), threshold);
        evict_pods(ctx, handle, PLUGIN_NAME, &pods, "pod restarted too many times").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::plugins::defaultevictor::DefaultEvictorArgs;
    use crate::framework::profile::test_handle;
    use crate::test_helpers::fake_client::FakeClusterClient;
    use crate::test_helpers::objects::{node, pod};

    fn restarting(ns: &str, name: &str, restarts: i32) -> Pod {
        pod(ns, name)
            .owned_by("ReplicaSet", name)
            .on_node("node1")
            .with_restarts(restarts)
            .build()
    }

    #[tokio::test]
    async fn should_evict_pods_at_or_above_threshold() {
        let nodes = vec![node("node1").build()];
        let pods = vec![
            restarting("default", "flaky", 5),
            restarting("default", "steady", 1),
            restarting("other", "flaky", 10),
        ];
        let client = Arc::new(FakeClusterClient::new(nodes.clone(), pods.clone()));
        let handle = test_handle(client.clone(), nodes.clone(), pods, DefaultEvictorArgs::default(), None);
        let plugin = RemovePodsHavingTooManyRestarts {
            args: RemovePodsHavingTooManyRestartsArgs {
                namespaces: Some(Namespaces {
                    include: vec!["default".to_string()],
                    exclude: vec![],
                }),
                pod_restart_threshold: 5,
                ..Default::default()
            },
            selector: Selector::everything(),
        };

        let status = plugin.deschedule(&CancellationToken::new(), &handle, &nodes).await;
        assert!(status.is_success());
        assert_eq!(client.evicted(), vec!["default/flaky"]);
    }

    #[test]
    fn should_require_positive_threshold() {
        assert!(validate_args(&RemovePodsHavingTooManyRestartsArgs::default()).is_err());
        let args = RemovePodsHavingTooManyRestartsArgs {
            pod_restart_threshold: 1,
            ..Default::default()
        };
        assert!(validate_args(&args).is_ok());
    }

    #[tokio::test]
    async fn should_keep_pods_just_below_threshold() {
        let nodes = vec![node("node1").build()];
        let pods = vec![
            restarting("default", "below", 4),
            restarting("default", "at", 5),
            restarting("default", "above", 6),
        ];
        let client = Arc::new(FakeClusterClient::new(nodes.clone(), pods.clone()));
        let handle = test_handle(client.clone(), nodes.clone(), pods, DefaultEvictorArgs::default(), None);
        let plugin = RemovePodsHavingTooManyRestarts {
            args: RemovePodsHavingTooManyRestartsArgs {
                pod_restart_threshold: 5,
                ..Default::default()
            },
            selector: Selector::everything(),
        };

        let status = plugin.deschedule(&CancellationToken::new(), &handle, &nodes).await;
        assert!(status.is_success());
        assert_eq!(client.evicted(), vec!["default/above", "default/at"]);
    }
}
