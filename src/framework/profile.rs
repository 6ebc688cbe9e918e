use crate::api::{DeschedulerPolicy, ExtensionPoint, PluginSet, Plugins, Profile, ValidationError};
use crate::cache::{ClusterSnapshot, PodLister};
use crate::evictions::{EvictOptions, EvictionError, EvictionOutcome, PodEvictor};
use crate::framework::plugins::defaultevictor;
use crate::framework::plugins::PluginArgs;
use crate::framework::registry::{PluginFactory, Registry};
use crate::framework::{
    BalancePlugin, DeschedulePlugin, Evictor, FilterPlugin, Handle, PluginInstance,
    PreEvictionFilterPlugin, Status,
};
use crate::helpers::pod_helpers::pod_name;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use log::{debug, error, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Order in which a profile's plugins are instantiated.
const EXTENSION_POINTS: [ExtensionPoint; 4] = [
    ExtensionPoint::Filter,
    ExtensionPoint::PreEvictionFilter,
    ExtensionPoint::Deschedule,
    ExtensionPoint::Balance,
];

/// A plugin whose args went through decode, defaults and validation.
#[derive(Debug, Clone)]
pub struct ResolvedPlugin {
    pub args: PluginArgs,
    pub factory: PluginFactory,
}

#[derive(Debug, Clone)]
pub struct ResolvedProfile {
    pub name: String,
    pub plugins: Plugins,
    pub resolved: BTreeMap<String, ResolvedPlugin>,
}

impl ResolvedProfile {
    /// Enabled plugin names in instantiation order, each once.
    pub fn plugin_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = vec![];
        for point in EXTENSION_POINTS {
            for name in self.plugins.enabled(point) {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
    }
}

fn resolve_profile(profile: &Profile, registry: &Registry) -> Result<ResolvedProfile, ValidationError> {
    for config in &profile.plugin_config {
        if registry.get(&config.name).is_none() {
            return Err(ValidationError::UnknownPlugin(config.name.clone()));
        }
    }

    let mut plugins = profile.plugins.clone();
    if plugins.filter.enabled.is_empty() && plugins.pre_eviction_filter.enabled.is_empty() {
        debug!("profile {} enables no filter, using {}", profile.name, defaultevictor::PLUGIN_NAME);
        plugins.filter = PluginSet {
            enabled: vec![defaultevictor::PLUGIN_NAME.to_string()],
        };
        plugins.pre_eviction_filter = plugins.filter.clone();
    }

    let mut resolved = BTreeMap::new();
    for point in EXTENSION_POINTS {
        for name in plugins.enabled(point) {
            let registration = registry
                .get(name)
                .ok_or_else(|| ValidationError::UnknownPlugin(name.clone()))?;
            if !registration.supports(point) {
                return Err(ValidationError::UnsupportedExtensionPoint {
                    plugin: name.clone(),
                    point: point.to_string(),
                });
            }
            if resolved.contains_key(name) {
                continue;
            }
            let raw = profile
                .plugin_config
                .iter()
                .find(|c| &c.name == name)
                .map(|c| &c.args);
            let args = registration.resolve_args(raw)?;
            resolved.insert(
                name.clone(),
                ResolvedPlugin {
                    args,
                    factory: registration.factory,
                },
            );
        }
    }

    Ok(ResolvedProfile {
        name: profile.name.clone(),
        plugins,
        resolved,
    })
}

/// Checks every profile against the registry and resolves the plugin args.
/// Runs once, before the first cycle; the first violation is returned.
pub fn resolve_policy(
    policy: &DeschedulerPolicy,
    registry: &Registry,
) -> Result<Vec<ResolvedProfile>, ValidationError> {
    policy
        .profiles
        .iter()
        .map(|profile| resolve_profile(profile, registry))
        .collect()
}

/// The evictor of one profile: its filter plugins in front of the cycle's
/// shared PodEvictor.
#[derive(Clone)]
pub struct ProfileEvictor {
    filters: Vec<Arc<dyn FilterPlugin>>,
    pre_eviction_filters: Vec<Arc<dyn PreEvictionFilterPlugin>>,
    pod_evictor: Arc<PodEvictor>,
}

impl ProfileEvictor {
    pub fn new(
        filters: Vec<Arc<dyn FilterPlugin>>,
        pre_eviction_filters: Vec<Arc<dyn PreEvictionFilterPlugin>>,
        pod_evictor: Arc<PodEvictor>,
    ) -> Self {
        Self {
            filters,
            pre_eviction_filters,
            pod_evictor,
        }
    }

    fn check_pre_eviction(&self, pod: &Pod) -> Result<(), String> {
        for f in &self.pre_eviction_filters {
            f.pre_eviction_filter(pod)
                .map_err(|reason| format!("{}: {}", f.name(), reason))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Evictor for ProfileEvictor {
    fn filter(&self, pod: &Pod) -> bool {
        for f in &self.filters {
            if let Err(reason) = f.filter(pod) {
                debug!("pod {} rejected by {}: {}", pod_name(pod), f.name(), reason);
                return false;
            }
        }
        true
    }

    async fn evict(
        &self,
        ctx: &CancellationToken,
        pod: &Pod,
        opts: EvictOptions,
    ) -> Result<EvictionOutcome, EvictionError> {
        if let Err(reason) = self.check_pre_eviction(pod) {
            info!("not evicting pod {}: {}", pod_name(pod), reason);
            return Ok(EvictionOutcome::Skipped(reason));
        }
        self.pod_evictor.evict_pod(ctx, pod, &opts).await
    }

    fn node_limit_exceeded(&self, node: &str) -> bool {
        self.pod_evictor.node_limit_exceeded(node)
    }

    fn total_limit_exceeded(&self) -> bool {
        self.pod_evictor.total_limit_exceeded()
    }

    fn total_evicted(&self) -> usize {
        self.pod_evictor.total_evicted()
    }
}

pub struct FrameworkHandle {
    snapshot: Arc<ClusterSnapshot>,
    evictor: ProfileEvictor,
}

impl FrameworkHandle {
    pub fn new(snapshot: Arc<ClusterSnapshot>, evictor: ProfileEvictor) -> Self {
        Self { snapshot, evictor }
    }
}

impl Handle for FrameworkHandle {
    fn pod_lister(&self) -> &dyn PodLister {
        self.snapshot.as_ref()
    }

    fn evictor(&self) -> &dyn Evictor {
        &self.evictor
    }

    fn snapshot(&self) -> Arc<ClusterSnapshot> {
        self.snapshot.clone()
    }
}

/// Outcome of one plugin call, or of a plugin that could not be set up.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginStatus {
    pub profile: String,
    pub plugin: String,
    pub extension_point: ExtensionPoint,
    pub status: Status,
}

/// A profile's instantiated plugins for one cycle.
pub struct FrameworkProfile {
    name: String,
    handle: FrameworkHandle,
    deschedule: Vec<(String, Arc<dyn DeschedulePlugin>)>,
    balance: Vec<(String, Arc<dyn BalancePlugin>)>,
    setup_failures: Vec<PluginStatus>,
}

impl FrameworkProfile {
    /// Instantiates the profile's plugins. Factories see a handle whose evictor
    /// has no filters yet; the returned profile's handle has all of them. A
    /// plugin that fails to build is recorded and left out.
    pub fn new(
        profile: &ResolvedProfile,
        snapshot: Arc<ClusterSnapshot>,
        pod_evictor: Arc<PodEvictor>,
    ) -> Self {
        let bootstrap = FrameworkHandle::new(
            snapshot.clone(),
            ProfileEvictor::new(vec![], vec![], pod_evictor.clone()),
        );

        let mut setup_failures = vec![];
        let mut instances: BTreeMap<&str, PluginInstance> = BTreeMap::new();
        for name in profile.plugin_names() {
            let Some(plugin) = profile.resolved.get(name) else {
                continue;
            };
            match (plugin.factory)(plugin.args.clone(), &bootstrap) {
                Ok(instance) => {
                    instances.insert(name, instance);
                }
                Err(e) => {
                    error!("profile {}: failed to build plugin {}: {}", profile.name, name, e);
                    for point in EXTENSION_POINTS {
                        if profile.plugins.enabled(point).iter().any(|n| n == name) {
                            setup_failures.push(PluginStatus {
                                profile: profile.name.clone(),
                                plugin: name.to_string(),
                                extension_point: point,
                                status: Status::error(e.to_string()),
                            });
                        }
                    }
                }
            }
        }

        let collect = |point: ExtensionPoint| -> Vec<(String, PluginInstance)> {
            profile
                .plugins
                .enabled(point)
                .iter()
                .filter_map(|name| instances.get(name.as_str()).map(|i| (name.clone(), i.clone())))
                .collect()
        };
        let filters = collect(ExtensionPoint::Filter)
            .into_iter()
            .filter_map(|(_, i)| i.filter)
            .collect();
        let pre_eviction_filters = collect(ExtensionPoint::PreEvictionFilter)
            .into_iter()
            .filter_map(|(_, i)| i.pre_eviction_filter)
            .collect();
        let deschedule = collect(ExtensionPoint::Deschedule)
            .into_iter()
            .filter_map(|(n, i)| i.deschedule.map(|p| (n, p)))
            .collect();
        let balance = collect(ExtensionPoint::Balance)
            .into_iter()
            .filter_map(|(n, i)| i.balance.map(|p| (n, p)))
            .collect();

        Self {
            name: profile.name.clone(),
            handle: FrameworkHandle::new(
                snapshot,
                ProfileEvictor::new(filters, pre_eviction_filters, pod_evictor),
            ),
            deschedule,
            balance,
            setup_failures,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn setup_failures(&self) -> &[PluginStatus] {
        &self.setup_failures
    }

    fn status(&self, plugin: &str, point: ExtensionPoint, status: Status) -> PluginStatus {
        if !status.is_success() {
            error!(
                "profile {}: {} plugin {} failed: {}",
                self.name, point, plugin, status.message
            );
        }
        PluginStatus {
            profile: self.name.clone(),
            plugin: plugin.to_string(),
            extension_point: point,
            status,
        }
    }

    pub async fn run_deschedule_plugins(&self, ctx: &CancellationToken, nodes: &[Node]) -> Vec<PluginStatus> {
        let mut statuses = vec![];
        for (name, plugin) in &self.deschedule {
            if ctx.is_cancelled() {
                break;
            }
            let before = self.handle.evictor.total_evicted();
            let status = plugin.deschedule(ctx, &self.handle, nodes).await;
            info!(
                "profile {}: {} evicted {} pods",
                self.name,
                name,
                self.handle.evictor.total_evicted() - before
            );
            statuses.push(self.status(name, ExtensionPoint::Deschedule, status));
        }
        statuses
    }

    pub async fn run_balance_plugins(&self, ctx: &CancellationToken, nodes: &[Node]) -> Vec<PluginStatus> {
        let mut statuses = vec![];
        for (name, plugin) in &self.balance {
            if ctx.is_cancelled() {
                break;
            }
            let before = self.handle.evictor.total_evicted();
            let status = plugin.balance(ctx, &self.handle, nodes).await;
            info!(
                "profile {}: {} evicted {} pods",
                self.name,
                name,
                self.handle.evictor.total_evicted() - before
            );
            statuses.push(self.status(name, ExtensionPoint::Balance, status));
        }
        statuses
    }
}

/// A handle over an in-memory cluster with a DefaultEvictor as its only
/// filter.
#[cfg(test)]
pub(crate) fn test_handle(
    client: Arc<crate::test_helpers::fake_client::FakeClusterClient>,
    nodes: Vec<Node>,
    pods: Vec<Pod>,
    evictor_args: defaultevictor::DefaultEvictorArgs,
    max_pods_to_evict_per_node: Option<usize>,
) -> FrameworkHandle {
    use crate::evictions::EvictionLimits;

    let snapshot = Arc::new(ClusterSnapshot::new(nodes, pods));
    let pod_evictor = Arc::new(PodEvictor::new(
        client.clone(),
        true,
        EvictionLimits {
            max_pods_to_evict_per_node,
            ..Default::default()
        },
    ));
    let bootstrap = FrameworkHandle::new(
        snapshot.clone(),
        ProfileEvictor::new(vec![], vec![], pod_evictor.clone()),
    );
    let instance = defaultevictor::new(PluginArgs::DefaultEvictor(evictor_args), &bootstrap).unwrap();
    FrameworkHandle::new(
        snapshot,
        ProfileEvictor::new(
            instance.filter.into_iter().collect(),
            instance.pre_eviction_filter.into_iter().collect(),
            pod_evictor,
        ),
    )
}
