use crate::api::DeschedulerPolicy;
use crate::cache::ClusterSnapshot;
use crate::client::{ClientError, ClusterClient, KubeClusterClient};
use crate::errors::DeschedulerError;
use crate::evictions::{EventRecorder, EvictionLimits, LogEventRecorder, PodEvictor, DEFAULT_API_TIMEOUT};
use crate::framework::profile::{resolve_policy, FrameworkProfile, PluginStatus, ResolvedProfile};
use crate::framework::registry::Registry;
use crate::helpers::labels::Selector;
use crate::helpers::node_helpers::ready_nodes;
use crate::setup_plugins::default_registry;
use clap::{Args, Parser, Subcommand};
use futures::future::{select, Either};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "descheduler")]
#[command(about = "Kubernetes descheduler", long_about = None, arg_required_else_help = true, version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(long_about = "Evict pods according to a descheduler policy")]
    Run(RunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    #[arg(
        long,
        env = "DESCHEDULER_POLICY_CONFIG_FILE",
        long_help = "File with the descheduler policy.",
        default_value = "~/.descheduler/policy.yaml"
    )]
    pub policy_config_file: String,
    #[arg(long, env = "KUBECONFIG", long_help = "Kubeconfig to use, defaults to in-cluster config.")]
    pub kubeconfig: Option<String>,
    #[arg(
        long,
        env = "DESCHEDULER_INTERVAL_SECONDS",
        long_help = "Time between descheduling cycles. 0 runs a single cycle.",
        default_value_t = 0
    )]
    pub descheduling_interval_seconds: u64,
    #[arg(long, long_help = "Timeout of each cluster API call.", default_value_t = DEFAULT_API_TIMEOUT.as_secs())]
    pub api_timeout_seconds: u64,
    #[arg(long, long_help = "Deadline for a whole descheduling cycle.")]
    pub cycle_timeout_seconds: Option<u64>,
    #[arg(long, long_help = "Only log what would be evicted.")]
    pub dry_run: bool,
    #[arg(long, long_help = "Run one cycle and exit, whatever the interval.")]
    pub once: bool,
}

#[derive(Tabled)]
#[tabled(rename_all = "UPPERCASE")]
struct PluginStatusRow {
    profile: String,
    extension_point: String,
    plugin: String,
    status: String,
    message: String,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub total_evicted: usize,
    pub evicted_per_node: BTreeMap<String, usize>,
    pub evicted_per_namespace: BTreeMap<String, usize>,
    pub plugins: Vec<PluginStatus>,
    pub dry_run: bool,
    pub cancelled: bool,
}

impl CycleReport {
    pub fn failed_plugins(&self) -> impl Iterator<Item = &PluginStatus> {
        self.plugins.iter().filter(|p| !p.status.is_success())
    }

    pub fn table(&self) -> String {
        let rows = self.plugins.iter().map(|p| PluginStatusRow {
            profile: p.profile.clone(),
            extension_point: p.extension_point.to_string(),
            plugin: p.plugin.clone(),
            status: p.status.code.to_string(),
            message: p.status.message.clone(),
        });
        Table::new(rows).to_string()
    }
}

/// Runs the resolved profiles against the cluster, one cycle at a time.
pub struct Descheduler {
    client: Arc<dyn ClusterClient>,
    profiles: Vec<ResolvedProfile>,
    node_selector: Option<Selector>,
    limits: EvictionLimits,
    eviction_supported: bool,
    dry_run: bool,
    api_timeout: Duration,
    cycle_timeout: Option<Duration>,
    recorder: Arc<dyn EventRecorder>,
}

impl Descheduler {
    /// Resolves the policy against the registry. Any invalid profile or plugin
    /// configuration is reported here, before a cycle ever runs.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        policy: &DeschedulerPolicy,
        registry: &Registry,
    ) -> Result<Self, DeschedulerError> {
        let profiles = resolve_policy(policy, registry)?;
        let node_selector = match policy.node_selector.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(
                raw.parse::<Selector>()
                    .map_err(|e| DeschedulerError::String(format!("invalid nodeSelector: {}", e)))?,
            ),
            _ => None,
        };
        Ok(Self {
            client,
            profiles,
            node_selector,
            limits: EvictionLimits {
                max_pods_to_evict_per_node: policy.max_no_of_pods_to_evict_per_node,
                max_pods_to_evict_per_namespace: policy.max_no_of_pods_to_evict_per_namespace,
                max_pods_to_evict_total: policy.max_no_of_pods_to_evict_total,
            },
            eviction_supported: true,
            dry_run: policy.dry_run,
            api_timeout: DEFAULT_API_TIMEOUT,
            cycle_timeout: None,
            recorder: Arc::new(LogEventRecorder {}),
        })
    }

    pub fn with_eviction_support(mut self, supported: bool) -> Self {
        self.eviction_supported = supported;
        self
    }

    /// Dry-run from the command line adds to the policy's setting.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = self.dry_run || dry_run;
        self
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn with_cycle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    pub fn with_event_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Bounds a cluster call by the API timeout and the cycle's token.
    async fn call<T>(
        &self,
        ctx: &CancellationToken,
        fut: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, DeschedulerError> {
        tokio::select! {
            res = tokio::time::timeout(self.api_timeout, fut) => match res {
                Ok(res) => Ok(res?),
                Err(_) => Err(ClientError::Timeout.into()),
            },
            _ = ctx.cancelled() => Err(DeschedulerError::Cancelled(Box::new(CycleReport {
                dry_run: self.dry_run,
                cancelled: true,
                ..Default::default()
            }))),
        }
    }

    /// One descheduling cycle: snapshot the cluster, run every Deschedule
    /// plugin of every profile, then every Balance plugin.
    pub async fn run_descheduling_cycle(&self, ctx: &CancellationToken) -> Result<CycleReport, DeschedulerError> {
        let cycle = ctx.child_token();
        let _cycle_guard = cycle.clone().drop_guard();
        if let Some(deadline) = self.cycle_timeout {
            let token = cycle.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        warn!("descheduling cycle exceeded its deadline of {:?}", deadline);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        let mut report = CycleReport {
            dry_run: self.dry_run,
            ..Default::default()
        };

        let nodes = self.call(&cycle, self.client.list_nodes()).await?;
        let nodes = ready_nodes(nodes, self.node_selector.as_ref());
        if nodes.len() <= 1 {
            warn!(
                "{} ready nodes, evicting pods would only disrupt workloads, skipping this cycle",
                nodes.len()
            );
            return Ok(report);
        }

        let pods = self.call(&cycle, self.client.list_pods()).await?;
        let pdbs = self.call(&cycle, self.client.list_pod_disruption_budgets()).await?;
        let priority_classes = self.call(&cycle, self.client.list_priority_classes()).await?;
        let snapshot = Arc::new(
            ClusterSnapshot::new(nodes.clone(), pods)
                .with_pod_disruption_budgets(pdbs)
                .with_priority_classes(priority_classes),
        );
        info!(
            "descheduling {} nodes with {} pods{}",
            nodes.len(),
            snapshot.pod_count(),
            if self.dry_run { " (dry run)" } else { "" }
        );

        let pod_evictor = Arc::new(
            PodEvictor::new(self.client.clone(), self.eviction_supported, self.limits)
                .with_dry_run(self.dry_run)
                .with_api_timeout(self.api_timeout)
                .with_event_recorder(self.recorder.clone()),
        );

        let frameworks: Vec<FrameworkProfile> = self
            .profiles
            .iter()
            .map(|p| FrameworkProfile::new(p, snapshot.clone(), pod_evictor.clone()))
            .collect();
        for framework in &frameworks {
            report.plugins.extend_from_slice(framework.setup_failures());
        }

        for framework in &frameworks {
            report.plugins.extend(framework.run_deschedule_plugins(&cycle, &nodes).await);
        }
        for framework in &frameworks {
            report.plugins.extend(framework.run_balance_plugins(&cycle, &nodes).await);
        }

        let counters = pod_evictor.counters();
        report.total_evicted = counters.total;
        report.evicted_per_node = counters.per_node.into_iter().collect();
        report.evicted_per_namespace = counters.per_namespace.into_iter().collect();

        if cycle.is_cancelled() {
            report.cancelled = true;
            return Err(DeschedulerError::Cancelled(Box::new(report)));
        }
        info!("descheduling cycle evicted {} pods", report.total_evicted);
        Ok(report)
    }

    /// Runs cycles until `ctx` is cancelled, or once when there is no
    /// interval. Errors of a single cycle end a one-shot run; with an
    /// interval they are logged and the next cycle runs as usual.
    pub async fn run(&self, ctx: &CancellationToken, interval: Option<Duration>) -> Result<(), DeschedulerError> {
        loop {
            match self.run_descheduling_cycle(ctx).await {
                Ok(report) => {
                    if !report.plugins.is_empty() {
                        info!("descheduling cycle finished\n{}", report.table());
                    }
                }
                Err(DeschedulerError::Cancelled(report)) if ctx.is_cancelled() => {
                    info!(
                        "descheduling stopped after evicting {} pods\n{}",
                        report.total_evicted,
                        report.table()
                    );
                    return Ok(());
                }
                Err(DeschedulerError::Cancelled(report)) => {
                    warn!(
                        "descheduling cycle cut short after evicting {} pods",
                        report.total_evicted
                    );
                }
                Err(e) if interval.is_none() => return Err(e),
                Err(e) => error!("descheduling cycle failed: {}", e),
            }

            let Some(interval) = interval else {
                return Ok(());
            };
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).to_string())
}

async fn run(args: RunArgs) -> Result<(), DeschedulerError> {
    let policy = DeschedulerPolicy::load(&expand_path(&args.policy_config_file))?;
    let registry = default_registry()?;

    let client = KubeClusterClient::connect(args.kubeconfig.as_deref().map(expand_path)).await?;
    let eviction_supported = client.supports_eviction().await?;
    if !eviction_supported {
        warn!("the cluster does not support the eviction subresource, pods will be deleted instead");
    }

    let descheduler = Descheduler::new(Arc::new(client), &policy, &registry)?
        .with_eviction_support(eviction_supported)
        .with_dry_run(args.dry_run)
        .with_api_timeout(Duration::from_secs(args.api_timeout_seconds))
        .with_cycle_timeout(args.cycle_timeout_seconds.map(Duration::from_secs));

    let interval = match (args.once, args.descheduling_interval_seconds) {
        (true, _) | (_, 0) => None,
        (false, secs) => Some(Duration::from_secs(secs)),
    };

    let ctx = CancellationToken::new();
    let running = Box::pin(descheduler.run(&ctx, interval));
    let shutdown = Box::pin(tokio::signal::ctrl_c());
    match select(running, shutdown).await {
        Either::Left((result, _)) => result,
        Either::Right((_, running)) => {
            info!("Received Ctrl+C, shutting down...");
            ctx.cancel();
            running.await
        }
    }
}

pub async fn descheduler() -> Result<(), DeschedulerError> {
    let args = Cli::parse();
    match args.command {
        Commands::Run(args) => run(args).await,
    }
}
