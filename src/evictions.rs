use crate::client::{ClientError, ClusterClient};
use crate::helpers::pod_helpers::{pod_name, pod_namespace, pod_node_name};
use k8s_openapi::api::core::v1::Pod;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use strum_macros::Display;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictOptions {
    /// Name of the plugin asking for the eviction.
    pub strategy_name: String,
    pub dry_run: bool,
    pub reason: String,
}

impl EvictOptions {
    pub fn new(strategy_name: &str) -> Self {
        Self {
            strategy_name: strategy_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LimitKind {
    Node,
    Namespace,
    Total,
}

/// Non-error results of an eviction request.
#[derive(Debug, Clone, PartialEq)]
pub enum EvictionOutcome {
    Evicted,
    /// The decision was recorded but the API was not called.
    DryRun,
    /// A pre-eviction filter rejected the pod.
    Skipped(String),
    LimitReached(LimitKind),
}

impl EvictionOutcome {
    /// Evicted or dry-run: the pod is gone as far as the strategy is concerned.
    pub fn is_evicted(&self) -> bool {
        matches!(self, EvictionOutcome::Evicted | EvictionOutcome::DryRun)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvictionError {
    #[error("eviction of {pod} would violate a pod disruption budget: {message}")]
    DisruptionBudget { pod: String, message: String },
    #[error("conflict evicting {pod}: {message}")]
    Conflict { pod: String, message: String },
    #[error("forbidden to evict {pod}: {message}")]
    Forbidden { pod: String, message: String },
    #[error("pod {pod} not found")]
    NotFound { pod: String },
    #[error("timed out evicting {pod}")]
    Timeout { pod: String },
    #[error("error evicting {pod}: {source}")]
    Api {
        pod: String,
        #[source]
        source: ClientError,
    },
    #[error("eviction cancelled")]
    Cancelled,
}

impl EvictionError {
    fn from_client(pod: String, err: ClientError) -> Self {
        match (&err, err.code()) {
            (_, Some(429)) => EvictionError::DisruptionBudget {
                pod,
                message: err.to_string(),
            },
            (_, Some(409)) => EvictionError::Conflict {
                pod,
                message: err.to_string(),
            },
            (_, Some(403)) => EvictionError::Forbidden {
                pod,
                message: err.to_string(),
            },
            (_, Some(404)) => EvictionError::NotFound { pod },
            (ClientError::Timeout, _) => EvictionError::Timeout { pod },
            _ => EvictionError::Api { pod, source: err },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EvictionLimits {
    pub max_pods_to_evict_per_node: Option<usize>,
    pub max_pods_to_evict_per_namespace: Option<usize>,
    pub max_pods_to_evict_total: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvictionCounters {
    pub total: usize,
    pub per_node: HashMap<String, usize>,
    pub per_namespace: HashMap<String, usize>,
}

/// Sink for cluster events about eviction decisions.
pub trait EventRecorder: Send + Sync {
    fn event(&self, pod: &Pod, event_type: &str, reason: &str, message: &str);
}

pub struct LogEventRecorder {}

impl EventRecorder for LogEventRecorder {
    fn event(&self, pod: &Pod, event_type: &str, reason: &str, message: &str) {
        info!(
            target: "descheduler::events",
            "{} {} pod {}: {}",
            event_type,
            reason,
            pod_name(pod),
            message
        );
    }
}

/// Issues evictions for one descheduling cycle and keeps the counters the
/// limits are checked against. Create a new one per cycle.
pub struct PodEvictor {
    client: Arc<dyn ClusterClient>,
    eviction_supported: bool,
    dry_run: bool,
    limits: EvictionLimits,
    api_timeout: Duration,
    recorder: Arc<dyn EventRecorder>,
    counters: Mutex<EvictionCounters>,
    // held across the API call so evictions never interleave
    eviction_lock: tokio::sync::Mutex<()>,
}

impl PodEvictor {
    pub fn new(client: Arc<dyn ClusterClient>, eviction_supported: bool, limits: EvictionLimits) -> Self {
        Self {
            client,
            eviction_supported,
            dry_run: false,
            limits,
            api_timeout: DEFAULT_API_TIMEOUT,
            recorder: Arc::new(LogEventRecorder {}),
            counters: Mutex::new(EvictionCounters::default()),
            eviction_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn with_event_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    fn lock_counters(&self) -> MutexGuard<'_, EvictionCounters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn counters(&self) -> EvictionCounters {
        self.lock_counters().clone()
    }

    pub fn total_evicted(&self) -> usize {
        self.lock_counters().total
    }

    pub fn node_evicted(&self, node: &str) -> usize {
        self.lock_counters().per_node.get(node).copied().unwrap_or(0)
    }

    pub fn node_limit_exceeded(&self, node: &str) -> bool {
        match self.limits.max_pods_to_evict_per_node {
            Some(max) => self.node_evicted(node) >= max,
            None => false,
        }
    }

    pub fn total_limit_exceeded(&self) -> bool {
        match self.limits.max_pods_to_evict_total {
            Some(max) => self.total_evicted() >= max,
            None => false,
        }
    }

    fn limit_reached(&self, counters: &EvictionCounters, node: &str, namespace: &str) -> Option<LimitKind> {
        if let Some(max) = self.limits.max_pods_to_evict_total {
            if counters.total >= max {
                return Some(LimitKind::Total);
            }
        }
        if let Some(max) = self.limits.max_pods_to_evict_per_node {
            if counters.per_node.get(node).copied().unwrap_or(0) >= max {
                return Some(LimitKind::Node);
            }
        }
        if let Some(max) = self.limits.max_pods_to_evict_per_namespace {
            if counters.per_namespace.get(namespace).copied().unwrap_or(0) >= max {
                return Some(LimitKind::Namespace);
            }
        }
        None
    }

    fn record(&self, node: &str, namespace: &str) {
        let mut counters = self.lock_counters();
        counters.total += 1;
        *counters.per_node.entry(node.to_string()).or_insert(0) += 1;
        *counters.per_namespace.entry(namespace.to_string()).or_insert(0) += 1;
    }

    /// Evicts `pod` unless a limit is reached or the context is cancelled.
    /// Dry-run decisions count toward the limits like real evictions.
    pub async fn evict_pod(
        &self,
        ctx: &CancellationToken,
        pod: &Pod,
        opts: &EvictOptions,
    ) -> Result<EvictionOutcome, EvictionError> {
        let _guard = tokio::select! {
            guard = self.eviction_lock.lock() => guard,
            _ = ctx.cancelled() => return Err(EvictionError::Cancelled),
        };
        if ctx.is_cancelled() {
            return Err(EvictionError::Cancelled);
        }

        let name = pod_name(pod);
        let node = pod_node_name(pod).unwrap_or_default();
        let namespace = pod_namespace(pod);

        if let Some(kind) = self.limit_reached(&self.lock_counters(), node, namespace) {
            info!(
                "Maximum number of evicted pods per {} reached, not evicting {} (strategy {})",
                kind.to_string().to_lowercase(),
                name,
                opts.strategy_name
            );
            return Ok(EvictionOutcome::LimitReached(kind));
        }

        if self.dry_run || opts.dry_run {
            self.record(node, namespace);
            info!(
                "Evicted pod in dry run mode: {} on node {} (strategy {}, reason {:?})",
                name, node, opts.strategy_name, opts.reason
            );
            return Ok(EvictionOutcome::DryRun);
        }

        debug!("Evicting pod {} from node {}", name, node);
        let pod_ns = namespace.to_string();
        let pod_short_name = pod.metadata.name.clone().unwrap_or_default();
        let call = async {
            if self.eviction_supported {
                self.client.evict_pod(&pod_ns, &pod_short_name).await
            } else {
                self.client.delete_pod(&pod_ns, &pod_short_name).await
            }
        };

        let result = tokio::select! {
            biased;
            res = tokio::time::timeout(self.api_timeout, call) => match res {
                Err(_) => Err(EvictionError::Timeout { pod: name.clone() }),
                Ok(Err(e)) => Err(EvictionError::from_client(name.clone(), e)),
                Ok(Ok(())) => Ok(()),
            },
            _ = ctx.cancelled() => Err(EvictionError::Cancelled),
        };

        match result {
            Ok(()) => {
                self.record(node, namespace);
                let message = format!("pod evicted from node {} by {}", node, opts.strategy_name);
                self.recorder.event(pod, "Normal", "Descheduled", &message);
                info!(
                    "Evicted pod {} from node {} (strategy {}, reason {:?})",
                    name, node, opts.strategy_name, opts.reason
                );
                Ok(EvictionOutcome::Evicted)
            }
            Err(e) => {
                warn!("Error evicting pod {}: {}", name, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fake_client::FakeClusterClient;
    use crate::test_helpers::objects::pod;

    fn evictor(client: Arc<FakeClusterClient>, limits: EvictionLimits) -> PodEvictor {
        PodEvictor::new(client, true, limits)
    }

    #[tokio::test]
    async fn should_evict_and_count() {
        let client = Arc::new(FakeClusterClient::default());
        let evictor = evictor(client.clone(), EvictionLimits::default());
        let ctx = CancellationToken::new();
        let p = pod("default", "web-1").on_node("node1").build();

        let outcome = evictor.evict_pod(&ctx, &p, &EvictOptions::new("test")).await;
        assert_eq!(outcome, Ok(EvictionOutcome::Evicted));
        assert_eq!(client.evicted(), vec!["default/web-1".to_string()]);
        assert_eq!(evictor.total_evicted(), 1);
        assert_eq!(evictor.node_evicted("node1"), 1);
        assert_eq!(evictor.counters().per_namespace.get("default"), Some(&1));
    }

    #[tokio::test]
    async fn should_stop_at_node_limit() {
        let client = Arc::new(FakeClusterClient::default());
        let evictor = evictor(
            client.clone(),
            EvictionLimits {
                max_pods_to_evict_per_node: Some(1),
                ..Default::default()
            },
        );
        let ctx = CancellationToken::new();
        let p1 = pod("default", "web-1").on_node("node1").build();
        let p2 = pod("default", "web-2").on_node("node1").build();
        let p3 = pod("default", "web-3").on_node("node2").build();

        let opts = EvictOptions::new("test");
        assert_eq!(evictor.evict_pod(&ctx, &p1, &opts).await, Ok(EvictionOutcome::Evicted));
        assert_eq!(
            evictor.evict_pod(&ctx, &p2, &opts).await,
            Ok(EvictionOutcome::LimitReached(LimitKind::Node))
        );
        assert!(evictor.node_limit_exceeded("node1"));
        assert_eq!(evictor.evict_pod(&ctx, &p3, &opts).await, Ok(EvictionOutcome::Evicted));
        assert_eq!(client.evicted().len(), 2);
    }

    #[tokio::test]
    async fn should_stop_at_namespace_and_total_limits() {
        let client = Arc::new(FakeClusterClient::default());
        let evictor = evictor(
            client.clone(),
            EvictionLimits {
                max_pods_to_evict_per_namespace: Some(1),
                max_pods_to_evict_total: Some(2),
                ..Default::default()
            },
        );
        let ctx = CancellationToken::new();
        let opts = EvictOptions::new("test");

        let a1 = pod("a", "p1").on_node("node1").build();
        let a2 = pod("a", "p2").on_node("node2").build();
        let b1 = pod("b", "p1").on_node("node3").build();
        let c1 = pod("c", "p1").on_node("node4").build();

        assert_eq!(evictor.evict_pod(&ctx, &a1, &opts).await, Ok(EvictionOutcome::Evicted));
        assert_eq!(
            evictor.evict_pod(&ctx, &a2, &opts).await,
            Ok(EvictionOutcome::LimitReached(LimitKind::Namespace))
        );
        assert_eq!(evictor.evict_pod(&ctx, &b1, &opts).await, Ok(EvictionOutcome::Evicted));
        assert_eq!(
            evictor.evict_pod(&ctx, &c1, &opts).await,
            Ok(EvictionOutcome::LimitReached(LimitKind::Total))
        );
        assert!(evictor.total_limit_exceeded());
        assert_eq!(client.evicted().len(), 2);
    }

    #[tokio::test]
    async fn dry_run_counts_without_calling_api() {
        let client = Arc::new(FakeClusterClient::default());
        let evictor = evictor(
            client.clone(),
            EvictionLimits {
                max_pods_to_evict_total: Some(1),
                ..Default::default()
            },
        )
        .with_dry_run(true);
        let ctx = CancellationToken::new();
        let opts = EvictOptions::new("test");

        let p1 = pod("default", "web-1").on_node("node1").build();
        let p2 = pod("default", "web-2").on_node("node1").build();
        assert_eq!(evictor.evict_pod(&ctx, &p1, &opts).await, Ok(EvictionOutcome::DryRun));
        assert_eq!(
            evictor.evict_pod(&ctx, &p2, &opts).await,
            Ok(EvictionOutcome::LimitReached(LimitKind::Total))
        );
        assert!(client.evicted().is_empty());
        assert!(client.deleted().is_empty());
        assert_eq!(evictor.total_evicted(), 1);
    }

    #[tokio::test]
    async fn should_fall_back_to_delete() {
        let client = Arc::new(FakeClusterClient::default());
        let evictor = PodEvictor::new(client.clone(), false, EvictionLimits::default());
        let ctx = CancellationToken::new();
        let p = pod("default", "web-1").on_node("node1").build();

        let outcome = evictor.evict_pod(&ctx, &p, &EvictOptions::new("test")).await;
        assert_eq!(outcome, Ok(EvictionOutcome::Evicted));
        assert!(client.evicted().is_empty());
        assert_eq!(client.deleted(), vec!["default/web-1".to_string()]);
    }

    #[tokio::test]
    async fn should_map_pdb_violation() {
        let client = Arc::new(FakeClusterClient::default());
        client.fail_eviction(
            "default/web-1",
            ClientError::Api {
                code: 429,
                reason: "TooManyRequests".to_string(),
                message: "Cannot evict pod as it would violate the pod's disruption budget."
                    .to_string(),
            },
        );
        let evictor = evictor(client.clone(), EvictionLimits::default());
        let ctx = CancellationToken::new();
        let p = pod("default", "web-1").on_node("node1").build();

        let outcome = evictor.evict_pod(&ctx, &p, &EvictOptions::new("test")).await;
        assert!(matches!(outcome, Err(EvictionError::DisruptionBudget { .. })));
        assert_eq!(evictor.total_evicted(), 0);
    }

    #[tokio::test]
    async fn should_not_evict_when_cancelled() {
        let client = Arc::new(FakeClusterClient::default());
        let evictor = evictor(client.clone(), EvictionLimits::default());
        let ctx = CancellationToken::new();
        ctx.cancel();
        let p = pod("default", "web-1").on_node("node1").build();

        let outcome = evictor.evict_pod(&ctx, &p, &EvictOptions::new("test")).await;
        assert_eq!(outcome, Err(EvictionError::Cancelled));
        assert!(client.evicted().is_empty());
    }

    #[tokio::test]
    async fn should_time_out_slow_calls() {
        let client = Arc::new(FakeClusterClient::default().with_latency(Duration::from_millis(200)));
        let evictor = evictor(client.clone(), EvictionLimits::default())
            .with_api_timeout(Duration::from_millis(10));
        let ctx = CancellationToken::new();
        let p = pod("default", "web-1").on_node("node1").build();

        let outcome = evictor.evict_pod(&ctx, &p, &EvictOptions::new("test")).await;
        assert!(matches!(outcome, Err(EvictionError::Timeout { .. })));
    }
}
