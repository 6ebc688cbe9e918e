use crate::cache::{ClusterSnapshot, PodLister};
use crate::evictions::{EvictOptions, EvictionError, EvictionOutcome};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use std::sync::Arc;
use strum_macros::Display;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Code {
    Success,
    Error,
}

/// Result of one plugin invocation. Never a fatal signal: the run loop logs
/// errors and moves on to the next plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub code: Code,
    pub message: String,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: Code::Success,
            message: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: Code::Error,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Code::Success
    }
}

/// The evictor capability handed to plugins. It combines the profile's
/// filters with the cycle's shared PodEvictor.
#[async_trait]
pub trait Evictor: Send + Sync {
    /// True when every Filter plugin of the profile accepts the pod.
    fn filter(&self, pod: &Pod) -> bool;
    async fn evict(
        &self,
        ctx: &CancellationToken,
        pod: &Pod,
        opts: EvictOptions,
    ) -> Result<EvictionOutcome, EvictionError>;
    fn node_limit_exceeded(&self, node: &str) -> bool;
    fn total_limit_exceeded(&self) -> bool;
    fn total_evicted(&self) -> usize;
}

/// Read-only capability bundle for one cycle. Plugins receive it per call and
/// must not keep it.
pub trait Handle: Send + Sync {
    fn pod_lister(&self) -> &dyn PodLister;
    fn evictor(&self) -> &dyn Evictor;
    fn snapshot(&self) -> Arc<ClusterSnapshot>;
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
}

//*
// NOTE: the extension points mirror the Kubernetes descheduler framework.

// Copyright 2022 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
// */

/// These plugins evaluate nodes one at a time, independent of the state of
/// the other nodes. All Deschedule plugins of every profile run before any
/// Balance plugin.
#[async_trait]
pub trait DeschedulePlugin: Plugin {
    async fn deschedule(
        &self,
        ctx: &CancellationToken,
        handle: &dyn Handle,
        nodes: &[Node],
    ) -> Status;
}

/// These plugins receive the full node list of the cycle and rebalance pods
/// across nodes.
#[async_trait]
pub trait BalancePlugin: Plugin {
    async fn balance(&self, ctx: &CancellationToken, handle: &dyn Handle, nodes: &[Node]) -> Status;
}

/// These plugins decide whether a pod may be considered for eviction at all.
/// A pod has to pass every Filter plugin of the profile.
pub trait FilterPlugin: Plugin {
    fn filter(&self, pod: &Pod) -> Result<(), String>;
}

/// These plugins are re-checked right before the eviction call, to catch
/// changes since the pod was selected.
pub trait PreEvictionFilterPlugin: Plugin {
    fn pre_eviction_filter(&self, pod: &Pod) -> Result<(), String>;
}

/// The capabilities one configured plugin provides. Built by the plugin's
/// factory; only the declared extension points are ever invoked.
#[derive(Clone)]
pub struct PluginInstance {
    pub name: String,
    pub deschedule: Option<Arc<dyn DeschedulePlugin>>,
    pub balance: Option<Arc<dyn BalancePlugin>>,
    pub filter: Option<Arc<dyn FilterPlugin>>,
    pub pre_eviction_filter: Option<Arc<dyn PreEvictionFilterPlugin>>,
}

impl PluginInstance {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            deschedule: None,
            balance: None,
            filter: None,
            pre_eviction_filter: None,
        }
    }

    pub fn with_deschedule(mut self, plugin: Arc<dyn DeschedulePlugin>) -> Self {
        self.deschedule = Some(plugin);
        self
    }

    pub fn with_balance(mut self, plugin: Arc<dyn BalancePlugin>) -> Self {
        self.balance = Some(plugin);
        self
    }

    pub fn with_filter(mut self, plugin: Arc<dyn FilterPlugin>) -> Self {
        self.filter = Some(plugin);
        self
    }

    pub fn with_pre_eviction_filter(mut self, plugin: Arc<dyn PreEvictionFilterPlugin>) -> Self {
        self.pre_eviction_filter = Some(plugin);
        self
    }
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name)
            .field("deschedule", &self.deschedule.is_some())
            .field("balance", &self.balance.is_some())
            .field("filter", &self.filter.is_some())
            .field("pre_eviction_filter", &self.pre_eviction_filter.is_some())
            .finish()
    }
}
