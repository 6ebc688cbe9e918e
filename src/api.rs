use crate::helpers::labels::{LabelSelectorError, Selector};
use anyhow::anyhow;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use strum_macros::{Display, EnumString};
use validator::Validate;

pub const MIN_RESOURCE_PERCENTAGE: f64 = 0.0;
pub const MAX_RESOURCE_PERCENTAGE: f64 = 100.0;

/// Resource name -> percentage of the node's allocatable capacity.
pub type ResourceThresholds = BTreeMap<String, f64>;

/// Namespaces a plugin is restricted to. Only one of the lists may be set.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Namespaces {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Namespaces {
    pub fn allows(&self, namespace: &str) -> bool {
        if !self.include.is_empty() {
            return self.include.iter().any(|n| n == namespace);
        }
        !self.exclude.iter().any(|n| n == namespace)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("only one of Include/Exclude namespaces can be set")]
    NamespacesIncludeAndExclude,
    #[error("failed to get label selectors from strategy's params: {0}")]
    LabelSelector(#[from] LabelSelectorError),
    #[error("{resource} threshold not in [0, 100] range: {value}")]
    ThresholdOutOfRange { resource: String, value: f64 },
    #[error("thresholds of {resource} should be lower than target thresholds: {low} > {high}")]
    ThresholdAboveTarget { resource: String, low: f64, high: f64 },
    #[error("no resource threshold is configured")]
    NoThresholds,
    #[error("{0}")]
    Invalid(String),
    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),
    #[error("plugin {plugin:?} does not implement the {point} extension point")]
    UnsupportedExtensionPoint { plugin: String, point: String },
    #[error("failed to decode args of plugin {plugin:?}: {message}")]
    Decode { plugin: String, message: String },
    #[error("invalid args of plugin {plugin:?}: {source}")]
    Plugin {
        plugin: String,
        #[source]
        source: Box<ValidationError>,
    },
}

pub fn validate_namespaces(namespaces: Option<&Namespaces>) -> Result<(), ValidationError> {
    match namespaces {
        Some(ns) if !ns.include.is_empty() && !ns.exclude.is_empty() => {
            Err(ValidationError::NamespacesIncludeAndExclude)
        }
        _ => Ok(()),
    }
}

pub fn validate_label_selector(selector: Option<&LabelSelector>) -> Result<(), ValidationError> {
    if let Some(selector) = selector {
        Selector::try_from(selector)?;
    }
    Ok(())
}

/// Every percentage must be within 0..=100.
pub fn validate_threshold_range(thresholds: &ResourceThresholds) -> Result<(), ValidationError> {
    for (resource, value) in thresholds {
        if !(MIN_RESOURCE_PERCENTAGE..=MAX_RESOURCE_PERCENTAGE).contains(value) {
            return Err(ValidationError::ThresholdOutOfRange {
                resource: resource.clone(),
                value: *value,
            });
        }
    }
    Ok(())
}

/// For resources present in both maps the low threshold may not exceed the
/// high one.
pub fn validate_low_not_above_high(
    low: &ResourceThresholds,
    high: &ResourceThresholds,
) -> Result<(), ValidationError> {
    for (resource, low_value) in low {
        if let Some(high_value) = high.get(resource) {
            if low_value > high_value {
                return Err(ValidationError::ThresholdAboveTarget {
                    resource: resource.clone(),
                    low: *low_value,
                    high: *high_value,
                });
            }
        }
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum ExtensionPoint {
    Filter,
    PreEvictionFilter,
    Deschedule,
    Balance,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginSet {
    #[serde(default)]
    pub enabled: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Plugins {
    #[serde(default)]
    pub filter: PluginSet,
    #[serde(default)]
    pub pre_eviction_filter: PluginSet,
    #[serde(default)]
    pub deschedule: PluginSet,
    #[serde(default)]
    pub balance: PluginSet,
}

impl Plugins {
    pub fn enabled(&self, point: ExtensionPoint) -> &[String] {
        match point {
            ExtensionPoint::Filter => &self.filter.enabled,
            ExtensionPoint::PreEvictionFilter => &self.pre_eviction_filter.enabled,
            ExtensionPoint::Deschedule => &self.deschedule.enabled,
            ExtensionPoint::Balance => &self.balance.enabled,
        }
    }
}

/// Raw, still undecoded plugin arguments as found in the policy file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub args: serde_yaml::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[validate(length(min = 1, message = "profile name must not be empty"))]
    pub name: String,
    #[serde(default)]
    pub plugin_config: Vec<PluginConfig>,
    #[serde(default)]
    pub plugins: Plugins,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeschedulerPolicy {
    #[validate(length(min = 1, message = "at least one profile is required"), nested)]
    pub profiles: Vec<Profile>,
    /// Label selector string restricting the nodes that are processed.
    #[serde(default)]
    pub node_selector: Option<String>,
    #[serde(default)]
    pub max_no_of_pods_to_evict_per_node: Option<usize>,
    #[serde(default)]
    pub max_no_of_pods_to_evict_per_namespace: Option<usize>,
    #[serde(default)]
    pub max_no_of_pods_to_evict_total: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

impl DeschedulerPolicy {
    pub fn from_yaml(raw: &str) -> Result<Self, crate::errors::DeschedulerError> {
        let policy: DeschedulerPolicy = serde_yaml::from_str(raw)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn load(path: &Path) -> Result<Self, crate::errors::DeschedulerError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!(e).context(format!("failed to read policy file {}", path.display())))?;
        Self::from_yaml(&raw)
    }
}
