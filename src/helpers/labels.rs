use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::str::FromStr;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").unwrap());
static DNS_SUBDOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Label set of objects that carry none.
pub static EMPTY_LABELS: BTreeMap<String, String> = BTreeMap::new();

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LabelSelectorError {
    #[error("invalid label key {0:?}")]
    InvalidKey(String),
    #[error("invalid label value {0:?}")]
    InvalidValue(String),
    #[error("invalid operator {0:?} for key {1:?}")]
    InvalidOperator(String, String),
    #[error("operator {0} for key {1:?} requires values")]
    MissingValues(String, String),
    #[error("operator {0} for key {1:?} must not have values")]
    UnexpectedValues(String, String),
    #[error("unable to parse selector {0:?}")]
    Parse(String),
}

pub fn validate_label_key(key: &str) -> Result<(), LabelSelectorError> {
    let invalid = || LabelSelectorError::InvalidKey(key.to_string());
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 || !DNS_SUBDOMAIN_RE.is_match(prefix) {
            return Err(invalid());
        }
    }
    if name.is_empty() || name.len() > 63 || !NAME_RE.is_match(name) {
        return Err(invalid());
    }
    Ok(())
}

pub fn validate_label_value(value: &str) -> Result<(), LabelSelectorError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 63 || !NAME_RE.is_match(value) {
        return Err(LabelSelectorError::InvalidValue(value.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, values) => labels.get(k).map(|l| values.contains(l)).unwrap_or(false),
            Requirement::NotIn(k, values) => labels.get(k).map(|l| !values.contains(l)).unwrap_or(true),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

/// A parsed label selector. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = LabelSelectorError;

    fn try_from(ls: &LabelSelector) -> Result<Self, Self::Error> {
        let mut requirements = vec![];
        for (k, v) in ls.match_labels.iter().flatten() {
            validate_label_key(k)?;
            validate_label_value(v)?;
            requirements.push(Requirement::Equals(k.clone(), v.clone()));
        }
        for expr in ls.match_expressions.iter().flatten() {
            validate_label_key(&expr.key)?;
            let values = expr.values.clone().unwrap_or_default();
            let requirement = match expr.operator.as_str() {
                "In" | "NotIn" => {
                    if values.is_empty() {
                        return Err(LabelSelectorError::MissingValues(
                            expr.operator.clone(),
                            expr.key.clone(),
                        ));
                    }
                    for v in &values {
                        validate_label_value(v)?;
                    }
                    if expr.operator == "In" {
                        Requirement::In(expr.key.clone(), values)
                    } else {
                        Requirement::NotIn(expr.key.clone(), values)
                    }
                }
                "Exists" | "DoesNotExist" => {
                    if !values.is_empty() {
                        return Err(LabelSelectorError::UnexpectedValues(
                            expr.operator.clone(),
                            expr.key.clone(),
                        ));
                    }
                    if expr.operator == "Exists" {
                        Requirement::Exists(expr.key.clone())
                    } else {
                        Requirement::DoesNotExist(expr.key.clone())
                    }
                }
                other => {
                    return Err(LabelSelectorError::InvalidOperator(
                        other.to_string(),
                        expr.key.clone(),
                    ))
                }
            };
            requirements.push(requirement);
        }
        Ok(Selector { requirements })
    }
}

/// Parses the string form used on the command line and in node selectors:
/// `a=b,c!=d,e,!f`.
impl FromStr for Selector {
    type Err = LabelSelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = vec![];
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let requirement = if let Some((k, v)) = part.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once("==") {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once('=') {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = part.strip_prefix('!') {
                Requirement::DoesNotExist(k.trim().to_string())
            } else {
                Requirement::Exists(part.to_string())
            };

            match &requirement {
                Requirement::Equals(k, v) | Requirement::NotEquals(k, v) => {
                    validate_label_key(k).map_err(|_| LabelSelectorError::Parse(s.to_string()))?;
                    validate_label_value(v).map_err(|_| LabelSelectorError::Parse(s.to_string()))?;
                }
                Requirement::Exists(k) | Requirement::DoesNotExist(k) => {
                    validate_label_key(k).map_err(|_| LabelSelectorError::Parse(s.to_string()))?;
                }
                _ => {}
            }
            requirements.push(requirement);
        }
        Ok(Selector { requirements })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn should_match_label_selector() {
        let ls = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "tier".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["frontend".to_string(), "edge".to_string()]),
            }]),
        };
        let selector = Selector::try_from(&ls).unwrap();
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "edge")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("tier", "backend")])));
        assert!(!selector.matches(&labels(&[("tier", "edge")])));
    }

    #[test]
    fn should_reject_malformed_selector() {
        let ls = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "".to_string(),
                operator: "In".to_string(),
                values: None,
            }]),
            ..Default::default()
        };
        assert!(Selector::try_from(&ls).is_err());

        let ls = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "app".to_string(),
                operator: "Near".to_string(),
                values: None,
            }]),
            ..Default::default()
        };
        assert!(Selector::try_from(&ls).is_err());

        let ls = LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "role.kubernetes.io/node".to_string(),
                "".to_string(),
            )])),
            ..Default::default()
        };
        assert!(Selector::try_from(&ls).is_ok());
    }

    #[test]
    fn should_parse_selector_string() {
        let selector: Selector = "zone=a, env!=prod,gpu,!spot".parse().unwrap();
        assert!(selector.matches(&labels(&[("zone", "a"), ("env", "dev"), ("gpu", "")])));
        assert!(!selector.matches(&labels(&[("zone", "a"), ("gpu", ""), ("spot", "")])));
        assert!(!selector.matches(&labels(&[("zone", "b"), ("gpu", "")])));

        assert!("".parse::<Selector>().unwrap().is_empty());
        assert!("=value".parse::<Selector>().is_err());
    }
}
