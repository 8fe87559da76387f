//! Label-selector matching for admission filtering
//!
//! Mirrors the Kubernetes `LabelSelector` semantics the API server applies
//! to `namespaceSelector`/`objectSelector`: `matchLabels` and
//! `matchExpressions` are ANDed; an empty selector matches everything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A label selector: matchLabels and matchExpressions, ANDed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LabelSelector {
    /// Exact key/value requirements
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    /// Set-based requirements
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

/// One set-based selector requirement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// Label key the requirement applies to
    pub key: String,
    /// How the key's value is tested
    pub operator: SelectorOperator,
    /// Values for `In`/`NotIn`; ignored otherwise
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

/// Operator of a set-based requirement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    /// Value must be one of `values`
    In,
    /// Key absent, or value not in `values`
    NotIn,
    /// Key must be present
    Exists,
    /// Key must be absent
    DoesNotExist,
}

impl LabelSelector {
    /// Selector requiring an exact label value
    pub fn matching(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut match_labels = BTreeMap::new();
        match_labels.insert(key.into(), value.into());
        Self {
            match_labels,
            match_expressions: Vec::new(),
        }
    }

    /// Whether this selector has no requirements (matches everything)
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Evaluate against a label map
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }

        for requirement in &self.match_expressions {
            let actual = labels.get(&requirement.key);
            let ok = match requirement.operator {
                SelectorOperator::In => {
                    actual.is_some_and(|v| requirement.values.iter().any(|want| want == v))
                }
                SelectorOperator::NotIn => {
                    !actual.is_some_and(|v| requirement.values.iter().any(|want| want == v))
                }
                SelectorOperator::Exists => actual.is_some(),
                SelectorOperator::DoesNotExist => actual.is_none(),
            };
            if !ok {
                return false;
            }
        }

        true
    }
}

/// Namespace-label lookup used to evaluate `namespaceSelector`
///
/// The request itself only carries the namespace name; evaluating a
/// namespace selector needs that namespace's labels. Deployments that want
/// the selector honored in-process wire a lookup (typically backed by a
/// namespace watch); without one the API server's own filtering is relied
/// upon.
pub trait NamespaceLabels: Send + Sync {
    /// Labels of the named namespace, `None` if unknown
    fn labels(&self, namespace: &str) -> Option<BTreeMap<String, String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = LabelSelector::default();
        assert!(selector.is_empty());
        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("app", "widget")])));
    }

    #[test]
    fn test_match_labels_exact() {
        let selector = LabelSelector::matching("app", "widget");
        assert!(selector.matches(&labels(&[("app", "widget"), ("tier", "api")])));
        assert!(!selector.matches(&labels(&[("app", "gadget")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_match_expressions() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![
                LabelSelectorRequirement {
                    key: "env".into(),
                    operator: SelectorOperator::In,
                    values: vec!["prod".into(), "staging".into()],
                },
                LabelSelectorRequirement {
                    key: "legacy".into(),
                    operator: SelectorOperator::DoesNotExist,
                    values: Vec::new(),
                },
            ],
        };

        assert!(selector.matches(&labels(&[("env", "prod")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&labels(&[("env", "prod"), ("legacy", "true")])));
    }

    #[test]
    fn test_not_in_matches_absent_key() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![LabelSelectorRequirement {
                key: "tier".into(),
                operator: SelectorOperator::NotIn,
                values: vec!["cache".into()],
            }],
        };

        assert!(selector.matches(&labels(&[])));
        assert!(selector.matches(&labels(&[("tier", "api")])));
        assert!(!selector.matches(&labels(&[("tier", "cache")])));
    }

    #[test]
    fn test_exists() {
        let selector = LabelSelector {
            match_labels: BTreeMap::new(),
            match_expressions: vec![LabelSelectorRequirement {
                key: "owner".into(),
                operator: SelectorOperator::Exists,
                values: Vec::new(),
            }],
        };

        assert!(selector.matches(&labels(&[("owner", "platform")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn test_requirements_are_anded() {
        let mut selector = LabelSelector::matching("app", "widget");
        selector.match_expressions.push(LabelSelectorRequirement {
            key: "env".into(),
            operator: SelectorOperator::In,
            values: vec!["prod".into()],
        });

        assert!(selector.matches(&labels(&[("app", "widget"), ("env", "prod")])));
        assert!(!selector.matches(&labels(&[("app", "widget"), ("env", "dev")])));
    }

    #[test]
    fn test_selector_serde_round_trip() {
        let selector = LabelSelector {
            match_labels: labels(&[("app", "widget")]),
            match_expressions: vec![LabelSelectorRequirement {
                key: "env".into(),
                operator: SelectorOperator::NotIn,
                values: vec!["dev".into()],
            }],
        };

        let value = serde_json::to_value(&selector).unwrap();
        assert_eq!(value["matchLabels"]["app"], "widget");
        assert_eq!(value["matchExpressions"][0]["operator"], "NotIn");

        let back: LabelSelector = serde_json::from_value(value).unwrap();
        assert_eq!(back, selector);
    }
}
