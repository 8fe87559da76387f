//! Webhook registration configuration
//!
//! Mirrors the fields of an emitted `MutatingWebhookConfiguration` /
//! `ValidatingWebhookConfiguration` entry. Manifest emission itself is a
//! build-time concern; at request time the pipeline honors the selector,
//! timeout, and failure-policy fields of the registration it was given.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::webhook::admission::Operation;
use crate::webhook::selector::LabelSelector;

/// What the API server does when the webhook call fails or times out
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Treat the failure as "allowed"
    Ignore,
    /// Reject the API request
    #[default]
    Fail,
}

/// How rule resource names are matched
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// Only the exact group/version/resource
    Exact,
    /// Also equivalent versions of the same resource
    #[default]
    Equivalent,
}

/// Side-effect declaration of the webhook
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideEffects {
    /// No side effects
    #[default]
    None,
    /// No side effects on dry-run calls
    NoneOnDryRun,
    /// Has side effects
    Some,
    /// Unknown
    Unknown,
}

/// Whether a mutating webhook may run again within one evaluation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReinvocationPolicy {
    /// At most once per evaluation
    #[default]
    Never,
    /// May be re-invoked on its own output; the webhook must be idempotent
    IfNeeded,
}

/// One rule describing which requests reach the webhook
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookRule {
    /// API groups the rule applies to (`""` for core)
    pub api_groups: Vec<String>,
    /// API versions the rule applies to
    pub api_versions: Vec<String>,
    /// Operations the rule applies to
    pub operations: Vec<Operation>,
    /// Resource plural names the rule applies to
    pub resources: Vec<String>,
    /// `"Namespaced"`, `"Cluster"`, or `"*"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Registration-time configuration for one webhook
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookRegistration {
    /// Webhook name; part of the endpoint path
    pub name: String,
    /// Request rules (consumed by manifest emission)
    pub rules: Vec<WebhookRule>,
    /// Failure handling honored on in-process timeouts too
    pub failure_policy: FailurePolicy,
    /// Rule match policy
    pub match_policy: MatchPolicy,
    /// Side-effect declaration
    pub side_effects: SideEffects,
    /// Hard per-request deadline
    pub timeout: Duration,
    /// Re-invocation declaration
    pub reinvocation_policy: ReinvocationPolicy,
    /// Only handle objects from namespaces matching this selector
    pub namespace_selector: Option<LabelSelector>,
    /// Only handle objects matching this selector
    pub object_selector: Option<LabelSelector>,
}

impl WebhookRegistration {
    /// Registration with Kubernetes-default policies and a 10s timeout
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            failure_policy: FailurePolicy::default(),
            match_policy: MatchPolicy::default(),
            side_effects: SideEffects::default(),
            timeout: Duration::from_secs(10),
            reinvocation_policy: ReinvocationPolicy::default(),
            namespace_selector: None,
            object_selector: None,
        }
    }

    /// Add a request rule
    pub fn with_rule(mut self, rule: WebhookRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Override the per-request deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the failure policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Declare the webhook re-invocable (and therefore idempotent)
    pub fn with_reinvocation_policy(mut self, policy: ReinvocationPolicy) -> Self {
        self.reinvocation_policy = policy;
        self
    }

    /// Filter by namespace labels
    pub fn with_namespace_selector(mut self, selector: LabelSelector) -> Self {
        self.namespace_selector = Some(selector);
        self
    }

    /// Filter by object labels
    pub fn with_object_selector(mut self, selector: LabelSelector) -> Self {
        self.object_selector = Some(selector);
        self
    }
}
