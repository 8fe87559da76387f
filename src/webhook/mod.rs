//! Admission webhook pipeline and HTTP surface
//!
//! Handles synchronous admission review requests from the API server before
//! a write is persisted. A webhook implements
//! [`ValidatingWebhook`]/[`MutatingWebhook`] over its typed entity and is
//! registered on a [`WebhookServer`] together with a
//! [`WebhookRegistration`] describing the fields of its emitted
//! configuration manifest - the pipeline honors the selector, timeout, and
//! failure-policy fields at request time.
//!
//! Admission never touches the reconciliation queue: each request is a
//! self-contained parse -> filter -> dispatch -> respond pass.

pub mod admission;
pub mod pipeline;
pub mod registration;
pub mod selector;
pub mod server;

pub use admission::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, AdmissionStatus, MutatingWebhook,
    MutationResult, Operation, ValidatingWebhook, ValidationResult,
};
pub use registration::{
    FailurePolicy, MatchPolicy, ReinvocationPolicy, SideEffects, WebhookRegistration, WebhookRule,
};
pub use selector::{LabelSelector, LabelSelectorRequirement, NamespaceLabels, SelectorOperator};
pub use server::WebhookServer;

/// Which admission phase a webhook participates in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookKind {
    /// May rewrite the object before validation
    Mutating,
    /// May only accept or reject
    Validating,
}

impl WebhookKind {
    /// Leading path segment for endpoints of this kind
    pub fn path_segment(&self) -> &'static str {
        match self {
            WebhookKind::Mutating => "mutate",
            WebhookKind::Validating => "validate",
        }
    }
}

/// Derive the endpoint path for a webhook deterministically
///
/// The same derivation feeds the emitted configuration manifest's
/// `clientConfig`, so registration and serving cannot drift apart.
pub fn endpoint_path(entity_kind: &str, webhook_name: &str, kind: WebhookKind) -> String {
    format!(
        "/{}/{}/{}",
        kind.path_segment(),
        entity_kind.to_ascii_lowercase(),
        webhook_name.to_ascii_lowercase()
    )
}
