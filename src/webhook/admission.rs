//! Admission wire types, typed results, and webhook traits
//!
//! The API server POSTs an `AdmissionReview` wrapping an
//! [`AdmissionRequest`]; the pipeline answers with a review wrapping an
//! [`AdmissionResponse`]. User webhooks never touch the wire form: they
//! implement [`ValidatingWebhook`] or [`MutatingWebhook`] over their typed
//! entity and return explicit [`ValidationResult`] / [`MutationResult`]
//! values. Expected rejections travel through those results; thrown errors
//! are reserved for genuinely unexpected failures and surface as HTTP 500s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::resource::Resource;

/// Fallback status code when a rejection does not set one
pub const DEFAULT_REJECTION_CODE: u16 = 400;

/// Admission operation under review
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Object is being created
    Create,
    /// Object is being updated
    Update,
    /// Object is being deleted
    Delete,
}

/// One admission request as decoded from the review envelope
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest<K> {
    /// Request id, echoed verbatim in the response
    pub uid: String,
    /// Operation under review
    pub operation: Operation,
    /// New object state; absent on pure deletes
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub object: Option<K>,
    /// Previous object state; absent on creates
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub old_object: Option<K>,
    /// True for dry-run evaluation; webhooks must not cause side effects
    #[serde(default)]
    pub dry_run: bool,
    /// Namespace of the object under review, when namespaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Status detail attached to a rejection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStatus {
    /// HTTP-style status code
    pub code: u16,
    /// Message surfaced verbatim to the requesting user
    pub message: String,
}

/// Wire-format admission response
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// Request id this response answers
    pub uid: String,
    /// Whether the API request may proceed
    pub allowed: bool,
    /// Rejection detail; absent when allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
    /// Warnings returned to the client alongside the verdict
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// `"JSONPatch"` when a patch is attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    /// Base64-encoded RFC 6902 patch document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

impl AdmissionResponse {
    /// Allow unchanged
    pub fn allowed(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: true,
            status: None,
            warnings: Vec::new(),
            patch_type: None,
            patch: None,
        }
    }

    /// Reject with a status code and message
    pub fn denied(uid: impl Into<String>, code: u16, message: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: false,
            status: Some(AdmissionStatus {
                code,
                message: message.into(),
            }),
            warnings: Vec::new(),
            patch_type: None,
            patch: None,
        }
    }

    /// Wrap into a response review envelope
    pub fn into_review(self) -> AdmissionReview<serde_json::Value> {
        AdmissionReview {
            api_version: API_VERSION.to_string(),
            kind: REVIEW_KIND.to_string(),
            request: None,
            response: Some(self),
        }
    }
}

/// `apiVersion` of the review envelope
pub const API_VERSION: &str = "admission.k8s.io/v1";
/// `kind` of the review envelope
pub const REVIEW_KIND: &str = "AdmissionReview";

/// The review envelope wrapping a request or a response
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview<K> {
    /// Always [`API_VERSION`]
    pub api_version: String,
    /// Always [`REVIEW_KIND`]
    pub kind: String,
    /// Present on incoming reviews
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest<K>>,
    /// Present on outgoing reviews
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

/// Typed verdict of a validating webhook
///
/// Never carries a patch; mutation goes through [`MutationResult`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationResult {
    /// Whether the request is admitted
    pub valid: bool,
    /// Status code for rejections; 0 falls back to
    /// [`DEFAULT_REJECTION_CODE`]
    pub status_code: u16,
    /// Rejection message surfaced to the user
    pub message: Option<String>,
    /// Warnings attached regardless of the verdict
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Admit the request
    pub fn success() -> Self {
        Self {
            valid: true,
            status_code: 0,
            message: None,
            warnings: Vec::new(),
        }
    }

    /// Reject with a status code and message
    pub fn fail(code: u16, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            status_code: code,
            message: Some(message.into()),
            warnings: Vec::new(),
        }
    }

    /// Attach a warning
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Typed verdict of a mutating webhook
///
/// `NoChanges` means "no changes" regardless of anything else; the patch in
/// the wire response is diffed from the `Modified` object, never hand-built.
#[derive(Clone, Debug)]
pub enum MutationResult<K> {
    /// Admit unchanged
    NoChanges,
    /// Admit with the object replaced by this modified state
    Modified(K),
    /// Reject with a status code and message
    Fail {
        /// Status code for the rejection
        code: u16,
        /// Message surfaced to the user
        message: String,
    },
}

impl<K> MutationResult<K> {
    /// Admit unchanged
    pub fn no_changes() -> Self {
        Self::NoChanges
    }

    /// Admit with the modified object
    pub fn modified(object: K) -> Self {
        Self::Modified(object)
    }

    /// Reject with a status code and message
    pub fn fail(code: u16, message: impl Into<String>) -> Self {
        Self::Fail {
            code,
            message: message.into(),
        }
    }
}

/// Validating webhook over one resource type
///
/// Default implementations admit everything, so a webhook only overrides the
/// operations it cares about.
#[async_trait]
pub trait ValidatingWebhook<K: Resource>: Send + Sync + 'static {
    /// Review a create
    async fn create(&self, _new: &K, _dry_run: bool) -> ValidationResult {
        ValidationResult::success()
    }

    /// Review an update
    async fn update(&self, _old: &K, _new: &K, _dry_run: bool) -> ValidationResult {
        ValidationResult::success()
    }

    /// Review a delete
    async fn delete(&self, _old: &K, _dry_run: bool) -> ValidationResult {
        ValidationResult::success()
    }
}

/// Mutating webhook over one resource type
///
/// Under `ReinvocationPolicy::IfNeeded` the webhook may run again on its own
/// output within one admission evaluation; implementations must converge to
/// `NoChanges` on already-mutated state.
#[async_trait]
pub trait MutatingWebhook<K: Resource>: Send + Sync + 'static {
    /// Review (and possibly mutate) a create
    async fn create(&self, _new: &K, _dry_run: bool) -> MutationResult<K> {
        MutationResult::NoChanges
    }

    /// Review (and possibly mutate) an update
    async fn update(&self, _old: &K, _new: &K, _dry_run: bool) -> MutationResult<K> {
        MutationResult::NoChanges
    }

    /// Review a delete
    async fn delete(&self, _old: &K, _dry_run: bool) -> MutationResult<K> {
        MutationResult::NoChanges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_parses_from_wire_form() {
        let body = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "operation": "UPDATE",
                "object": {"metadata": {"name": "alpha"}, "replicas": 3},
                "oldObject": {"metadata": {"name": "alpha"}, "replicas": 1},
                "dryRun": false,
                "namespace": "prod"
            }
        });

        let review: AdmissionReview<serde_json::Value> = serde_json::from_value(body).unwrap();
        let request = review.request.unwrap();
        assert_eq!(request.operation, Operation::Update);
        assert_eq!(request.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert_eq!(request.namespace.as_deref(), Some("prod"));
        assert_eq!(request.object.unwrap()["replicas"], 3);
        assert_eq!(request.old_object.unwrap()["replicas"], 1);
        assert!(!request.dry_run);
    }

    #[test]
    fn test_delete_request_has_no_new_object() {
        let body = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "u-1",
                "operation": "DELETE",
                "oldObject": {"metadata": {"name": "alpha"}}
            }
        });

        let review: AdmissionReview<serde_json::Value> = serde_json::from_value(body).unwrap();
        let request = review.request.unwrap();
        assert_eq!(request.operation, Operation::Delete);
        assert!(request.object.is_none());
        assert!(request.old_object.is_some());
        // Absent dryRun decodes as false
        assert!(!request.dry_run);
    }

    #[test]
    fn test_response_review_shape() {
        let review = AdmissionResponse::denied("u-2", 403, "denied").into_review();
        let value = serde_json::to_value(&review).unwrap();

        assert_eq!(value["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(value["kind"], "AdmissionReview");
        assert_eq!(value["response"]["uid"], "u-2");
        assert_eq!(value["response"]["allowed"], false);
        assert_eq!(value["response"]["status"]["code"], 403);
        assert_eq!(value["response"]["status"]["message"], "denied");
        // No patch fields on a plain rejection
        assert!(value["response"].get("patch").is_none());
        assert!(value["response"].get("patchType").is_none());
        assert!(value.get("request").is_none());
    }

    #[test]
    fn test_allowed_response_omits_status() {
        let value = serde_json::to_value(AdmissionResponse::allowed("u-3")).unwrap();
        assert_eq!(value["allowed"], true);
        assert!(value.get("status").is_none());
        assert!(value.get("warnings").is_none());
    }

    #[test]
    fn test_validation_result_helpers() {
        let ok = ValidationResult::success();
        assert!(ok.valid);
        assert!(ok.message.is_none());

        let rejected = ValidationResult::fail(403, "denied").with_warning("deprecated field");
        assert!(!rejected.valid);
        assert_eq!(rejected.status_code, 403);
        assert_eq!(rejected.warnings, vec!["deprecated field"]);
    }
}
