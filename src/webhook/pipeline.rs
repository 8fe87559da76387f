//! Per-request admission pipeline
//!
//! Synchronous per HTTP request, no queueing and no retries:
//!
//! 1. decode the typed [`AdmissionRequest`] from the review envelope,
//! 2. apply `namespaceSelector`/`objectSelector` filters - non-matching
//!    objects short-circuit to "allowed, unchanged" without invoking user
//!    code,
//! 3. dispatch by operation to the webhook's `create`/`update`/`delete`,
//! 4. transform the typed result into the wire response; mutating results
//!    diff the original object against the modified one into a
//!    base64-encoded JSON patch.
//!
//! Unexpected errors are not caught here: the HTTP layer maps them to a 500
//! and the API server applies the webhook's `FailurePolicy`. An in-process
//! deadline overrun honors the same policy.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::resource::Resource;
use crate::webhook::admission::{
    AdmissionRequest, AdmissionResponse, MutatingWebhook, MutationResult, Operation,
    ValidatingWebhook, ValidationResult, DEFAULT_REJECTION_CODE,
};
use crate::webhook::registration::{FailurePolicy, WebhookRegistration};
use crate::webhook::selector::NamespaceLabels;

/// JSON patch media type marker on the wire
pub const PATCH_TYPE_JSON: &str = "JSONPatch";

/// Run one validating admission request through the pipeline
pub async fn validate<K: Resource>(
    webhook: &dyn ValidatingWebhook<K>,
    registration: &WebhookRegistration,
    namespaces: Option<&dyn NamespaceLabels>,
    request: &AdmissionRequest<K>,
) -> AdmissionResponse {
    if !selectors_match(registration, namespaces, request) {
        debug!(uid = %request.uid, webhook = %registration.name, "Selectors do not match, allowing unchanged");
        return AdmissionResponse::allowed(&request.uid);
    }

    let result = match request.operation {
        Operation::Create => match &request.object {
            Some(new) => webhook.create(new, request.dry_run).await,
            None => return malformed(&request.uid, "create request carries no object"),
        },
        Operation::Update => match (&request.old_object, &request.object) {
            (Some(old), Some(new)) => webhook.update(old, new, request.dry_run).await,
            _ => return malformed(&request.uid, "update request carries incomplete objects"),
        },
        Operation::Delete => match &request.old_object {
            Some(old) => webhook.delete(old, request.dry_run).await,
            None => return malformed(&request.uid, "delete request carries no old object"),
        },
    };

    validation_response(&request.uid, result)
}

/// Run one mutating admission request through the pipeline
pub async fn mutate<K: Resource + Serialize>(
    webhook: &dyn MutatingWebhook<K>,
    registration: &WebhookRegistration,
    namespaces: Option<&dyn NamespaceLabels>,
    request: &AdmissionRequest<K>,
) -> AdmissionResponse {
    if !selectors_match(registration, namespaces, request) {
        debug!(uid = %request.uid, webhook = %registration.name, "Selectors do not match, allowing unchanged");
        return AdmissionResponse::allowed(&request.uid);
    }

    let result = match request.operation {
        Operation::Create => match &request.object {
            Some(new) => webhook.create(new, request.dry_run).await,
            None => return malformed(&request.uid, "create request carries no object"),
        },
        Operation::Update => match (&request.old_object, &request.object) {
            (Some(old), Some(new)) => webhook.update(old, new, request.dry_run).await,
            _ => return malformed(&request.uid, "update request carries incomplete objects"),
        },
        Operation::Delete => match &request.old_object {
            Some(old) => webhook.delete(old, request.dry_run).await,
            None => return malformed(&request.uid, "delete request carries no old object"),
        },
    };

    match result {
        MutationResult::NoChanges => AdmissionResponse::allowed(&request.uid),
        MutationResult::Fail { code, message } => {
            let code = if code == 0 { DEFAULT_REJECTION_CODE } else { code };
            AdmissionResponse::denied(&request.uid, code, message)
        }
        MutationResult::Modified(modified) => {
            // The diff base is the object the patch will be applied to:
            // the old object for deletes, the incoming object otherwise.
            let original = match request.operation {
                Operation::Delete => request.old_object.as_ref(),
                _ => request.object.as_ref(),
            };
            let Some(original) = original else {
                return malformed(&request.uid, "mutation produced without an original object");
            };
            match diff_patch(original, &modified) {
                Ok(None) => AdmissionResponse::allowed(&request.uid),
                Ok(Some(patch)) => {
                    let mut response = AdmissionResponse::allowed(&request.uid);
                    response.patch_type = Some(PATCH_TYPE_JSON.to_string());
                    response.patch = Some(patch);
                    response
                }
                Err(e) => {
                    error!(uid = %request.uid, error = %e, "Failed to serialize mutation patch");
                    AdmissionResponse::denied(
                        &request.uid,
                        500,
                        format!("patch serialization error: {e}"),
                    )
                }
            }
        }
    }
}

/// Response honoring the failure policy after an in-process deadline overrun
pub fn timeout_response(uid: &str, registration: &WebhookRegistration) -> AdmissionResponse {
    warn!(
        uid = %uid,
        webhook = %registration.name,
        timeout_ms = registration.timeout.as_millis(),
        "Webhook deadline exceeded"
    );
    match registration.failure_policy {
        FailurePolicy::Ignore => {
            let mut response = AdmissionResponse::allowed(uid);
            response
                .warnings
                .push(format!("webhook {} timed out, ignored", registration.name));
            response
        }
        FailurePolicy::Fail => AdmissionResponse::denied(
            uid,
            504,
            format!("webhook {} timed out", registration.name),
        ),
    }
}

fn validation_response(uid: &str, result: ValidationResult) -> AdmissionResponse {
    let mut response = if result.valid {
        AdmissionResponse::allowed(uid)
    } else {
        let code = if result.status_code == 0 {
            DEFAULT_REJECTION_CODE
        } else {
            result.status_code
        };
        AdmissionResponse::denied(
            uid,
            code,
            result.message.unwrap_or_else(|| "admission denied".into()),
        )
    };
    response.warnings = result.warnings;
    response
}

fn malformed(uid: &str, message: &str) -> AdmissionResponse {
    warn!(uid = %uid, message, "Malformed admission request");
    AdmissionResponse::denied(uid, DEFAULT_REJECTION_CODE, message)
}

/// Evaluate the registration's selectors against the request
///
/// The object selector tests the labels of the object under review (the old
/// object for deletes). The namespace selector needs the namespace's labels;
/// when no lookup is wired the API server's own filtering is relied upon and
/// the request passes.
fn selectors_match<K: Resource>(
    registration: &WebhookRegistration,
    namespaces: Option<&dyn NamespaceLabels>,
    request: &AdmissionRequest<K>,
) -> bool {
    if let Some(selector) = &registration.object_selector {
        let empty = BTreeMap::new();
        let labels = request
            .object
            .as_ref()
            .or(request.old_object.as_ref())
            .map(|obj| &obj.meta().labels)
            .unwrap_or(&empty);
        if !selector.matches(labels) {
            return false;
        }
    }

    if let Some(selector) = &registration.namespace_selector {
        if let (Some(lookup), Some(namespace)) = (namespaces, request.namespace.as_deref()) {
            if let Some(labels) = lookup.labels(namespace) {
                if !selector.matches(&labels) {
                    return false;
                }
            }
        }
    }

    true
}

/// Diff two typed objects into a base64-encoded JSON patch
///
/// `None` when the objects are identical, which keeps re-invoked idempotent
/// webhooks from emitting empty patches.
fn diff_patch<K: Serialize>(original: &K, modified: &K) -> Result<Option<String>, crate::Error> {
    let old = serde_json::to_value(original)?;
    let new = serde_json::to_value(modified)?;
    let patch = json_patch::diff(&old, &new);
    if patch.0.is_empty() {
        return Ok(None);
    }
    let bytes = serde_json::to_vec(&patch)?;
    Ok(Some(BASE64.encode(bytes)))
}
