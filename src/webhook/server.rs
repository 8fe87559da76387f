//! Admission webhook HTTP surface
//!
//! [`WebhookServer`] is a startup-time registry mapping endpoint paths to
//! typed webhook handlers: each `register_*` call adds an axum route whose
//! path is derived deterministically from the entity kind and the
//! registration name. The resulting router also carries `/healthz` and
//! `/readyz` probes and is served with graceful shutdown; TLS termination is
//! the deployment's concern.
//!
//! Each request is bounded by the registration's timeout. A handler that
//! errors or panics is surfaced by the HTTP layer as a 500, which the API
//! server resolves through the webhook's `FailurePolicy`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::resource::Resource;
use crate::webhook::admission::{
    AdmissionResponse, AdmissionReview, MutatingWebhook, ValidatingWebhook,
    DEFAULT_REJECTION_CODE,
};
use crate::webhook::pipeline;
use crate::webhook::registration::WebhookRegistration;
use crate::webhook::selector::NamespaceLabels;
use crate::webhook::{endpoint_path, WebhookKind};

/// Startup-time registry of admission webhooks, served over HTTP
pub struct WebhookServer {
    router: Router,
    namespaces: Option<Arc<dyn NamespaceLabels>>,
}

impl WebhookServer {
    /// Empty registry with health probes only
    pub fn new() -> Self {
        Self {
            router: Router::new()
                .route("/healthz", get(|| async { "ok" }))
                .route("/readyz", get(|| async { "ok" })),
            namespaces: None,
        }
    }

    /// Wire a namespace-label lookup so `namespaceSelector` filters are
    /// evaluated in-process (see [`NamespaceLabels`])
    pub fn with_namespace_labels(mut self, lookup: Arc<dyn NamespaceLabels>) -> Self {
        self.namespaces = Some(lookup);
        self
    }

    /// Register a mutating webhook under its derived endpoint path
    pub fn register_mutating<K, W>(mut self, webhook: W, registration: WebhookRegistration) -> Self
    where
        K: Resource + Serialize + DeserializeOwned,
        W: MutatingWebhook<K>,
    {
        let path = endpoint_path(K::kind(), &registration.name, WebhookKind::Mutating);
        info!(path = %path, webhook = %registration.name, "Registered mutating webhook");

        let webhook = Arc::new(webhook);
        let registration = Arc::new(registration);
        let namespaces = self.namespaces.clone();
        let handler = move |Json(review): Json<AdmissionReview<K>>| {
            let webhook = webhook.clone();
            let registration = registration.clone();
            let namespaces = namespaces.clone();
            async move {
                Json(
                    review_mutating(
                        webhook.as_ref(),
                        registration.as_ref(),
                        namespaces.as_deref(),
                        review,
                    )
                    .await,
                )
            }
        };

        self.router = self.router.route(&path, post(handler));
        self
    }

    /// Register a validating webhook under its derived endpoint path
    pub fn register_validating<K, W>(
        mut self,
        webhook: W,
        registration: WebhookRegistration,
    ) -> Self
    where
        K: Resource + Serialize + DeserializeOwned,
        W: ValidatingWebhook<K>,
    {
        let path = endpoint_path(K::kind(), &registration.name, WebhookKind::Validating);
        info!(path = %path, webhook = %registration.name, "Registered validating webhook");

        let webhook = Arc::new(webhook);
        let registration = Arc::new(registration);
        let namespaces = self.namespaces.clone();
        let handler = move |Json(review): Json<AdmissionReview<K>>| {
            let webhook = webhook.clone();
            let registration = registration.clone();
            let namespaces = namespaces.clone();
            async move {
                Json(
                    review_validating(
                        webhook.as_ref(),
                        registration.as_ref(),
                        namespaces.as_deref(),
                        review,
                    )
                    .await,
                )
            }
        };

        self.router = self.router.route(&path, post(handler));
        self
    }

    /// The assembled router, for embedding into an existing server
    pub fn into_router(self) -> Router {
        self.router
    }

    /// Bind and serve until the token is cancelled
    pub async fn serve(self, addr: SocketAddr, cancel: CancellationToken) -> crate::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %addr, "Admission webhook server listening");
        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

impl Default for WebhookServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn review_mutating<K: Resource + Serialize>(
    webhook: &dyn MutatingWebhook<K>,
    registration: &WebhookRegistration,
    namespaces: Option<&dyn NamespaceLabels>,
    review: AdmissionReview<K>,
) -> AdmissionReview<serde_json::Value> {
    let Some(request) = review.request else {
        return AdmissionResponse::denied(
            "",
            DEFAULT_REJECTION_CODE,
            "admission review carries no request",
        )
        .into_review();
    };

    let uid = request.uid.clone();
    match tokio::time::timeout(
        registration.timeout,
        pipeline::mutate(webhook, registration, namespaces, &request),
    )
    .await
    {
        Ok(response) => response.into_review(),
        Err(_) => pipeline::timeout_response(&uid, registration).into_review(),
    }
}

async fn review_validating<K: Resource>(
    webhook: &dyn ValidatingWebhook<K>,
    registration: &WebhookRegistration,
    namespaces: Option<&dyn NamespaceLabels>,
    review: AdmissionReview<K>,
) -> AdmissionReview<serde_json::Value> {
    let Some(request) = review.request else {
        return AdmissionResponse::denied(
            "",
            DEFAULT_REJECTION_CODE,
            "admission review carries no request",
        )
        .into_review();
    };

    let uid = request.uid.clone();
    match tokio::time::timeout(
        registration.timeout,
        pipeline::validate(webhook, registration, namespaces, &request),
    )
    .await
    {
        Ok(response) => response.into_review(),
        Err(_) => pipeline::timeout_response(&uid, registration).into_review(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::Deserialize;

    use crate::resource::ObjectMeta;
    use crate::webhook::admission::{AdmissionRequest, Operation, ValidationResult, API_VERSION, REVIEW_KIND};
    use crate::webhook::registration::FailurePolicy;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Widget {
        metadata: ObjectMeta,
    }

    impl Resource for Widget {
        fn kind() -> &'static str {
            "Widget"
        }
        fn meta(&self) -> &ObjectMeta {
            &self.metadata
        }
        fn meta_mut(&mut self) -> &mut ObjectMeta {
            &mut self.metadata
        }
    }

    fn incoming(request: AdmissionRequest<Widget>) -> AdmissionReview<Widget> {
        AdmissionReview {
            api_version: API_VERSION.to_string(),
            kind: REVIEW_KIND.to_string(),
            request: Some(request),
            response: None,
        }
    }

    fn create_request() -> AdmissionRequest<Widget> {
        AdmissionRequest {
            uid: "u-1".into(),
            operation: Operation::Create,
            object: Some(Widget {
                metadata: ObjectMeta::namespaced("prod", "alpha"),
            }),
            old_object: None,
            dry_run: false,
            namespace: Some("prod".into()),
        }
    }

    struct Slow;

    #[async_trait]
    impl ValidatingWebhook<Widget> for Slow {
        async fn create(&self, _new: &Widget, _dry_run: bool) -> ValidationResult {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ValidationResult::success()
        }
    }

    /// Deadline overruns resolve through the registration's failure policy
    #[tokio::test(start_paused = true)]
    async fn test_slow_webhook_times_out_per_policy() {
        let registration =
            WebhookRegistration::new("slow").with_timeout(Duration::from_secs(5));
        let review = review_validating(&Slow, &registration, None, incoming(create_request())).await;
        let response = review.response.unwrap();
        assert!(!response.allowed);
        assert_eq!(response.status.unwrap().code, 504);

        let lenient = WebhookRegistration::new("slow")
            .with_timeout(Duration::from_secs(5))
            .with_failure_policy(FailurePolicy::Ignore);
        let review = review_validating(&Slow, &lenient, None, incoming(create_request())).await;
        assert!(review.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_review_without_request_is_rejected() {
        let review = AdmissionReview::<Widget> {
            api_version: API_VERSION.to_string(),
            kind: REVIEW_KIND.to_string(),
            request: None,
            response: None,
        };
        let registration = WebhookRegistration::new("any");
        let out = review_validating(&Slow, &registration, None, review).await;
        assert!(!out.response.unwrap().allowed);
    }

    #[test]
    fn test_registry_builds_router() {
        struct AllowAll;
        #[async_trait]
        impl ValidatingWebhook<Widget> for AllowAll {}

        // Registration is pure wiring; building the router must not panic
        // on path derivation or route conflicts.
        let server = WebhookServer::new()
            .register_validating::<Widget, _>(AllowAll, WebhookRegistration::new("quota"))
            .register_mutating::<Widget, _>(Passthrough, WebhookRegistration::new("defaulter"));
        let _router = server.into_router();
    }

    struct Passthrough;
    #[async_trait]
    impl MutatingWebhook<Widget> for Passthrough {}
}
