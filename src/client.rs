//! Cluster transport traits and error classification
//!
//! The cluster API is an external collaborator: the runtime only ever talks
//! to it through [`ClusterClient`]. Production deployments back the trait
//! with a real HTTP client; the test suite backs it with an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::resource::{Resource, WatchEvent};

/// Errors surfaced by a cluster transport
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// API-level error with an HTTP-style status code
    #[error("api error {code}: {message}")]
    Api {
        /// HTTP-style status code
        code: u16,
        /// Server-provided message
        message: String,
    },

    /// Connection-level failure (dial, reset, timeout)
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::Api {
            code: 404,
            message: msg.into(),
        }
    }

    /// 409 Conflict (compare-and-swap lost)
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Api {
            code: 409,
            message: msg.into(),
        }
    }

    /// 410 Gone (watch window expired, relist required)
    pub fn gone(msg: impl Into<String>) -> Self {
        Self::Api {
            code: 410,
            message: msg.into(),
        }
    }

    /// Connection-level failure
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether this is a 404 Not Found
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { code: 404, .. })
    }

    /// Whether this is a 409 Conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Api { code: 409, .. })
    }

    /// Whether this is a 410 Gone
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Api { code: 410, .. })
    }
}

/// Selector and scope parameters for list/watch calls
#[derive(Clone, Debug, Default)]
pub struct ListParams {
    /// Restrict to one namespace; `None` means all namespaces
    pub namespace: Option<String>,
    /// Label selector expression (e.g. `app=widget,tier!=cache`)
    pub label_selector: Option<String>,
    /// Field selector expression (e.g. `metadata.name=alpha`)
    pub field_selector: Option<String>,
    /// Server-side watch timeout; the server closes the stream after this
    pub timeout: Option<Duration>,
}

impl ListParams {
    /// Restrict to one namespace
    pub fn namespaced(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Filter by label selector
    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Filter by field selector
    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }
}

/// A page of listed objects plus the version to watch from
#[derive(Clone, Debug)]
pub struct ObjectList<K> {
    /// Objects matching the list parameters
    pub items: Vec<K>,
    /// Collection resource version at list time
    pub resource_version: String,
}

/// Patch payload for [`ClusterClient::patch`]
#[derive(Clone, Debug)]
pub enum PatchDocument {
    /// JSON merge patch (RFC 7386)
    Merge(Value),
    /// JSON patch operation list (RFC 6902)
    JsonPatch(json_patch::Patch),
}

/// Streaming watch handle: raw events or transport errors
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, ClientError>>;

/// Asynchronous cluster API for one resource type
///
/// All operations are suspension points; the runtime never holds a lock
/// across them. Implementations must classify API failures through
/// [`ClientError`] so the watch source can distinguish a 410 relist from a
/// transient disconnect.
#[async_trait]
pub trait ClusterClient<K: Resource>: Send + Sync {
    /// List objects matching the parameters
    async fn list(&self, params: &ListParams) -> Result<ObjectList<K>, ClientError>;

    /// Open a watch stream starting at the given resource version
    async fn watch(
        &self,
        params: &ListParams,
        resource_version: &str,
    ) -> Result<WatchStream<K>, ClientError>;

    /// Fetch a single object
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, ClientError>;

    /// Create a new object
    async fn create(&self, entity: &K) -> Result<K, ClientError>;

    /// Replace an existing object (full update, CAS on resource version)
    async fn replace(&self, entity: &K) -> Result<K, ClientError>;

    /// Patch an object, returning the updated state
    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &PatchDocument,
    ) -> Result<K, ClientError>;

    /// Delete an object
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClientError>;
}
