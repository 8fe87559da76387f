//! Resource metadata model, identities, and watch events
//!
//! Trellis does not depend on a concrete cluster client, so it carries its own
//! minimal metadata model. User CRD structs embed [`ObjectMeta`] and implement
//! [`Resource`] to plug into the runtime; everything else (watch events,
//! identities) is derived from that.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard object metadata carried by every managed resource
///
/// A pruned mirror of Kubernetes `metadata`: only the fields the runtime
/// actually reads (identity, versioning, labels, finalizers, deletion mark).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    /// Object name, unique within a namespace (or the cluster if unscoped)
    pub name: String,

    /// Namespace; `None` for cluster-scoped resources
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Server-assigned unique id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    /// Opaque version token, monotonically comparable by the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    /// Spec generation; bumped by the server on spec changes only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,

    /// Object labels
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Object annotations
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Ordered finalizer markers blocking physical deletion
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Set by the server when deletion has been requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    /// Metadata for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A typed resource managed by the runtime
///
/// Implemented by user CRD structs. `kind()` is the static type tag used for
/// identities and webhook endpoint paths.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Static kind tag for this resource type (e.g. `"Widget"`)
    fn kind() -> &'static str;

    /// Object metadata
    fn meta(&self) -> &ObjectMeta;

    /// Mutable object metadata
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// The `(kind, namespace, name)` identity of this object
    fn identity(&self) -> ObjectIdentity {
        ObjectIdentity {
            kind: Self::kind(),
            namespace: self.meta().namespace.clone(),
            name: self.meta().name.clone(),
        }
    }

    /// Whether the server has marked this object for deletion
    fn marked_for_deletion(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

/// The `(kind, namespace, name)` tuple identifying one object
///
/// Used as the dedup/serialization key by the work queue: all events for the
/// same identity are processed in order, never concurrently.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    /// Resource kind tag
    pub kind: &'static str,
    /// Namespace; `None` for cluster-scoped resources
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Status payload carried by an error watch event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus {
    /// HTTP-style status code (410 signals an expired watch window)
    pub code: u16,
    /// Human-readable message
    pub message: String,
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Kind of an object-bearing watch event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Object came into view (created, or re-listed after a restart)
    Added,
    /// Object changed
    Modified,
    /// Object was removed
    Deleted,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Added => f.write_str("Added"),
            EventType::Modified => f.write_str("Modified"),
            EventType::Deleted => f.write_str("Deleted"),
        }
    }
}

/// A single event on a watch stream
///
/// The raw client stream may carry all five variants; the watch source
/// absorbs `Bookmark` (version checkpoint) and `Error` internally and emits
/// only object-bearing variants downstream.
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    /// A resource came into view
    Added(K),
    /// A resource changed
    Modified(K),
    /// A resource was removed
    Deleted(K),
    /// Server checkpoint carrying only a resource version
    Bookmark {
        /// The version to resume from
        resource_version: String,
    },
    /// Error reported in-band by the server
    Error(ApiStatus),
}

impl<K: Resource> WatchEvent<K> {
    /// Build an object-bearing event of the given type
    pub fn new(event_type: EventType, object: K) -> Self {
        match event_type {
            EventType::Added => WatchEvent::Added(object),
            EventType::Modified => WatchEvent::Modified(object),
            EventType::Deleted => WatchEvent::Deleted(object),
        }
    }

    /// The carried object, if any
    pub fn object(&self) -> Option<&K> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                Some(obj)
            }
            _ => None,
        }
    }

    /// The event type, if object-bearing
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            WatchEvent::Added(_) => Some(EventType::Added),
            WatchEvent::Modified(_) => Some(EventType::Modified),
            WatchEvent::Deleted(_) => Some(EventType::Deleted),
            _ => None,
        }
    }

    /// The resource version observed with this event, if any
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Bookmark { resource_version } => Some(resource_version),
            _ => self
                .object()
                .and_then(|obj| obj.meta().resource_version.as_deref()),
        }
    }
}
