//! Ordered finalizer registration and cleanup
//!
//! A finalizer is a named marker on an object's metadata that blocks
//! physical deletion (cluster behavior) until cleanup logic removes it. The
//! [`FinalizerManager`] is the sole mutator of the marker set for the
//! finalizers it knows about: it idempotently adds missing names on apply,
//! and on delete runs each finalizer's cleanup in registration order,
//! removing the name only after its cleanup succeeded.
//!
//! A cleanup failure halts the pass: the failed finalizer and every one
//! after it stay present, the resource stays blocked, and the next delete
//! delivery resumes from the first still-present name.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::client::{ClusterClient, PatchDocument};
use crate::resource::Resource;

/// Cleanup logic bound to one finalizer name
#[async_trait]
pub trait Finalizer<K: Resource>: Send + Sync + 'static {
    /// The marker name stored in the object's metadata
    /// (e.g. `widgets.example.com/cache-cleanup`)
    fn name(&self) -> &str;

    /// Release whatever the finalizer protects
    ///
    /// Must be idempotent: a pass that failed midway re-runs cleanup for
    /// names that were already attempted but not yet removed.
    async fn cleanup(&self, entity: &K) -> crate::Result<()>;
}

/// Adds, runs, and removes the finalizers registered for one resource type
pub struct FinalizerManager<K: Resource> {
    client: Arc<dyn ClusterClient<K>>,
    finalizers: Vec<Arc<dyn Finalizer<K>>>,
}

impl<K: Resource> FinalizerManager<K> {
    /// Manager with no finalizers registered
    pub fn new(client: Arc<dyn ClusterClient<K>>) -> Self {
        Self {
            client,
            finalizers: Vec::new(),
        }
    }

    /// Append a finalizer; registration order is execution order
    pub fn register(&mut self, finalizer: Arc<dyn Finalizer<K>>) {
        self.finalizers.push(finalizer);
    }

    /// Whether any finalizers are registered at all
    pub fn is_empty(&self) -> bool {
        self.finalizers.is_empty()
    }

    /// Whether the entity still carries any of the registered names
    pub fn has_pending(&self, entity: &K) -> bool {
        let present = &entity.meta().finalizers;
        self.finalizers
            .iter()
            .any(|f| present.iter().any(|name| name == f.name()))
    }

    /// Idempotently ensure every registered name is present on the entity
    ///
    /// Returns the patched entity when markers were added, `None` when the
    /// set was already complete.
    pub async fn register_all(&self, entity: &K) -> crate::Result<Option<K>> {
        let present = &entity.meta().finalizers;
        let missing: Vec<String> = self
            .finalizers
            .iter()
            .map(|f| f.name().to_string())
            .filter(|name| !present.contains(name))
            .collect();

        if missing.is_empty() {
            return Ok(None);
        }

        let mut desired = present.clone();
        desired.extend(missing.iter().cloned());

        debug!(
            entity = %entity.identity(),
            added = missing.len(),
            "Adding missing finalizer markers"
        );
        let updated = self.patch_finalizers(entity, &desired).await?;
        Ok(Some(updated))
    }

    /// Run registered finalizers still present on the entity, in
    /// registration order, removing each name after its cleanup succeeds
    ///
    /// Halts on the first failure; names from that point on stay present.
    /// Returns the latest patched entity when any marker was removed.
    pub async fn run_cleanup(&self, entity: &K) -> crate::Result<Option<K>> {
        let mut current: Option<K> = None;

        for finalizer in &self.finalizers {
            let view = current.as_ref().unwrap_or(entity);
            if !view.meta().finalizers.iter().any(|n| n == finalizer.name()) {
                continue;
            }

            finalizer.cleanup(view).await?;

            let remaining: Vec<String> = view
                .meta()
                .finalizers
                .iter()
                .filter(|n| n.as_str() != finalizer.name())
                .cloned()
                .collect();
            info!(
                entity = %view.identity(),
                finalizer = %finalizer.name(),
                "Finalizer cleanup complete, removing marker"
            );
            current = Some(self.patch_finalizers(view, &remaining).await?);
        }

        Ok(current)
    }

    async fn patch_finalizers(&self, entity: &K, finalizers: &[String]) -> crate::Result<K> {
        let meta = entity.meta();
        let patch = PatchDocument::Merge(json!({
            "metadata": { "finalizers": finalizers }
        }));
        let updated = self
            .client
            .patch(meta.namespace.as_deref(), &meta.name, &patch)
            .await?;
        Ok(updated)
    }
}
