//! Controller trait, reconcile actions, and the runtime
//!
//! A controller implements [`ResourceController`] for one resource type and
//! hands it to a [`runtime::ControllerRuntime`], which wires the watch
//! source, work queue, reconciliation engine, finalizers, and (optionally)
//! leader election together.

pub(crate) mod engine;
pub mod runtime;

use std::time::Duration;

use async_trait::async_trait;

use crate::resource::{EventType, Resource};
use crate::retry::RetryConfig;
use crate::Error;

pub use runtime::{ControllerRuntime, ControllerRuntimeBuilder};

/// Default requeue delay applied when a controller does not override
/// [`ResourceController::error_policy`]
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// What the engine should do after a successful reconcile callback
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Done; wait for the next watch event
    Ok,
    /// Re-deliver a synthetic event for this object after the delay
    RequeueAfter {
        /// How long to wait before re-delivery
        delay: Duration,
        /// Override the synthetic event type; defaults to the triggering one
        event_type: Option<EventType>,
    },
}

impl ReconcileAction {
    /// Done; wait for the next watch event
    pub fn ok() -> Self {
        Self::Ok
    }

    /// Requeue after `delay`, re-delivering the same event type
    pub fn requeue_after(delay: Duration) -> Self {
        Self::RequeueAfter {
            delay,
            event_type: None,
        }
    }

    /// Requeue after `delay`, overriding the re-delivered event type
    pub fn requeue_as(delay: Duration, event_type: EventType) -> Self {
        Self::RequeueAfter {
            delay,
            event_type: Some(event_type),
        }
    }
}

/// What the engine should do after a failed callback
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Drop the event; the failure is only reported through logging
    Ignore,
    /// Retry by re-delivering the event after the delay
    Requeue {
        /// How long to wait before the retry
        delay: Duration,
    },
}

impl ErrorAction {
    /// Drop the event
    pub fn ignore() -> Self {
        Self::Ignore
    }

    /// Retry after `delay`
    pub fn requeue(delay: Duration) -> Self {
        Self::Requeue { delay }
    }
}

/// User-supplied reconciliation logic for one resource type
///
/// Reconcile callbacks must be idempotent: watch delivery is at-least-once,
/// and during a leader-election handover two instances may briefly overlap.
#[async_trait]
pub trait ResourceController<K: Resource>: Send + Sync + 'static {
    /// Converge cluster state toward the entity's spec
    ///
    /// Invoked for added and modified objects (except status-only changes).
    async fn reconcile(&self, entity: &K) -> crate::Result<ReconcileAction>;

    /// Invoked when only the status subresource changed
    ///
    /// Fire-and-forget from the state machine's perspective: no requeue
    /// directive, no finalizer logic.
    async fn status_modified(&self, _entity: &K) -> crate::Result<()> {
        Ok(())
    }

    /// Invoked once an object is gone and all finalizers have completed
    async fn deleted(&self, _entity: &K) -> crate::Result<()> {
        Ok(())
    }

    /// Decide how to handle a failed callback
    ///
    /// `attempt` counts consecutive failures for this identity, starting at 1
    /// and resetting on any success.
    async fn error_policy(&self, _entity: &K, attempt: u32, error: &Error) -> ErrorAction {
        let _ = (attempt, error);
        ErrorAction::requeue(DEFAULT_ERROR_REQUEUE)
    }

    /// This instance became leader and will start reconciling
    async fn on_promotion(&self) {}

    /// This instance lost leadership; events are held until re-promotion
    async fn on_demotion(&self) {}

    /// A different lease holder was observed
    async fn on_new_leader(&self, _identity: &str) {}
}

/// Tuning knobs for one controller runtime
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Maximum reconciliations in flight across distinct identities
    pub max_concurrent_reconciles: usize,
    /// Event channel capacity between the watch source and the queue
    pub queue_capacity: usize,
    /// Backoff applied to watch reconnects and the promotion catch-up list
    pub watch_retry: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_reconciles: 8,
            queue_capacity: 256,
            watch_retry: RetryConfig::default(),
        }
    }
}
