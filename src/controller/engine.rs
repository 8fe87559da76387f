//! Reconciliation engine
//!
//! The engine is the [`EventProcessor`] plugged into the work queue: it
//! classifies each delivered event, invokes the matching controller
//! callback, applies requeue directives, and routes failures through the
//! controller's error policy. Per-identity bookkeeping (consecutive failure
//! count, last observed spec generation) lives here; the single-flight
//! guarantee of the queue makes each identity's entry effectively
//! single-writer.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::controller::{ErrorAction, ReconcileAction, ResourceController};
use crate::finalizer::FinalizerManager;
use crate::queue::{EventProcessor, ProcessOutcome, ReconcileRequest};
use crate::resource::{EventType, ObjectIdentity, Resource};
use crate::Error;

/// Per-identity bookkeeping
#[derive(Clone, Debug, Default)]
struct IdentityTrack {
    /// Consecutive failure count; reset on any success
    attempt: u32,
    /// Spec generation observed at the last successful reconcile
    last_generation: Option<i64>,
}

/// Drives controller callbacks for one resource type
pub(crate) struct Engine<K: Resource, C: ResourceController<K>> {
    controller: Arc<C>,
    finalizers: Arc<FinalizerManager<K>>,
    tracks: DashMap<ObjectIdentity, IdentityTrack>,
}

impl<K: Resource, C: ResourceController<K>> Engine<K, C> {
    pub(crate) fn new(controller: Arc<C>, finalizers: Arc<FinalizerManager<K>>) -> Self {
        Self {
            controller,
            finalizers,
            tracks: DashMap::new(),
        }
    }

    /// Added/Modified: ensure finalizer markers, then reconcile
    async fn apply(&self, request: &ReconcileRequest<K>, entity: &K) -> ProcessOutcome {
        let registered = match self.finalizers.register_all(entity).await {
            Ok(updated) => updated,
            Err(error) => return self.fail(request, entity, error).await,
        };
        let entity = registered.as_ref().unwrap_or(entity);

        debug!(identity = %request.identity, "Reconciling");
        match self.controller.reconcile(entity).await {
            Ok(action) => {
                self.mark_success(&request.identity, entity);
                match action {
                    ReconcileAction::Ok => ProcessOutcome::Idle,
                    ReconcileAction::RequeueAfter { delay, event_type } => {
                        // The re-delivery carries the same generation; clear
                        // the tracked one so it reconciles instead of being
                        // classified as a status-only change.
                        self.clear_generation(&request.identity);
                        ProcessOutcome::Requeue {
                            delay,
                            event_type: event_type
                                .or_else(|| request.event.event_type())
                                .unwrap_or(EventType::Modified),
                        }
                    }
                }
            }
            Err(error) => self.fail(request, entity, error).await,
        }
    }

    /// Modified with an unchanged spec generation: status subresource only
    async fn status(&self, request: &ReconcileRequest<K>, entity: &K) -> ProcessOutcome {
        debug!(identity = %request.identity, "Status subresource changed");
        match self.controller.status_modified(entity).await {
            Ok(()) => {
                self.mark_success(&request.identity, entity);
                ProcessOutcome::Idle
            }
            // Status handling is fire-and-forget: no requeue directive
            // exists on this path, but the error policy may still retry.
            Err(error) => self.fail(request, entity, error).await,
        }
    }

    /// Deletion path: run finalizer cleanup in order; on a terminal Deleted
    /// event also invoke `deleted` and evict the identity
    async fn finalize(
        &self,
        request: &ReconcileRequest<K>,
        entity: &K,
        terminal: bool,
    ) -> ProcessOutcome {
        let cleaned = match self.finalizers.run_cleanup(entity).await {
            Ok(updated) => updated,
            Err(error) => {
                // The resource stays blocked; the next delete delivery
                // resumes from the first still-present finalizer.
                warn!(identity = %request.identity, "Finalizer cleanup failed, resource stays blocked");
                return self.fail(request, entity, error).await;
            }
        };

        if !terminal {
            // Deletion in progress (timestamp set) but the object still
            // exists; the terminal Deleted event finishes the lifecycle.
            self.mark_success(&request.identity, entity);
            return ProcessOutcome::Idle;
        }

        let entity = cleaned.as_ref().unwrap_or(entity);
        match self.controller.deleted(entity).await {
            Ok(()) => {
                info!(identity = %request.identity, "Resource deleted, dropping identity");
                self.tracks.remove(&request.identity);
                ProcessOutcome::Evict
            }
            Err(error) => self.fail(request, entity, error).await,
        }
    }

    async fn fail(
        &self,
        request: &ReconcileRequest<K>,
        entity: &K,
        error: Error,
    ) -> ProcessOutcome {
        match self.consult_policy(request, entity, error).await {
            ErrorAction::Ignore => ProcessOutcome::Idle,
            ErrorAction::Requeue { delay } => {
                // The retry must re-run the failing callback even when the
                // generation has not moved.
                self.clear_generation(&request.identity);
                ProcessOutcome::Requeue {
                    delay,
                    event_type: request.event.event_type().unwrap_or(EventType::Modified),
                }
            }
        }
    }

    async fn consult_policy(
        &self,
        request: &ReconcileRequest<K>,
        entity: &K,
        error: Error,
    ) -> ErrorAction {
        let attempt = {
            let mut track = self.tracks.entry(request.identity.clone()).or_default();
            track.attempt += 1;
            track.attempt
        };
        warn!(
            identity = %request.identity,
            attempt,
            error = %error,
            "Reconcile callback failed, consulting error policy"
        );
        let action = self.controller.error_policy(entity, attempt, &error).await;
        debug!(identity = %request.identity, ?action, "Error policy decided");
        action
    }

    fn mark_success(&self, identity: &ObjectIdentity, entity: &K) {
        let mut track = self.tracks.entry(identity.clone()).or_default();
        track.attempt = 0;
        track.last_generation = entity.meta().generation;
    }

    fn clear_generation(&self, identity: &ObjectIdentity) {
        if let Some(mut track) = self.tracks.get_mut(identity) {
            track.last_generation = None;
        }
    }

    fn is_status_only(&self, identity: &ObjectIdentity, entity: &K) -> bool {
        let Some(generation) = entity.meta().generation else {
            return false;
        };
        self.tracks
            .get(identity)
            .and_then(|track| track.last_generation)
            == Some(generation)
    }
}

#[async_trait]
impl<K, C> EventProcessor<K> for Engine<K, C>
where
    K: Resource,
    C: ResourceController<K>,
{
    async fn process(&self, request: &ReconcileRequest<K>) -> ProcessOutcome {
        let Some(entity) = request.event.object() else {
            return ProcessOutcome::Idle;
        };
        let Some(event_type) = request.event.event_type() else {
            return ProcessOutcome::Idle;
        };

        match event_type {
            EventType::Deleted => self.finalize(request, entity, true).await,
            _ if entity.marked_for_deletion() => {
                if self.finalizers.has_pending(entity) {
                    self.finalize(request, entity, false).await
                } else {
                    // Deletion already in progress with none of our markers
                    // left; re-adding them here would block it forever.
                    ProcessOutcome::Idle
                }
            }
            EventType::Modified if self.is_status_only(&request.identity, entity) => {
                self.status(request, entity).await
            }
            _ => self.apply(request, entity).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::client::{
        ClientError, ClusterClient, ListParams, ObjectList, PatchDocument, WatchStream,
    };
    use crate::resource::{ObjectMeta, WatchEvent};

    #[derive(Clone, Debug)]
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

    fn widget(generation: i64) -> Widget {
        Widget {
            metadata: ObjectMeta {
                generation: Some(generation),
                ..ObjectMeta::namespaced("default", "alpha")
            },
        }
    }

    struct NullClient;

    #[async_trait]
    impl ClusterClient<Widget> for NullClient {
        async fn list(&self, _p: &ListParams) -> Result<ObjectList<Widget>, ClientError> {
            Err(ClientError::transport("not used"))
        }
        async fn watch(
            &self,
            _p: &ListParams,
            _rv: &str,
        ) -> Result<WatchStream<Widget>, ClientError> {
            Err(ClientError::transport("not used"))
        }
        async fn get(&self, _ns: Option<&str>, _n: &str) -> Result<Widget, ClientError> {
            Err(ClientError::not_found("not used"))
        }
        async fn create(&self, e: &Widget) -> Result<Widget, ClientError> {
            Ok(e.clone())
        }
        async fn replace(&self, e: &Widget) -> Result<Widget, ClientError> {
            Ok(e.clone())
        }
        async fn patch(
            &self,
            _ns: Option<&str>,
            _n: &str,
            _p: &PatchDocument,
        ) -> Result<Widget, ClientError> {
            Err(ClientError::transport("not used"))
        }
        async fn delete(&self, _ns: Option<&str>, _n: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct Probe {
        reconciles: AtomicU32,
        status_calls: AtomicU32,
        deletes: AtomicU32,
        attempts_seen: Mutex<Vec<u32>>,
        fail_first: AtomicU32,
        policy: Mutex<ErrorAction>,
    }

    impl Probe {
        fn failing(times: u32, policy: ErrorAction) -> Arc<Self> {
            Arc::new(Self {
                reconciles: AtomicU32::new(0),
                status_calls: AtomicU32::new(0),
                deletes: AtomicU32::new(0),
                attempts_seen: Mutex::new(Vec::new()),
                fail_first: AtomicU32::new(times),
                policy: Mutex::new(policy),
            })
        }
    }

    #[async_trait]
    impl ResourceController<Widget> for Probe {
        async fn reconcile(&self, _entity: &Widget) -> crate::Result<ReconcileAction> {
            self.reconciles.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                Err(Error::controller("transient reconcile failure"))
            } else {
                Ok(ReconcileAction::ok())
            }
        }

        async fn status_modified(&self, _entity: &Widget) -> crate::Result<()> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deleted(&self, _entity: &Widget) -> crate::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn error_policy(&self, _entity: &Widget, attempt: u32, _error: &Error) -> ErrorAction {
            self.attempts_seen.lock().unwrap().push(attempt);
            self.policy.lock().unwrap().clone()
        }
    }

    fn engine(probe: Arc<Probe>) -> Engine<Widget, Probe> {
        let manager = FinalizerManager::new(Arc::new(NullClient));
        Engine::new(probe, Arc::new(manager))
    }

    fn modified(generation: i64) -> ReconcileRequest<Widget> {
        ReconcileRequest::from_event(WatchEvent::Modified(widget(generation))).unwrap()
    }

    #[tokio::test]
    async fn test_spec_change_reconciles() {
        let probe = Probe::failing(0, ErrorAction::Ignore);
        let engine = engine(probe.clone());

        let outcome = engine.process(&modified(1)).await;
        assert_eq!(outcome, ProcessOutcome::Idle);
        assert_eq!(probe.reconciles.load(Ordering::SeqCst), 1);
        assert_eq!(probe.status_calls.load(Ordering::SeqCst), 0);
    }

    /// A Modified event with an unchanged generation is a status-only change
    #[tokio::test]
    async fn test_status_only_change_routes_to_status_hook() {
        let probe = Probe::failing(0, ErrorAction::Ignore);
        let engine = engine(probe.clone());

        engine.process(&modified(4)).await;
        engine.process(&modified(4)).await;
        engine.process(&modified(5)).await;

        assert_eq!(probe.reconciles.load(Ordering::SeqCst), 2);
        assert_eq!(probe.status_calls.load(Ordering::SeqCst), 1);
    }

    /// Attempt counts grow per consecutive failure and reset on success
    #[tokio::test]
    async fn test_attempt_counter_grows_and_resets() {
        let probe = Probe::failing(2, ErrorAction::requeue(Duration::from_secs(1)));
        let engine = engine(probe.clone());

        let first = engine.process(&modified(1)).await;
        assert!(matches!(first, ProcessOutcome::Requeue { .. }));
        let second = engine.process(&modified(1)).await;
        assert!(matches!(second, ProcessOutcome::Requeue { .. }));
        // Third attempt succeeds and resets the counter.
        assert_eq!(engine.process(&modified(1)).await, ProcessOutcome::Idle);

        // Fail once more: the policy sees attempt 1 again.
        probe.fail_first.store(1, Ordering::SeqCst);
        engine.process(&modified(2)).await;

        assert_eq!(*probe.attempts_seen.lock().unwrap(), vec![1, 2, 1]);
    }

    /// Ignore drops the event without scheduling anything
    #[tokio::test]
    async fn test_error_policy_ignore_goes_idle() {
        let probe = Probe::failing(1, ErrorAction::Ignore);
        let engine = engine(probe.clone());

        assert_eq!(engine.process(&modified(1)).await, ProcessOutcome::Idle);
        assert_eq!(*probe.attempts_seen.lock().unwrap(), vec![1]);
    }

    /// Deleted events call the deleted hook and evict the identity
    #[tokio::test]
    async fn test_terminal_delete_evicts() {
        let probe = Probe::failing(0, ErrorAction::Ignore);
        let engine = engine(probe.clone());

        let request = ReconcileRequest::from_event(WatchEvent::Deleted(widget(3))).unwrap();
        assert_eq!(engine.process(&request).await, ProcessOutcome::Evict);
        assert_eq!(probe.deletes.load(Ordering::SeqCst), 1);
        assert!(engine.tracks.is_empty());
    }

    /// A requeued re-delivery reconciles again even though the generation
    /// has not moved; it must not be mistaken for a status-only change
    #[tokio::test]
    async fn test_requeue_redelivery_reconciles_same_generation() {
        struct RequeueOnce {
            reconciles: AtomicU32,
            status_calls: AtomicU32,
        }

        #[async_trait]
        impl ResourceController<Widget> for RequeueOnce {
            async fn reconcile(&self, _entity: &Widget) -> crate::Result<ReconcileAction> {
                if self.reconciles.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(ReconcileAction::requeue_after(Duration::from_secs(1)))
                } else {
                    Ok(ReconcileAction::ok())
                }
            }
            async fn status_modified(&self, _entity: &Widget) -> crate::Result<()> {
                self.status_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let controller = Arc::new(RequeueOnce {
            reconciles: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
        });
        let manager = FinalizerManager::new(Arc::new(NullClient));
        let engine: Engine<Widget, RequeueOnce> =
            Engine::new(controller.clone(), Arc::new(manager));

        let first = engine.process(&modified(3)).await;
        assert!(matches!(first, ProcessOutcome::Requeue { .. }));

        // The synthetic re-delivery carries the same generation.
        let second = engine.process(&modified(3)).await;
        assert_eq!(second, ProcessOutcome::Idle);
        assert_eq!(controller.reconciles.load(Ordering::SeqCst), 2);
        assert_eq!(controller.status_calls.load(Ordering::SeqCst), 0);
    }

    /// An object mid-deletion with our markers gone is left alone
    ///
    /// Re-adding finalizers at that point would block the deletion forever.
    #[tokio::test]
    async fn test_deleting_object_is_not_reconciled() {
        use chrono::Utc;

        let probe = Probe::failing(0, ErrorAction::Ignore);
        let engine = engine(probe.clone());

        let mut deleting = widget(2);
        deleting.metadata.deletion_timestamp = Some(Utc::now());
        let request = ReconcileRequest::from_event(WatchEvent::Modified(deleting)).unwrap();

        assert_eq!(engine.process(&request).await, ProcessOutcome::Idle);
        assert_eq!(probe.reconciles.load(Ordering::SeqCst), 0);
    }

    /// The requeue event type defaults to the triggering event's type
    #[tokio::test]
    async fn test_requeue_uses_triggering_event_type() {
        #[derive(Default)]
        struct Requeuer;

        #[async_trait]
        impl ResourceController<Widget> for Requeuer {
            async fn reconcile(&self, _entity: &Widget) -> crate::Result<ReconcileAction> {
                Ok(ReconcileAction::requeue_after(Duration::from_secs(7)))
            }
        }

        let manager = FinalizerManager::new(Arc::new(NullClient));
        let engine: Engine<Widget, Requeuer> = Engine::new(Arc::new(Requeuer), Arc::new(manager));

        let request = ReconcileRequest::from_event(WatchEvent::Added(widget(1))).unwrap();
        assert_eq!(
            engine.process(&request).await,
            ProcessOutcome::Requeue {
                delay: Duration::from_secs(7),
                event_type: EventType::Added,
            }
        );
    }
}
