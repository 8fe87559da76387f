//! Per-identity single-flight work queue
//!
//! The queue sits between the watch source and the reconciliation engine. It
//! guarantees that at most one reconciliation runs at a time for any given
//! object identity, while unrelated identities proceed in parallel up to a
//! configurable bound. Newer events for a busy identity replace any pending
//! one (latest-wins): reconcilers read current state, not the event payload,
//! so only the most recent pending event matters.
//!
//! `RequeueAfter` directives from the engine come back as delayed synthetic
//! re-deliveries of the identity's latest known state. When leader election
//! is enabled, delivered events park in their slots until promotion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::resource::{EventType, ObjectIdentity, Resource, WatchEvent};

/// A request to reconcile one object, keyed by its identity
#[derive(Clone, Debug)]
pub struct ReconcileRequest<K> {
    /// The dedup/serialization key
    pub identity: ObjectIdentity,
    /// The triggering event
    pub event: WatchEvent<K>,
}

impl<K: Resource> ReconcileRequest<K> {
    /// Build a request from an object-bearing event; `None` otherwise
    pub fn from_event(event: WatchEvent<K>) -> Option<Self> {
        let identity = event.object()?.identity();
        Some(Self { identity, event })
    }
}

/// What the engine decided after processing one request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing further; wait for the next watch event
    Idle,
    /// Re-deliver a synthetic event for this identity after the delay
    Requeue {
        /// How long to wait before re-delivery
        delay: Duration,
        /// Event type of the synthetic re-delivery
        event_type: EventType,
    },
    /// Terminal delete: drop this identity's slot
    Evict,
}

/// Processes one request at a time per identity; implemented by the engine
#[async_trait]
pub trait EventProcessor<K: Resource>: Send + Sync + 'static {
    /// Handle one request and decide what happens next for its identity
    async fn process(&self, request: &ReconcileRequest<K>) -> ProcessOutcome;
}

/// Queue sizing knobs
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Maximum reconciliations in flight across distinct identities
    pub max_concurrent: usize,
    /// Channel capacity between producers and the dispatcher
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            capacity: 256,
        }
    }
}

/// Cheap cloneable handle for enqueueing work
#[derive(Clone)]
pub struct WorkQueue<K: Resource> {
    tx: mpsc::Sender<Incoming<K>>,
}

impl<K: Resource> WorkQueue<K> {
    /// Spawn the dispatcher task and return the enqueue handle plus its join
    /// handle (awaited on shutdown after cancelling the token).
    ///
    /// With `gated` set, the queue starts as a follower: events park in
    /// their slots until [`set_leading`](Self::set_leading) opens dispatch.
    pub fn spawn(
        processor: Arc<dyn EventProcessor<K>>,
        config: QueueConfig,
        gated: bool,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.capacity);
        let dispatcher = Dispatcher {
            processor,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            requeue_tx: tx.clone(),
            cancel,
        };
        let handle = tokio::spawn(dispatcher.run(rx, !gated));
        (Self { tx }, handle)
    }

    /// Hand an event to the dispatcher; `false` once shutdown has begun
    pub async fn enqueue(&self, request: ReconcileRequest<K>) -> bool {
        self.tx.send(Incoming::Fresh(request)).await.is_ok()
    }

    /// Open or close dispatch after a leadership change
    ///
    /// The caller fires the controller's promotion callback first, then
    /// opens the queue, so parked events never reach user code before
    /// `on_promotion` has run.
    pub async fn set_leading(&self, leading: bool) -> bool {
        self.tx.send(Incoming::Leadership(leading)).await.is_ok()
    }
}

/// Channel payload: watch events, synthetic re-deliveries, leadership moves
enum Incoming<K> {
    Fresh(ReconcileRequest<K>),
    Redelivery(ReconcileRequest<K>),
    Leadership(bool),
}

/// Per-identity serialization slot
struct Slot<K> {
    busy: bool,
    pending: Option<ReconcileRequest<K>>,
}

impl<K> Default for Slot<K> {
    fn default() -> Self {
        Self {
            busy: false,
            pending: None,
        }
    }
}

struct Completion<K> {
    request: ReconcileRequest<K>,
    outcome: ProcessOutcome,
}

struct Dispatcher<K: Resource> {
    processor: Arc<dyn EventProcessor<K>>,
    semaphore: Arc<Semaphore>,
    requeue_tx: mpsc::Sender<Incoming<K>>,
    cancel: CancellationToken,
}

impl<K: Resource> Dispatcher<K> {
    async fn run(self, mut rx: mpsc::Receiver<Incoming<K>>, mut is_leader: bool) {
        let (done_tx, mut done_rx) = mpsc::channel::<Completion<K>>(64);
        let mut slots: HashMap<ObjectIdentity, Slot<K>> = HashMap::new();
        let mut in_flight: usize = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(incoming) = rx.recv() => match incoming {
                    Incoming::Fresh(request) => {
                        self.accept(&mut slots, &mut in_flight, &done_tx, is_leader, request, false);
                    }
                    Incoming::Redelivery(request) => {
                        self.accept(&mut slots, &mut in_flight, &done_tx, is_leader, request, true);
                    }
                    Incoming::Leadership(leading) => {
                        let promoted = leading && !is_leader;
                        is_leader = leading;
                        if promoted {
                            self.flush_parked(&mut slots, &mut in_flight, &done_tx);
                        }
                    }
                },
                Some(done) = done_rx.recv() => {
                    self.complete(&mut slots, &mut in_flight, &done_tx, is_leader, done);
                }
            }
        }

        // Drain: no new dispatches, let in-flight reconciliations finish.
        debug!(in_flight, "Work queue draining");
        while in_flight > 0 {
            if done_rx.recv().await.is_some() {
                in_flight -= 1;
            } else {
                break;
            }
        }
    }

    fn accept(
        &self,
        slots: &mut HashMap<ObjectIdentity, Slot<K>>,
        in_flight: &mut usize,
        done_tx: &mpsc::Sender<Completion<K>>,
        is_leader: bool,
        request: ReconcileRequest<K>,
        synthetic: bool,
    ) {
        let slot = slots.entry(request.identity.clone()).or_default();

        if slot.busy || !is_leader {
            // Latest wins - except that a synthetic re-delivery never
            // replaces a fresher natural event already waiting.
            if !synthetic || slot.pending.is_none() {
                trace!(identity = %request.identity, synthetic, "Event queued behind in-flight work");
                slot.pending = Some(request);
            }
        } else {
            self.dispatch(slot, in_flight, done_tx, request);
        }
    }

    fn dispatch(
        &self,
        slot: &mut Slot<K>,
        in_flight: &mut usize,
        done_tx: &mpsc::Sender<Completion<K>>,
        request: ReconcileRequest<K>,
    ) {
        slot.busy = true;
        *in_flight += 1;

        let semaphore = self.semaphore.clone();
        let processor = self.processor.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let outcome = processor.process(&request).await;
            let _ = done_tx.send(Completion { request, outcome }).await;
        });
    }

    fn complete(
        &self,
        slots: &mut HashMap<ObjectIdentity, Slot<K>>,
        in_flight: &mut usize,
        done_tx: &mpsc::Sender<Completion<K>>,
        is_leader: bool,
        done: Completion<K>,
    ) {
        *in_flight -= 1;
        let identity = done.request.identity.clone();
        let Some(slot) = slots.get_mut(&identity) else {
            return;
        };
        slot.busy = false;

        match done.outcome {
            ProcessOutcome::Idle => {}
            ProcessOutcome::Requeue { delay, event_type } => {
                self.schedule_redelivery(done.request, delay, event_type);
            }
            ProcessOutcome::Evict => {
                if slot.pending.is_none() {
                    trace!(identity = %identity, "Evicting idle identity slot");
                    slots.remove(&identity);
                    return;
                }
            }
        }

        if let Some(pending) = slot.pending.take() {
            if is_leader {
                self.dispatch(slot, in_flight, done_tx, pending);
            } else {
                // Demoted while busy: keep the event parked for the next
                // promotion.
                slot.pending = Some(pending);
            }
        }
    }

    /// Deliver a synthetic event for the identity's latest known state after
    /// the requested delay, unless shutdown wins first.
    fn schedule_redelivery(
        &self,
        request: ReconcileRequest<K>,
        delay: Duration,
        event_type: EventType,
    ) {
        let Some(object) = request.event.object().cloned() else {
            return;
        };
        let identity = request.identity;
        let tx = self.requeue_tx.clone();
        let cancel = self.cancel.clone();

        debug!(identity = %identity, delay_ms = delay.as_millis(), "Scheduling requeue");
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let request = ReconcileRequest {
                        identity,
                        event: WatchEvent::new(event_type, object),
                    };
                    if tx.send(Incoming::Redelivery(request)).await.is_err() {
                        warn!("Requeue dropped: dispatcher gone");
                    }
                }
            }
        });
    }

    fn flush_parked(
        &self,
        slots: &mut HashMap<ObjectIdentity, Slot<K>>,
        in_flight: &mut usize,
        done_tx: &mpsc::Sender<Completion<K>>,
    ) {
        let parked: Vec<ObjectIdentity> = slots
            .iter()
            .filter(|(_, slot)| !slot.busy && slot.pending.is_some())
            .map(|(id, _)| id.clone())
            .collect();

        if !parked.is_empty() {
            debug!(count = parked.len(), "Dispatching events parked while follower");
        }
        for identity in parked {
            if let Some(slot) = slots.get_mut(&identity) {
                if let Some(request) = slot.pending.take() {
                    self.dispatch(slot, in_flight, done_tx, request);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::resource::ObjectMeta;

    #[derive(Clone, Debug)]
    struct Widget {
        metadata: ObjectMeta,
        revision: u32,
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

    fn request(name: &str, revision: u32) -> ReconcileRequest<Widget> {
        ReconcileRequest::from_event(WatchEvent::Modified(Widget {
            metadata: ObjectMeta::namespaced("default", name),
            revision,
        }))
        .unwrap()
    }

    /// Records every processed request and the peak concurrency observed
    struct Recorder {
        outcomes: Mutex<Vec<ProcessOutcome>>,
        seen: Mutex<Vec<(String, u32)>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        hold: Duration,
    }

    impl Recorder {
        fn new(hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(Vec::new()),
                seen: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                hold,
            })
        }

        fn push_outcome(&self, outcome: ProcessOutcome) {
            self.outcomes.lock().unwrap().push(outcome);
        }
    }

    #[async_trait]
    impl EventProcessor<Widget> for Recorder {
        async fn process(&self, request: &ReconcileRequest<Widget>) -> ProcessOutcome {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(self.hold).await;

            let object = request.event.object().unwrap();
            self.seen
                .lock()
                .unwrap()
                .push((object.meta().name.clone(), object.revision));
            self.active.fetch_sub(1, Ordering::SeqCst);

            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                ProcessOutcome::Idle
            } else {
                outcomes.remove(0)
            }
        }
    }

    async fn settle() {
        // Under paused time this advances past all pending sleeps.
        tokio::time::sleep(Duration::from_secs(60)).await;
    }

    /// Single-flight: concurrent events for one identity never overlap
    #[tokio::test(start_paused = true)]
    async fn test_single_flight_per_identity() {
        let recorder = Recorder::new(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let (queue, handle) = WorkQueue::<Widget>::spawn(
            recorder.clone(),
            QueueConfig::default(),
            false,
            cancel.clone(),
        );

        for revision in 1..=5 {
            assert!(queue.enqueue(request("alpha", revision)).await);
        }
        settle().await;

        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
        let seen = recorder.seen.lock().unwrap().clone();
        // First event ran immediately; intermediate ones coalesced into the
        // latest (latest-wins), so the last processed revision is 5.
        assert_eq!(seen.first().unwrap().1, 1);
        assert_eq!(seen.last().unwrap().1, 5);
        assert!(seen.len() <= 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    /// Distinct identities reconcile in parallel, bounded by the pool
    #[tokio::test(start_paused = true)]
    async fn test_distinct_identities_run_concurrently() {
        let recorder = Recorder::new(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let config = QueueConfig {
            max_concurrent: 3,
            capacity: 64,
        };
        let (queue, handle) = WorkQueue::<Widget>::spawn(recorder.clone(), config, false, cancel.clone());

        for i in 0..6 {
            assert!(queue.enqueue(request(&format!("w{i}"), 1)).await);
        }
        settle().await;

        assert_eq!(recorder.seen.lock().unwrap().len(), 6);
        let max = recorder.max_active.load(Ordering::SeqCst);
        assert!(max > 1, "expected parallelism, got {max}");
        assert!(max <= 3, "worker pool bound exceeded: {max}");

        cancel.cancel();
        handle.await.unwrap();
    }

    /// Requeue re-delivers the latest known state after the delay
    #[tokio::test(start_paused = true)]
    async fn test_requeue_redelivers_after_delay() {
        let recorder = Recorder::new(Duration::from_millis(1));
        recorder.push_outcome(ProcessOutcome::Requeue {
            delay: Duration::from_secs(2),
            event_type: EventType::Modified,
        });
        let cancel = CancellationToken::new();
        let (queue, handle) = WorkQueue::<Widget>::spawn(
            recorder.clone(),
            QueueConfig::default(),
            false,
            cancel.clone(),
        );

        assert!(queue.enqueue(request("alpha", 1)).await);
        settle().await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2, "expected initial run plus one re-delivery");

        cancel.cancel();
        handle.await.unwrap();
    }

    /// Eviction drops the slot; a later event recreates it
    #[tokio::test(start_paused = true)]
    async fn test_evict_then_recreate() {
        let recorder = Recorder::new(Duration::from_millis(1));
        recorder.push_outcome(ProcessOutcome::Evict);
        let cancel = CancellationToken::new();
        let (queue, handle) = WorkQueue::<Widget>::spawn(
            recorder.clone(),
            QueueConfig::default(),
            false,
            cancel.clone(),
        );

        assert!(queue.enqueue(request("alpha", 1)).await);
        settle().await;
        assert!(queue.enqueue(request("alpha", 2)).await);
        settle().await;

        assert_eq!(recorder.seen.lock().unwrap().len(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    /// Follower parks events; promotion flushes them
    #[tokio::test(start_paused = true)]
    async fn test_leader_gating_parks_until_promotion() {
        let recorder = Recorder::new(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let (queue, handle) = WorkQueue::<Widget>::spawn(
            recorder.clone(),
            QueueConfig::default(),
            true,
            cancel.clone(),
        );

        assert!(queue.enqueue(request("alpha", 1)).await);
        assert!(queue.enqueue(request("beta", 1)).await);
        settle().await;
        assert!(
            recorder.seen.lock().unwrap().is_empty(),
            "no dispatch while follower"
        );

        assert!(queue.set_leading(true).await);
        settle().await;

        let mut names: Vec<String> = recorder
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
