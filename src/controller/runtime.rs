//! Controller runtime: watch -> queue -> engine composition
//!
//! [`ControllerRuntime`] is the piece a developer actually runs. It wires a
//! [`WatchSource`] into the single-flight [`WorkQueue`], plugs the
//! reconciliation engine in as the queue's processor, owns the finalizer
//! registrations, and (when configured) spawns the leader elector, gating
//! dispatch on promotion and firing the controller's leadership callbacks.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::{ClusterClient, ListParams};
use crate::controller::engine::Engine;
use crate::controller::{ControllerConfig, ResourceController};
use crate::finalizer::{Finalizer, FinalizerManager};
use crate::leader::{LeaderElectionConfig, LeaderElector, LeaderState, LeaseClient};
use crate::queue::{EventProcessor, QueueConfig, ReconcileRequest, WorkQueue};
use crate::resource::{Resource, WatchEvent};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::watch::WatchSource;

/// Builder for a [`ControllerRuntime`]
pub struct ControllerRuntimeBuilder<K: Resource, C: ResourceController<K>> {
    client: Arc<dyn ClusterClient<K>>,
    controller: Arc<C>,
    config: ControllerConfig,
    params: ListParams,
    finalizers: Vec<Arc<dyn Finalizer<K>>>,
    leader: Option<(Arc<dyn LeaseClient>, LeaderElectionConfig)>,
}

impl<K: Resource, C: ResourceController<K>> ControllerRuntimeBuilder<K, C> {
    /// Tune concurrency, queue capacity, and watch backoff
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Restrict the watch by namespace and selectors
    pub fn params(mut self, params: ListParams) -> Self {
        self.params = params;
        self
    }

    /// Register a finalizer; registration order is cleanup order
    pub fn finalizer(mut self, finalizer: Arc<dyn Finalizer<K>>) -> Self {
        self.finalizers.push(finalizer);
        self
    }

    /// Gate reconciliation behind lease-based leader election
    pub fn leader_election(
        mut self,
        lease_client: Arc<dyn LeaseClient>,
        config: LeaderElectionConfig,
    ) -> Self {
        self.leader = Some((lease_client, config));
        self
    }

    /// Finish the builder
    pub fn build(self) -> ControllerRuntime<K, C> {
        ControllerRuntime {
            client: self.client,
            controller: self.controller,
            config: self.config,
            params: self.params,
            finalizers: self.finalizers,
            leader: self.leader,
        }
    }
}

/// A running controller for one resource type
pub struct ControllerRuntime<K: Resource, C: ResourceController<K>> {
    client: Arc<dyn ClusterClient<K>>,
    controller: Arc<C>,
    config: ControllerConfig,
    params: ListParams,
    finalizers: Vec<Arc<dyn Finalizer<K>>>,
    leader: Option<(Arc<dyn LeaseClient>, LeaderElectionConfig)>,
}

impl<K: Resource, C: ResourceController<K>> ControllerRuntime<K, C> {
    /// Start building a runtime for `controller` over `client`
    pub fn builder(
        client: Arc<dyn ClusterClient<K>>,
        controller: C,
    ) -> ControllerRuntimeBuilder<K, C> {
        ControllerRuntimeBuilder {
            client,
            controller: Arc::new(controller),
            config: ControllerConfig::default(),
            params: ListParams::default(),
            finalizers: Vec::new(),
            leader: None,
        }
    }

    /// Drive the controller until the token is cancelled
    ///
    /// Consumes the runtime; returns once the watch has closed, in-flight
    /// reconciliations have drained, and (if leading) the lease is released.
    pub async fn run(self, cancel: CancellationToken) -> crate::Result<()> {
        let mut manager = FinalizerManager::new(self.client.clone());
        for finalizer in self.finalizers {
            manager.register(finalizer);
        }
        let engine: Arc<dyn EventProcessor<K>> =
            Arc::new(Engine::new(self.controller.clone(), Arc::new(manager)));

        let mut elector_handle = None;
        let leadership = match self.leader {
            Some((lease_client, leader_config)) => {
                let (elector, state_rx) = LeaderElector::new(lease_client, leader_config);
                elector_handle = Some(tokio::spawn(elector.run(cancel.clone())));
                Some(state_rx)
            }
            None => None,
        };

        let queue_config = QueueConfig {
            max_concurrent: self.config.max_concurrent_reconciles,
            capacity: self.config.queue_capacity,
        };
        // With leader election the queue starts gated: events park until the
        // observer opens dispatch after `on_promotion`.
        let (queue, queue_handle) =
            WorkQueue::spawn(engine, queue_config, leadership.is_some(), cancel.clone());

        let observer_handle = leadership.map(|state_rx| {
            tokio::spawn(observe_leadership(
                state_rx,
                self.controller.clone(),
                self.client.clone(),
                self.params.clone(),
                self.config.watch_retry.clone(),
                queue.clone(),
                cancel.clone(),
            ))
        });

        info!(kind = K::kind(), "Controller started");
        let source = WatchSource::new(self.client.clone(), self.params.clone())
            .with_retry(self.config.watch_retry.clone());
        let stream = source.stream(cancel.clone());
        tokio::pin!(stream);

        while let Some(event) = stream.next().await {
            if let Some(request) = ReconcileRequest::from_event(event) {
                if !queue.enqueue(request).await {
                    break;
                }
            }
        }

        // The watch only ends on cancellation; drain the rest of the stack.
        debug!(kind = K::kind(), "Watch closed, shutting down controller");
        let _ = queue_handle.await;
        if let Some(handle) = observer_handle {
            let _ = handle.await;
        }
        if let Some(handle) = elector_handle {
            let _ = handle.await;
        }
        info!(kind = K::kind(), "Controller stopped");
        Ok(())
    }
}

/// Fire leadership callbacks and run the catch-up pass on promotion
///
/// While this instance is a follower, watch events park in the queue. On
/// promotion the full relist re-delivers every currently-listed object so
/// state missed while following is reconciled.
async fn observe_leadership<K: Resource, C: ResourceController<K>>(
    mut state_rx: watch::Receiver<LeaderState>,
    controller: Arc<C>,
    client: Arc<dyn ClusterClient<K>>,
    params: ListParams,
    retry: RetryConfig,
    queue: WorkQueue<K>,
    cancel: CancellationToken,
) {
    let mut was_leader = state_rx.borrow().is_leader;
    let mut last_holder = state_rx.borrow().leader_identity.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let state = state_rx.borrow().clone();

        if state.leader_identity != last_holder {
            if let Some(holder) = &state.leader_identity {
                controller.on_new_leader(holder).await;
            }
            last_holder = state.leader_identity.clone();
        }

        if state.is_leader && !was_leader {
            info!(kind = K::kind(), "Promoted to leader, starting catch-up pass");
            // Callback strictly before any parked event reaches user code.
            controller.on_promotion().await;
            queue.set_leading(true).await;
            catch_up(&client, &params, &retry, &queue).await;
        } else if !state.is_leader && was_leader {
            info!(kind = K::kind(), "Demoted from leader, holding new events");
            queue.set_leading(false).await;
            controller.on_demotion().await;
        }
        was_leader = state.is_leader;
    }
}

/// Relist everything and enqueue synthetic add events
async fn catch_up<K: Resource>(
    client: &Arc<dyn ClusterClient<K>>,
    params: &ListParams,
    retry: &RetryConfig,
    queue: &WorkQueue<K>,
) {
    let bounded = RetryConfig {
        max_attempts: 5,
        ..retry.clone()
    };
    let list = match retry_with_backoff(&bounded, "promotion_relist", || client.list(params)).await
    {
        Ok(list) => list,
        Err(e) => {
            // The regular watch keeps flowing, so missed state still turns
            // up; the catch-up is best-effort.
            error!(error = %e, "Catch-up list failed after promotion");
            return;
        }
    };

    debug!(count = list.items.len(), "Enqueueing catch-up reconcile pass");
    for item in list.items {
        if let Some(request) = ReconcileRequest::from_event(WatchEvent::Added(item)) {
            if !queue.enqueue(request).await {
                return;
            }
        }
    }
}
