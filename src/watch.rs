//! Resilient watch streams
//!
//! A [`WatchSource`] turns the raw, fallible watch stream of a
//! [`ClusterClient`] into an infinite sequence of object-bearing
//! [`WatchEvent`]s:
//!
//! - stream open failures and mid-stream disconnects reconnect from the last
//!   observed resource version after a jittered backoff,
//! - a 410 Gone (expired watch window) triggers exactly one full relist,
//!   emitting synthetic `Added` events for every listed object before the
//!   watch resumes from the fresh version,
//! - bookmarks advance the stored resource version and are absorbed,
//! - cancellation closes the underlying stream and ends the sequence.
//!
//! Errors never propagate downstream; the reconciliation engine only ever
//! sees object-bearing events.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::{stream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::{ClusterClient, ListParams, WatchStream};
use crate::resource::{Resource, WatchEvent};
use crate::retry::{Backoff, RetryConfig};

/// A restartable watch over one resource type/namespace/selector
pub struct WatchSource<K: Resource> {
    client: Arc<dyn ClusterClient<K>>,
    params: ListParams,
    retry: RetryConfig,
    initial_resource_version: Option<String>,
}

impl<K: Resource> WatchSource<K> {
    /// Watch the objects matching `params` on the given transport
    pub fn new(client: Arc<dyn ClusterClient<K>>, params: ListParams) -> Self {
        Self {
            client,
            params,
            retry: RetryConfig::default(),
            initial_resource_version: None,
        }
    }

    /// Override the reconnect backoff
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Resume from a known resource version instead of an initial list
    pub fn starting_at(mut self, resource_version: impl Into<String>) -> Self {
        self.initial_resource_version = Some(resource_version.into());
        self
    }

    /// The infinite event sequence; ends only when `cancel` fires
    pub fn stream(self, cancel: CancellationToken) -> impl Stream<Item = WatchEvent<K>> + Send {
        let fsm = match self.initial_resource_version {
            Some(resource_version) => State::InitListed { resource_version },
            None => State::Empty,
        };
        let ctx = StreamCtx {
            client: self.client,
            params: self.params,
            backoff: Backoff::new(&self.retry),
            cancel,
            fsm,
            pending: VecDeque::new(),
        };

        stream::unfold(ctx, |mut ctx| async move {
            loop {
                if let Some(event) = ctx.pending.pop_front() {
                    return Some((event, ctx));
                }
                if ctx.cancel.is_cancelled() {
                    return None;
                }
                if !ctx.advance().await {
                    return None;
                }
            }
        })
    }
}

/// The finite state machine driving one watch
enum State<K: Resource> {
    /// Next step performs a full list to (re)build the view
    Empty,
    /// A list succeeded; next step opens the watch from its version
    InitListed {
        /// Version to watch from
        resource_version: String,
    },
    /// Watch in progress; events flow until error/close
    Watching {
        /// Last version observed on the stream
        resource_version: String,
        /// The open server stream
        stream: WatchStream<K>,
    },
}

struct StreamCtx<K: Resource> {
    client: Arc<dyn ClusterClient<K>>,
    params: ListParams,
    backoff: Backoff,
    cancel: CancellationToken,
    fsm: State<K>,
    pending: VecDeque<WatchEvent<K>>,
}

impl<K: Resource> StreamCtx<K> {
    /// Advance the state machine one step; `false` means cancelled
    async fn advance(&mut self) -> bool {
        match std::mem::replace(&mut self.fsm, State::Empty) {
            State::Empty => match run_cancellable(&self.cancel, self.client.list(&self.params)).await
            {
                None => false,
                Some(Ok(list)) => {
                    self.backoff.reset();
                    debug!(
                        count = list.items.len(),
                        resource_version = %list.resource_version,
                        "Listed resources, emitting synthetic add events"
                    );
                    self.pending
                        .extend(list.items.into_iter().map(WatchEvent::Added));
                    self.fsm = State::InitListed {
                        resource_version: list.resource_version,
                    };
                    true
                }
                Some(Err(e)) => {
                    warn!(error = %e, "List failed, backing off before retry");
                    self.fsm = State::Empty;
                    self.pause().await
                }
            },
            State::InitListed { resource_version } => {
                match run_cancellable(
                    &self.cancel,
                    self.client.watch(&self.params, &resource_version),
                )
                .await
                {
                    None => false,
                    Some(Ok(stream)) => {
                        self.fsm = State::Watching {
                            resource_version,
                            stream,
                        };
                        true
                    }
                    Some(Err(e)) if e.is_gone() => {
                        warn!(error = %e, "Watch window expired at open, relisting");
                        self.fsm = State::Empty;
                        true
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Watch open failed, backing off before retry");
                        self.fsm = State::InitListed { resource_version };
                        self.pause().await
                    }
                }
            }
            State::Watching {
                resource_version,
                mut stream,
            } => match run_cancellable(&self.cancel, stream.next()).await {
                None => false,
                Some(Some(Ok(event))) => match event {
                    WatchEvent::Bookmark { resource_version } => {
                        self.backoff.reset();
                        self.fsm = State::Watching {
                            resource_version,
                            stream,
                        };
                        true
                    }
                    WatchEvent::Error(status) if status.code == 410 => {
                        warn!(status = %status, "Watch window expired mid-stream, relisting");
                        self.fsm = State::Empty;
                        true
                    }
                    WatchEvent::Error(status) => {
                        warn!(status = %status, "Server reported watch error, continuing");
                        self.fsm = State::Watching {
                            resource_version,
                            stream,
                        };
                        true
                    }
                    event => {
                        self.backoff.reset();
                        let resource_version = event
                            .resource_version()
                            .map(str::to_string)
                            .unwrap_or(resource_version);
                        self.pending.push_back(event);
                        self.fsm = State::Watching {
                            resource_version,
                            stream,
                        };
                        true
                    }
                },
                Some(Some(Err(e))) if e.is_gone() => {
                    warn!(error = %e, "Watch window expired, relisting");
                    self.fsm = State::Empty;
                    true
                }
                Some(Some(Err(e))) => {
                    warn!(error = %e, "Watch stream failed, reconnecting");
                    self.fsm = State::InitListed { resource_version };
                    self.pause().await
                }
                Some(None) => {
                    debug!("Watch stream closed by server, reconnecting");
                    self.fsm = State::InitListed { resource_version };
                    self.pause().await
                }
            },
        }
    }

    /// Sleep the next backoff delay; `false` means cancelled
    async fn pause(&mut self) -> bool {
        let delay = self.backoff.next_delay();
        run_cancellable(&self.cancel, tokio::time::sleep(delay))
            .await
            .is_some()
    }
}

/// Race a future against cancellation; `None` means cancelled
async fn run_cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        value = fut => Some(value),
    }
}
