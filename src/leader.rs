//! Lease-based leader election
//!
//! Gates which process instance in a fleet actively reconciles. The elector
//! runs a `Follower -> Candidate -> Leader` loop over an abstract lease
//! primitive ([`LeaseClient`]) that provides compare-and-swap semantics via
//! resource versions: if the lease changed between read and write the update
//! fails with a conflict and the attempt is retried.
//!
//! Elections are at-least-once, not exactly-once: during a handover two
//! instances may briefly both believe they lead. Reconcile logic must stay
//! idempotent under that overlap; there is no fencing token.
//!
//! State transitions are published on a `tokio::sync::watch` channel. The
//! runtime consumes it to gate dispatch and to fire the controller's
//! promotion/demotion/new-leader callbacks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::ClientError;

/// Whether this instance currently leads, and who does
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderState {
    /// True while this instance holds the lease
    pub is_leader: bool,
    /// Identity of the current holder, if known
    pub leader_identity: Option<String>,
}

impl LeaderState {
    /// Following with no known holder
    pub fn follower() -> Self {
        Self {
            is_leader: false,
            leader_identity: None,
        }
    }

    /// Following a known holder
    pub fn following(holder: impl Into<String>) -> Self {
        Self {
            is_leader: false,
            leader_identity: Some(holder.into()),
        }
    }

    /// Leading under the given identity
    pub fn leading(identity: impl Into<String>) -> Self {
        Self {
            is_leader: true,
            leader_identity: Some(identity.into()),
        }
    }
}

/// One lease record as stored in the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Lease name
    pub name: String,
    /// Current holder identity; `None` after a clean release
    pub holder_identity: Option<String>,
    /// Seconds a renewal is valid for
    pub lease_duration_seconds: u64,
    /// When the current holder first acquired the lease
    pub acquire_time: Option<DateTime<Utc>>,
    /// Last successful renewal
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of ownership changes so far
    pub transitions: u32,
    /// Version token for compare-and-swap updates
    pub resource_version: Option<String>,
}

/// Atomic read-modify-write access to one lease object
///
/// `update` must compare the record's `resource_version` against the stored
/// one and fail with [`ClientError::conflict`] when they differ; `create`
/// must fail with a conflict when the lease already exists. The elector's
/// correctness depends on those semantics.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Fetch the lease, `None` if it does not exist yet
    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>, ClientError>;

    /// Create the lease (first leader)
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, ClientError>;

    /// Update the lease, CAS on `resource_version`
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, ClientError>;
}

/// Timing and identity for one elector
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// Lease object name shared by the fleet
    pub lease_name: String,
    /// This instance's identity (typically the pod name)
    pub identity: String,
    /// How long a renewal remains valid
    pub lease_duration: Duration,
    /// Interval between renewals while leading
    pub renew_interval: Duration,
    /// Interval between acquisition attempts while following
    pub retry_interval: Duration,
}

impl LeaderElectionConfig {
    /// Default timing (30s lease, 10s renew, 5s retry)
    pub fn new(lease_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            lease_name: lease_name.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Outcome of one acquisition/renewal attempt
enum AcquireState {
    /// We hold the lease
    Acquired,
    /// Someone else holds an unexpired lease
    Held { holder: Option<String> },
}

/// Why the leading phase ended
enum LeadEnd {
    Cancelled,
    Lost,
}

/// Leader elector over an abstract lease
///
/// Run [`run`](Self::run) as a task; observe state through the watch channel
/// returned by [`new`](Self::new). On clean shutdown while leading, the
/// lease holder is cleared and the renew time backdated so a standby can
/// take over without waiting out the lease.
pub struct LeaderElector {
    client: Arc<dyn LeaseClient>,
    config: LeaderElectionConfig,
    tx: watch::Sender<LeaderState>,
}

impl LeaderElector {
    /// Create an elector and the channel its state is published on
    pub fn new(
        client: Arc<dyn LeaseClient>,
        config: LeaderElectionConfig,
    ) -> (Self, watch::Receiver<LeaderState>) {
        let (tx, rx) = watch::channel(LeaderState::follower());
        (Self { client, config, tx }, rx)
    }

    /// Drive the election until the token is cancelled
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            identity = %self.config.identity,
            lease = %self.config.lease_name,
            "Leader election started, waiting for leadership"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.try_acquire_or_renew().await {
                Ok(AcquireState::Acquired) => {
                    info!(identity = %self.config.identity, "Leadership acquired");
                    self.tx
                        .send_replace(LeaderState::leading(self.config.identity.clone()));

                    let end = self.lead(&cancel).await;
                    self.tx.send_replace(LeaderState::follower());

                    if matches!(end, LeadEnd::Cancelled) {
                        self.release_lease().await;
                        break;
                    }
                }
                Ok(AcquireState::Held { holder }) => {
                    debug!(
                        identity = %self.config.identity,
                        holder = holder.as_deref().unwrap_or("<unknown>"),
                        "Lease held by another instance"
                    );
                    if let Some(holder) = holder {
                        self.tx.send_if_modified(|state| {
                            if state.leader_identity.as_deref() != Some(holder.as_str()) {
                                *state = LeaderState::following(holder.clone());
                                true
                            } else {
                                false
                            }
                        });
                    }
                }
                Err(e) => {
                    // Transient: keep campaigning
                    warn!(identity = %self.config.identity, error = %e, "Lease acquisition attempt failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }

        info!(identity = %self.config.identity, "Leader election stopped");
    }

    /// Renewal loop while we hold the lease
    async fn lead(&self, cancel: &CancellationToken) -> LeadEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LeadEnd::Cancelled,
                _ = tokio::time::sleep(self.config.renew_interval) => {}
            }

            match self.try_acquire_or_renew().await {
                Ok(AcquireState::Acquired) => {
                    debug!(identity = %self.config.identity, "Lease renewed");
                }
                Ok(AcquireState::Held { .. }) => {
                    warn!(identity = %self.config.identity, "Lease renewal conflict, leadership lost");
                    return LeadEnd::Lost;
                }
                Err(e) => {
                    // Renewal failure demotes immediately: another instance
                    // may already be campaigning.
                    warn!(identity = %self.config.identity, error = %e, "Lease renewal failed, leadership lost");
                    return LeadEnd::Lost;
                }
            }
        }
    }

    /// One atomic acquire-or-renew attempt
    async fn try_acquire_or_renew(&self) -> Result<AcquireState, ClientError> {
        let now = Utc::now();

        let Some(lease) = self.client.get(&self.config.lease_name).await? else {
            // No lease yet: create it (first leader)
            let record = LeaseRecord {
                name: self.config.lease_name.clone(),
                holder_identity: Some(self.config.identity.clone()),
                lease_duration_seconds: self.config.lease_duration.as_secs(),
                acquire_time: Some(now),
                renew_time: Some(now),
                transitions: 0,
                resource_version: None,
            };
            return match self.client.create(&record).await {
                Ok(_) => {
                    info!(identity = %self.config.identity, "Created new lease");
                    Ok(AcquireState::Acquired)
                }
                Err(e) if e.is_conflict() => Ok(AcquireState::Held { holder: None }),
                Err(e) => Err(e),
            };
        };

        if lease.holder_identity.as_deref() == Some(self.config.identity.as_str()) {
            // We already hold it: renew against the observed version
            let mut renewed = lease;
            renewed.renew_time = Some(now);
            return match self.client.update(&renewed).await {
                Ok(_) => Ok(AcquireState::Acquired),
                Err(e) if e.is_conflict() => Ok(AcquireState::Held { holder: None }),
                Err(e) => Err(e),
            };
        }

        if lease_expired(&lease, now) {
            let record = LeaseRecord {
                name: self.config.lease_name.clone(),
                holder_identity: Some(self.config.identity.clone()),
                lease_duration_seconds: self.config.lease_duration.as_secs(),
                acquire_time: Some(now),
                renew_time: Some(now),
                transitions: lease.transitions + 1,
                resource_version: lease.resource_version.clone(),
            };
            return match self.client.update(&record).await {
                Ok(_) => {
                    info!(
                        identity = %self.config.identity,
                        transitions = record.transitions,
                        "Took over expired lease"
                    );
                    Ok(AcquireState::Acquired)
                }
                Err(e) if e.is_conflict() => Ok(AcquireState::Held {
                    holder: lease.holder_identity,
                }),
                Err(e) => Err(e),
            };
        }

        Ok(AcquireState::Held {
            holder: lease.holder_identity,
        })
    }

    /// Clear the holder on clean shutdown so a standby can take over
    /// immediately instead of waiting for expiry
    async fn release_lease(&self) {
        let result: Result<(), ClientError> = async {
            let Some(lease) = self.client.get(&self.config.lease_name).await? else {
                return Ok(());
            };
            if lease.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
                return Ok(());
            }

            let mut released = lease;
            released.holder_identity = None;
            released.renew_time = Some(Utc::now() - chrono::Duration::seconds(60));
            self.client.update(&released).await.map(|_| ())
        }
        .await;

        match result {
            Ok(()) => info!(identity = %self.config.identity, "Lease released for fast failover"),
            Err(e) => {
                warn!(identity = %self.config.identity, error = %e, "Failed to release lease on shutdown")
            }
        }
    }
}

fn lease_expired(lease: &LeaseRecord, now: DateTime<Utc>) -> bool {
    match lease.renew_time {
        Some(renewed) => {
            now > renewed + chrono::Duration::seconds(lease.lease_duration_seconds as i64)
        }
        None => true,
    }
}
