//! Lease-based leader election
//!
//! A periodic tick drives a two-state machine against a single lease record
//! stored in the control plane. Correctness rests on the store's
//! conditional-update semantics, not on any local consensus: this is
//! best-effort mutual exclusion, and brief dual leadership during a handover
//! is possible, so reconcile logic must stay idempotent.

use crate::client::{ClientError, LeaseClient, LeaseRecord};
use chrono::Utc;
use rand::Rng;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

/// Spread applied to candidate retry delays to avoid synchronized takeover
/// attempts across replicas.
const JITTER_FACTOR: f64 = 1.2;

/// Whether this replica may act on watch events
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaderState {
    /// Not currently holding the lease; all dispatch is suspended
    Candidate,
    /// Confirmed holder of the lease as of the latest tick
    Leader,
}

impl LeaderState {
    #[must_use]
    pub fn is_leader(self) -> bool {
        matches!(self, LeaderState::Leader)
    }
}

#[derive(Debug, Error)]
#[error("invalid leader election config: {0}")]
pub struct InvalidConfig(String);

/// Validated leader-election settings
#[derive(Clone, Debug)]
pub struct ElectionConfig {
    /// Name of the lease record shared by all replicas of this operator
    pub lease_name: String,
    /// This process instance's identity, typically the pod name
    pub identity: String,
    /// How long a lease stays valid without renewal before candidates may
    /// take it over
    pub lease_duration: Duration,
    /// Interval between election ticks (renewals for the holder, probes for
    /// candidates)
    pub retry_period: Duration,
}

impl ElectionConfig {
    /// Config with the conventional 15s lease / 2s retry defaults
    #[must_use]
    pub fn new(lease_name: &str, identity: &str) -> Self {
        Self {
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(15),
            retry_period: Duration::from_secs(2),
        }
    }

    pub fn validate(self) -> Result<Self, InvalidConfig> {
        if self.lease_name.is_empty() {
            return Err(InvalidConfig("lease_name may not be empty".into()));
        }
        if self.identity.is_empty() {
            return Err(InvalidConfig("identity may not be empty".into()));
        }
        if self.retry_period < Duration::from_secs(1) {
            return Err(InvalidConfig("retry_period must be at least 1 second".into()));
        }
        if self.lease_duration <= self.retry_period {
            return Err(InvalidConfig(
                "lease_duration must be greater than retry_period".into(),
            ));
        }
        Ok(self)
    }
}

/// The election task: tick, publish state, repeat until shut down
pub struct Elector {
    client: Arc<dyn LeaseClient>,
    config: ElectionConfig,
    state: LeaderState,
    state_tx: watch::Sender<LeaderState>,
    shutdown: oneshot::Receiver<()>,
}

impl Elector {
    /// Spawn the election task onto the runtime
    #[must_use = "the handle is the only way to observe state or shut the elector down"]
    pub fn spawn(config: ElectionConfig, client: Arc<dyn LeaseClient>) -> ElectorHandle {
        let (state_tx, state_rx) = watch::channel(LeaderState::Candidate);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let elector = Elector {
            client,
            config,
            state: LeaderState::Candidate,
            state_tx,
            shutdown: shutdown_rx,
        };
        let handle = tokio::spawn(elector.run());
        ElectorHandle {
            shutdown: shutdown_tx,
            state: state_rx,
            handle,
        }
    }

    async fn run(mut self) {
        tracing::info!(
            lease = %self.config.lease_name,
            identity = %self.config.identity,
            "leader elector started"
        );
        loop {
            self.tick().await;
            let delay = self.next_tick_delay();
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = &mut self.shutdown => break,
            }
        }
        if self.state.is_leader() {
            self.release().await;
        }
        tracing::info!(lease = %self.config.lease_name, "leader elector stopped");
    }

    /// One election round: get the lease, then create, renew, or claim it.
    ///
    /// Conflicts mean another replica won a race and demote silently. Any
    /// other failure leaves the current state untouched so a transient outage
    /// cannot flap leadership.
    #[tracing::instrument(level = "debug", skip_all, fields(lease = %self.config.lease_name))]
    async fn tick(&mut self) {
        match self.client.get(&self.config.lease_name).await {
            Ok(None) => {
                let record = self.fresh_record();
                match self.client.create(&record).await {
                    Ok(_) => self.promote("created the lease"),
                    Err(err) if err.is_conflict() => {
                        self.demote("another candidate created the lease first");
                    }
                    Err(err) => self.freeze(&err),
                }
            }
            Ok(Some(record)) => {
                let held_by_self =
                    record.holder_identity.as_deref() == Some(self.config.identity.as_str());
                if held_by_self {
                    match self.client.update(&self.renewed(record)).await {
                        Ok(_) => self.promote("renewed the lease"),
                        Err(err) if err.is_conflict() => self.demote("lost the lease to a renewal race"),
                        Err(err) => self.freeze(&err),
                    }
                } else if lease_expired(&record) {
                    match self.client.update(&self.claimed(record)).await {
                        Ok(_) => self.promote("took over an expired lease"),
                        Err(err) if err.is_conflict() => {
                            self.demote("another candidate claimed the expired lease first");
                        }
                        Err(err) => self.freeze(&err),
                    }
                } else {
                    self.demote("lease held by another replica");
                }
            }
            Err(err) => self.freeze(&err),
        }
    }

    fn fresh_record(&self) -> LeaseRecord {
        LeaseRecord {
            name: self.config.lease_name.clone(),
            holder_identity: Some(self.config.identity.clone()),
            renew_time: Some(Utc::now()),
            lease_duration_seconds: self.config.lease_duration.as_secs(),
            lease_transitions: 0,
            resource_version: String::new(),
        }
    }

    fn renewed(&self, mut record: LeaseRecord) -> LeaseRecord {
        record.renew_time = Some(Utc::now());
        record.lease_duration_seconds = self.config.lease_duration.as_secs();
        record
    }

    fn claimed(&self, record: LeaseRecord) -> LeaseRecord {
        let mut claimed = self.renewed(record);
        claimed.holder_identity = Some(self.config.identity.clone());
        claimed.lease_transitions += 1;
        claimed
    }

    fn promote(&mut self, reason: &str) {
        if self.state != LeaderState::Leader {
            tracing::info!(identity = %self.config.identity, reason, "became leader");
        }
        self.set_state(LeaderState::Leader);
    }

    fn demote(&mut self, reason: &str) {
        if self.state == LeaderState::Leader {
            tracing::warn!(identity = %self.config.identity, reason, "lost leadership");
        } else {
            tracing::debug!(reason, "remaining candidate");
        }
        self.set_state(LeaderState::Candidate);
    }

    /// An ambiguous failure: log it and keep the current state
    fn freeze(&self, err: &ClientError) {
        tracing::warn!(error = %err, state = ?self.state, "election tick failed, keeping current state");
    }

    fn set_state(&mut self, state: LeaderState) {
        self.state = state;
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn next_tick_delay(&self) -> Duration {
        if self.state.is_leader() {
            self.config.retry_period
        } else {
            let jitter: f64 = rand::rng().random_range(1.0..JITTER_FACTOR);
            self.config.retry_period.mul_f64(jitter)
        }
    }

    /// Best-effort hand-back so other replicas do not have to wait out the
    /// lease duration after a clean shutdown
    async fn release(&self) {
        let released = match self.client.get(&self.config.lease_name).await {
            Ok(Some(record))
                if record.holder_identity.as_deref() == Some(self.config.identity.as_str()) =>
            {
                let mut record = record;
                record.holder_identity = None;
                record.renew_time = None;
                record.lease_transitions += 1;
                self.client.update(&record).await.map(|_| ())
            }
            Ok(_) => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = released {
            tracing::debug!(error = %err, "failed to release lease on shutdown");
        }
    }
}

fn lease_expired(record: &LeaseRecord) -> bool {
    let valid_for = chrono::Duration::seconds(record.lease_duration_seconds as i64);
    record
        .renew_time
        .map_or(true, |renewed| renewed + valid_for < Utc::now())
}

/// Handle to a spawned [`Elector`]
pub struct ElectorHandle {
    shutdown: oneshot::Sender<()>,
    state: watch::Receiver<LeaderState>,
    handle: JoinHandle<()>,
}

impl ElectorHandle {
    /// A handle that is permanently `Leader`, for deployments that disable
    /// leader election and run every replica as the sole leader.
    #[must_use]
    pub fn always_leader() -> Self {
        let (state_tx, state_rx) = watch::channel(LeaderState::Leader);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _keep_open = state_tx;
            let _ = shutdown_rx.await;
        });
        Self {
            shutdown: shutdown_tx,
            state: state_rx,
            handle,
        }
    }

    /// A receiver that always reflects the latest observed state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_leader()
    }

    /// Stop the election task, releasing the lease if currently held
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::{lease_expired, ElectionConfig, Elector, ElectorHandle, LeaderState};
    use crate::client::{ClientError, LeaseClient, LeaseRecord};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::{sync::Arc, time::Duration};
    use tokio::sync::{oneshot, watch};

    /// Lease store with real conditional-update semantics
    #[derive(Default)]
    struct MemLeases {
        record: Mutex<Option<LeaseRecord>>,
        fail_next: Mutex<Option<ClientError>>,
        fail_update_next: Mutex<Option<ClientError>>,
    }

    impl MemLeases {
        fn set(&self, record: LeaseRecord) {
            *self.record.lock() = Some(record);
        }

        fn fail_next(&self, err: ClientError) {
            *self.fail_next.lock() = Some(err);
        }

        fn fail_update_next(&self, err: ClientError) {
            *self.fail_update_next.lock() = Some(err);
        }

        fn holder(&self) -> Option<String> {
            self.record.lock().as_ref().and_then(|r| r.holder_identity.clone())
        }
    }

    #[async_trait]
    impl LeaseClient for MemLeases {
        async fn get(&self, _name: &str) -> Result<Option<LeaseRecord>, ClientError> {
            if let Some(err) = self.fail_next.lock().take() {
                return Err(err);
            }
            Ok(self.record.lock().clone())
        }

        async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, ClientError> {
            let mut stored = self.record.lock();
            if stored.is_some() {
                return Err(ClientError::Conflict("lease already exists".into()));
            }
            let mut created = record.clone();
            created.resource_version = "1".into();
            *stored = Some(created.clone());
            Ok(created)
        }

        async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, ClientError> {
            if let Some(err) = self.fail_update_next.lock().take() {
                return Err(err);
            }
            let mut stored = self.record.lock();
            let current = stored
                .as_ref()
                .ok_or_else(|| ClientError::Conflict("lease does not exist".into()))?;
            if current.resource_version != record.resource_version {
                return Err(ClientError::Conflict("lease revision changed".into()));
            }
            let mut updated = record.clone();
            let revision: u64 = current.resource_version.parse().unwrap_or(0);
            updated.resource_version = (revision + 1).to_string();
            *stored = Some(updated.clone());
            Ok(updated)
        }
    }

    fn elector(
        client: Arc<MemLeases>,
    ) -> (Elector, watch::Receiver<LeaderState>, oneshot::Sender<()>) {
        let (state_tx, state_rx) = watch::channel(LeaderState::Candidate);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let elector = Elector {
            client,
            config: ElectionConfig::new("operator-lock", "replica-a"),
            state: LeaderState::Candidate,
            state_tx,
            shutdown: shutdown_rx,
        };
        (elector, state_rx, shutdown_tx)
    }

    fn held_by(identity: &str, renewed_secs_ago: i64) -> LeaseRecord {
        LeaseRecord {
            name: "operator-lock".into(),
            holder_identity: Some(identity.into()),
            renew_time: Some(Utc::now() - chrono::Duration::seconds(renewed_secs_ago)),
            lease_duration_seconds: 15,
            lease_transitions: 3,
            resource_version: "7".into(),
        }
    }

    #[tokio::test]
    async fn creates_a_missing_lease_and_becomes_leader() {
        let leases = Arc::new(MemLeases::default());
        let (mut elector, state, _shutdown) = elector(Arc::clone(&leases));
        elector.tick().await;
        assert_eq!(*state.borrow(), LeaderState::Leader);
        assert_eq!(leases.holder().as_deref(), Some("replica-a"));
    }

    #[tokio::test]
    async fn stays_candidate_while_a_fresh_lease_is_held_elsewhere() {
        let leases = Arc::new(MemLeases::default());
        leases.set(held_by("replica-b", 1));
        let (mut elector, state, _shutdown) = elector(Arc::clone(&leases));
        elector.tick().await;
        assert_eq!(*state.borrow(), LeaderState::Candidate);
        assert_eq!(leases.holder().as_deref(), Some("replica-b"));
    }

    #[tokio::test]
    async fn claims_an_expired_lease_and_bumps_transitions() {
        let leases = Arc::new(MemLeases::default());
        leases.set(held_by("replica-b", 60));
        let (mut elector, state, _shutdown) = elector(Arc::clone(&leases));
        elector.tick().await;
        assert_eq!(*state.borrow(), LeaderState::Leader);
        let record = leases.record.lock().clone().unwrap();
        assert_eq!(record.holder_identity.as_deref(), Some("replica-a"));
        assert_eq!(record.lease_transitions, 4);
    }

    #[tokio::test]
    async fn renews_its_own_lease() {
        let leases = Arc::new(MemLeases::default());
        leases.set(held_by("replica-a", 10));
        let (mut elector, state, _shutdown) = elector(Arc::clone(&leases));
        elector.tick().await;
        assert_eq!(*state.borrow(), LeaderState::Leader);
        let record = leases.record.lock().clone().unwrap();
        assert!(record.renew_time.unwrap() > Utc::now() - chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn conflicts_demote_without_erroring() {
        let leases = Arc::new(MemLeases::default());
        leases.set(held_by("replica-a", 10));
        let (mut elector, state, _shutdown) = elector(Arc::clone(&leases));
        elector.tick().await;
        assert_eq!(*state.borrow(), LeaderState::Leader);

        // another writer wins the race between our read and our renewal
        leases.fail_update_next(ClientError::Conflict("lost the renewal race".into()));
        elector.tick().await;
        assert_eq!(*state.borrow(), LeaderState::Candidate);
    }

    #[tokio::test]
    async fn transient_errors_leave_the_state_untouched() {
        let leases = Arc::new(MemLeases::default());
        let (mut elector, state, _shutdown) = elector(Arc::clone(&leases));
        elector.tick().await;
        assert_eq!(*state.borrow(), LeaderState::Leader);

        leases.fail_next(ClientError::Transport("connection reset".into()));
        elector.tick().await;
        // neither promoted nor demoted on an ambiguous failure
        assert_eq!(*state.borrow(), LeaderState::Leader);
    }

    #[tokio::test]
    async fn always_leader_reports_leadership_immediately() {
        let handle = ElectorHandle::always_leader();
        assert!(handle.is_leader());
        handle.shutdown().await;
    }

    #[test]
    fn missing_renew_time_counts_as_expired() {
        let mut record = held_by("replica-b", 0);
        record.renew_time = None;
        assert!(lease_expired(&record));
        assert!(!lease_expired(&held_by("replica-b", 1)));
        assert!(lease_expired(&held_by("replica-b", 60)));
    }

    #[test]
    fn config_validation_rejects_nonsense() {
        assert!(ElectionConfig::new("", "id").validate().is_err());
        assert!(ElectionConfig::new("lock", "").validate().is_err());
        let mut config = ElectionConfig::new("lock", "id");
        config.retry_period = Duration::from_secs(20);
        assert!(config.validate().is_err());
        assert!(ElectionConfig::new("lock", "id").validate().is_ok());
    }
}
