//! In-memory control plane backing the engine tests
//!
//! Implements both client traits with real conditional-update semantics:
//! revisions bump on every write, stale writers get conflicts, and deletion
//! follows the mark-then-remove finalizer flow.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use futures::{channel::mpsc, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use steward::client::{
    ClientError, LeaseClient, LeaseRecord, ObjectList, ResourceClient, WatchEvent, WatchParams,
    WatchStream,
};
use steward::resource::{Meta, ObjectId, Resource};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Widget {
    pub metadata: Meta,
    pub spec: WidgetSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WidgetStatus>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WidgetSpec {
    pub content: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WidgetStatus {
    pub ready: bool,
}

impl Resource for Widget {
    fn kind() -> &'static str {
        "Widget"
    }

    fn group() -> &'static str {
        "example.dev"
    }

    fn version() -> &'static str {
        "v1"
    }

    fn meta(&self) -> &Meta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut Meta {
        &mut self.metadata
    }
}

pub fn widget(uid: &str, name: &str) -> Widget {
    Widget {
        metadata: Meta {
            name: name.into(),
            uid: uid.into(),
            ..Meta::default()
        },
        spec: WidgetSpec {
            content: "original".into(),
        },
        status: None,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

type Subscriber = mpsc::UnboundedSender<Result<WatchEvent<Widget>, ClientError>>;

#[derive(Default)]
pub struct MemCluster {
    objects: Mutex<BTreeMap<String, Widget>>,
    revision: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Remaining scripted watch failures, consumed one per subscribe attempt
    watch_failures: AtomicU64,
    lease: Mutex<Option<LeaseRecord>>,
    list_calls: AtomicU64,
    watch_calls: AtomicU64,
    update_calls: AtomicU64,
}

impl MemCluster {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn broadcast(&self, event: WatchEvent<Widget>) {
        self.subscribers
            .lock()
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    /// Make the next `failures` subscription attempts fail at the transport
    pub fn fail_watches(&self, failures: u64) {
        self.watch_failures.store(failures, Ordering::SeqCst);
    }

    pub fn stored(&self, uid: &str) -> Option<Widget> {
        self.objects.lock().get(uid).cloned()
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.objects.lock().contains_key(uid)
    }

    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn watch_calls(&self) -> u64 {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn seed_lease(&self, holder: &str, renewed_secs_ago: i64) {
        *self.lease.lock() = Some(LeaseRecord {
            name: "operator-lock".into(),
            holder_identity: Some(holder.into()),
            renew_time: Some(Utc::now() - chrono::Duration::seconds(renewed_secs_ago)),
            lease_duration_seconds: 15,
            lease_transitions: 0,
            resource_version: "1".into(),
        });
    }

    /// Age the stored lease past its duration, as if the holder had died
    pub fn expire_lease(&self) {
        if let Some(record) = self.lease.lock().as_mut() {
            record.renew_time = Some(Utc::now() - chrono::Duration::seconds(60));
        }
    }

    pub fn lease_holder(&self) -> Option<String> {
        self.lease.lock().as_ref().and_then(|r| r.holder_identity.clone())
    }
}

#[async_trait]
impl ResourceClient<Widget> for MemCluster {
    async fn list(&self, _params: &WatchParams) -> Result<ObjectList<Widget>, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ObjectList {
            items: self.objects.lock().values().cloned().collect(),
            resource_version: self.revision.load(Ordering::SeqCst).to_string(),
        })
    }

    async fn watch(
        &self,
        _params: &WatchParams,
        _resource_version: &str,
    ) -> Result<WatchStream<Widget>, ClientError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .watch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::Transport("connection reset by peer".into()));
        }
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        Ok(rx.boxed())
    }

    async fn get(&self, id: &ObjectId) -> Result<Option<Widget>, ClientError> {
        Ok(self.objects.lock().get(&id.uid).cloned())
    }

    async fn create(&self, obj: &Widget) -> Result<Widget, ClientError> {
        let mut created = obj.clone();
        created.metadata.resource_version = self.next_revision();
        {
            let mut objects = self.objects.lock();
            if objects.contains_key(&created.metadata.uid) {
                return Err(ClientError::Conflict(format!(
                    "{} already exists",
                    created.metadata.name
                )));
            }
            objects.insert(created.metadata.uid.clone(), created.clone());
        }
        self.broadcast(WatchEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, obj: &Widget) -> Result<Widget, ClientError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock();
        let current_revision = objects
            .get(&obj.metadata.uid)
            .map(|current| current.metadata.resource_version.clone())
            .ok_or_else(|| ClientError::Api {
                code: 404,
                message: format!("{} not found", obj.metadata.name),
            })?;
        if current_revision != obj.metadata.resource_version {
            return Err(ClientError::Conflict(format!(
                "revision changed for {}",
                obj.metadata.name
            )));
        }
        let mut updated = obj.clone();
        updated.metadata.resource_version = self.next_revision();
        // a terminating object whose finalizer list emptied is removed for real
        let event = if updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.is_empty()
        {
            objects.remove(&obj.metadata.uid);
            WatchEvent::Deleted(updated.clone())
        } else {
            objects.insert(obj.metadata.uid.clone(), updated.clone());
            WatchEvent::Modified(updated.clone())
        };
        drop(objects);
        self.broadcast(event);
        Ok(updated)
    }

    async fn delete(&self, id: &ObjectId) -> Result<(), ClientError> {
        let mut objects = self.objects.lock();
        let Some(mut current) = objects.remove(&id.uid) else {
            return Err(ClientError::Api {
                code: 404,
                message: format!("{id} not found"),
            });
        };
        let event = if current.metadata.finalizers.is_empty() {
            WatchEvent::Deleted(current)
        } else {
            // finalizers pending: only mark for deletion; removal happens
            // once the list empties
            current.metadata.deletion_timestamp = Some(Utc::now());
            current.metadata.resource_version = self.next_revision();
            objects.insert(id.uid.clone(), current.clone());
            WatchEvent::Modified(current)
        };
        drop(objects);
        self.broadcast(event);
        Ok(())
    }
}

#[async_trait]
impl LeaseClient for MemCluster {
    async fn get(&self, _name: &str) -> Result<Option<LeaseRecord>, ClientError> {
        Ok(self.lease.lock().clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, ClientError> {
        let mut stored = self.lease.lock();
        if stored.is_some() {
            return Err(ClientError::Conflict("lease already exists".into()));
        }
        let mut created = record.clone();
        created.resource_version = "1".into();
        *stored = Some(created.clone());
        Ok(created)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, ClientError> {
        let mut stored = self.lease.lock();
        let current = stored
            .as_ref()
            .ok_or_else(|| ClientError::Conflict("lease does not exist".into()))?;
        if current.resource_version != record.resource_version {
            return Err(ClientError::Conflict("lease revision changed".into()));
        }
        let revision: u64 = current.resource_version.parse().unwrap_or(0);
        let mut updated = record.clone();
        updated.resource_version = (revision + 1).to_string();
        *stored = Some(updated.clone());
        Ok(updated)
    }
}
