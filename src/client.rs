//! Contracts for the control-plane API client
//!
//! The runtime never talks to the API server directly; it consumes these
//! traits. A production binding wraps an HTTP client, test code wires up an
//! in-memory implementation.

use crate::resource::{ObjectId, Resource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by client implementations, grouped by how the runtime
/// reacts to them.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Error response from the API server
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },
    /// Connection-level failure (reset, timeout, broken stream)
    #[error("transport error: {0}")]
    Transport(String),
    /// A conditional write lost the race against another writer
    #[error("conflicting write: {0}")]
    Conflict(String),
    /// The response payload could not be decoded
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

impl ClientError {
    /// Whether this error means another writer won an optimistic-concurrency
    /// race. Conflicts are expected and retried on the next tick or event.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_) | ClientError::Api { code: 409, .. })
    }

    /// Whether retrying can only reproduce the failure. Decode failures are
    /// the one class a watch subscription gives up on.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Decode(_))
    }
}

/// A single change reported by a watch subscription
#[derive(Clone, Debug)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

/// Scoping and timeout parameters for list/watch calls
#[derive(Clone, Debug)]
pub struct WatchParams {
    /// Restrict the subscription to one namespace
    pub namespace: Option<String>,
    /// Server-side label selector, e.g. `app=widget`
    pub label_selector: Option<String>,
    /// Server-side watch timeout; the server closes the stream cleanly after
    /// this long and the loop re-subscribes
    pub timeout: Duration,
}

impl Default for WatchParams {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            timeout: Duration::from_secs(290),
        }
    }
}

impl WatchParams {
    /// Scope the subscription to `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Restrict the subscription by label selector
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }
}

/// One page-less listing along with the revision token to resume a watch from
#[derive(Clone, Debug)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// The raw change stream handed out by [`ResourceClient::watch`].
///
/// End-of-stream means the server closed the subscription cleanly; the watch
/// loop treats that as a restart trigger, not an error.
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, ClientError>>;

/// Typed CRUD + watch operations for one resource kind
#[async_trait]
pub trait ResourceClient<K: Resource>: Send + Sync + 'static {
    async fn list(&self, params: &WatchParams) -> Result<ObjectList<K>, ClientError>;

    /// Open a streaming watch resuming from `resource_version`
    async fn watch(
        &self,
        params: &WatchParams,
        resource_version: &str,
    ) -> Result<WatchStream<K>, ClientError>;

    async fn get(&self, id: &ObjectId) -> Result<Option<K>, ClientError>;

    async fn create(&self, obj: &K) -> Result<K, ClientError>;

    /// Conditional update keyed on the object's resource version; returns the
    /// stored object with its new revision.
    async fn update(&self, obj: &K) -> Result<K, ClientError>;

    async fn delete(&self, id: &ObjectId) -> Result<(), ClientError>;
}

/// The single mutable record backing leader election.
///
/// `resource_version` is the optimistic-concurrency token; every holder
/// change or renewal must go through a conditional create/update.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaseRecord {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_duration_seconds: u64,
    pub lease_transitions: u32,
    pub resource_version: String,
}

/// Conditional operations on [`LeaseRecord`]s
#[async_trait]
pub trait LeaseClient: Send + Sync + 'static {
    async fn get(&self, name: &str) -> Result<Option<LeaseRecord>, ClientError>;

    /// Create the record; fails with a conflict if it already exists
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, ClientError>;

    /// Update the record conditionally on its resource version
    async fn update(&self, record: &LeaseRecord) -> Result<LeaseRecord, ClientError>;
}
